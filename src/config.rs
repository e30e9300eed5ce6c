use once_cell::sync::Lazy;

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> =
    Lazy::new(|| read_flag("ALLOW_MIGRATION_FAILURE"));

/// Maximum connections held by the Postgres pool. Defaults to `5`.
pub static DATABASE_MAX_CONNECTIONS: Lazy<u32> = Lazy::new(|| {
    std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

/// Public base URL providers call back into, e.g. `https://api.example.com`. The webhook
/// path `/api/generation/webhook/{platform}` is appended per provider. When unset, providers
/// that support callbacks are submitted without one and rely on polling.
pub static WEBHOOK_BASE_URL: Lazy<Option<String>> = Lazy::new(|| {
    let value = read_optional_env("WEBHOOK_BASE_URL")?;
    match url::Url::parse(&value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
            Some(value.trim_end_matches('/').to_string())
        }
        _ => {
            tracing::warn!(%value, "ignoring WEBHOOK_BASE_URL: not an http(s) url");
            None
        }
    }
});

/// Upper bound on a single provider request issued by the reconcile worker. Defaults to `10`
/// seconds.
pub static PROVIDER_POLL_TIMEOUT_SECS: Lazy<u64> =
    Lazy::new(|| read_positive("PROVIDER_POLL_TIMEOUT_SECS", 10));

/// Timeout applied to submission requests against provider APIs. Defaults to `30` seconds.
pub static PROVIDER_SUBMIT_TIMEOUT_SECS: Lazy<u64> =
    Lazy::new(|| read_positive("PROVIDER_SUBMIT_TIMEOUT_SECS", 30));

/// Number of provider polls the reconcile worker may run at once. Defaults to `10`.
pub static RECONCILE_MAX_CONCURRENCY: Lazy<usize> =
    Lazy::new(|| read_positive("RECONCILE_MAX_CONCURRENCY", 10) as usize);

/// Capacity of the reconcile job queue. Jobs offered while the queue is full are dropped.
/// Defaults to `256`.
pub static RECONCILE_QUEUE_DEPTH: Lazy<usize> =
    Lazy::new(|| read_positive("RECONCILE_QUEUE_DEPTH", 256) as usize);

/// Maximum number of in-flight tasks a single reconcile pass inspects. Defaults to `50`.
pub static RECONCILE_BATCH_LIMIT: Lazy<i64> =
    Lazy::new(|| read_positive("RECONCILE_BATCH_LIMIT", 50) as i64);

/// Interval between timeout sweeps across all users. Defaults to `60` seconds.
pub static TIMEOUT_SWEEP_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| read_positive("TIMEOUT_SWEEP_INTERVAL_SECS", 60));

/// Video tasks a single user may have in flight at once. Defaults to `3`.
pub static MAX_CONCURRENT_VIDEO_TASKS: Lazy<i64> =
    Lazy::new(|| read_positive("MAX_CONCURRENT_VIDEO_TASKS", 3) as i64);

/// Upper bound on `num_images` in one submission. Defaults to `4`.
pub static MAX_BATCH_SIZE: Lazy<u32> =
    Lazy::new(|| read_positive("MAX_BATCH_SIZE", 4).min(u64::from(u32::MAX)) as u32);

/// Credentials and endpoint for a single generation provider.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub base_url: String,
    pub webhook_secret: Option<String>,
}

/// Replicate. Enabled when `REPLICATE_API_TOKEN` is set; `REPLICATE_WEBHOOK_SECRET` carries
/// the `whsec_` signing secret.
pub static REPLICATE: Lazy<Option<ProviderCredentials>> = Lazy::new(|| {
    provider_credentials(
        "REPLICATE_API_TOKEN",
        "REPLICATE_BASE_URL",
        Some("REPLICATE_WEBHOOK_SECRET"),
        "https://api.replicate.com/v1",
    )
});

pub static ARK: Lazy<Option<ProviderCredentials>> = Lazy::new(|| {
    provider_credentials(
        "ARK_API_KEY",
        "ARK_BASE_URL",
        None,
        "https://ark.cn-beijing.volces.com/api/v3",
    )
});

pub static RUNWAY: Lazy<Option<ProviderCredentials>> = Lazy::new(|| {
    provider_credentials(
        "RUNWAY_API_KEY",
        "RUNWAY_BASE_URL",
        None,
        "https://api.dev.runwayml.com/v1",
    )
});

pub static LUMA: Lazy<Option<ProviderCredentials>> = Lazy::new(|| {
    provider_credentials(
        "LUMAAI_API_KEY",
        "LUMA_BASE_URL",
        None,
        "https://api.lumalabs.ai/dream-machine/v1",
    )
});

pub static KIE: Lazy<Option<ProviderCredentials>> = Lazy::new(|| {
    provider_credentials("KIE_API_KEY", "KIE_BASE_URL", None, "https://api.kie.ai/api/v1")
});

pub static HEDRA: Lazy<Option<ProviderCredentials>> = Lazy::new(|| {
    provider_credentials(
        "HEDRA_API_KEY",
        "HEDRA_BASE_URL",
        None,
        "https://api.hedra.com/web-app/public",
    )
});

fn provider_credentials(
    key_var: &str,
    base_var: &str,
    secret_var: Option<&str>,
    default_base: &str,
) -> Option<ProviderCredentials> {
    let api_key = read_optional_env(key_var)?;
    Some(ProviderCredentials {
        api_key,
        base_url: read_optional_env(base_var)
            .unwrap_or_else(|| default_base.to_string())
            .trim_end_matches('/')
            .to_string(),
        webhook_secret: secret_var.and_then(read_optional_env),
    })
}

fn read_positive(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
