//! Provider adapters. Each one translates between a generation vendor's wire format and
//! [`NormalizedStatus`], so the lifecycle code never sees vendor payloads.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::{Client, Response};
use serde_json::Value;
use thiserror::Error;

use crate::pricing::ModelSpec;
use crate::tasks::models::{Platform, TaskPayload};

pub mod ark;
pub mod hedra;
pub mod kie;
pub mod luma;
pub mod registry;
pub mod replicate;
pub mod runway;

pub use registry::ProviderRegistry;

/// Failure code recorded when a task outlives its provider's timeout threshold.
pub const TIMEOUT_FAILURE_CODE: &str = "TIMEOUT";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected request with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed provider payload: {0}")]
    Malformed(String),
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("{platform} does not support {operation}")]
    Unsupported {
        platform: Platform,
        operation: &'static str,
    },
}

/// Provider status reduced to what the task lifecycle acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedStatus {
    Processing { progress: Option<u8> },
    Succeeded { output_url: String },
    Failed { reason: String, code: Option<String> },
}

impl NormalizedStatus {
    pub fn failed(reason: impl Into<String>, code: Option<&str>) -> Self {
        NormalizedStatus::Failed {
            reason: reason.into(),
            code: code.map(str::to_string),
        }
    }
}

/// A status report tied to the provider job it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderUpdate {
    pub external_task_id: String,
    pub status: NormalizedStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub webhook: bool,
    pub poll: bool,
}

/// When credits move for jobs on a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementMode {
    /// Charge the quoted cost when the job succeeds.
    OnCompletion,
    /// Record a reservation at submission and settle it when the job finishes.
    Reservation,
}

pub struct ProviderSubmission<'a> {
    pub model: &'a ModelSpec,
    pub payload: &'a TaskPayload,
    pub callback_url: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub external_task_id: String,
    /// Provider confirmed the job is running, so the task starts as processing.
    pub confirmed: bool,
}

/// key: provider-adapter -> vendor integration seam
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn capabilities(&self) -> ProviderCapabilities;

    fn settlement_mode(&self) -> SettlementMode {
        SettlementMode::OnCompletion
    }

    /// Age after which an unfinished task is failed with [`TIMEOUT_FAILURE_CODE`].
    fn timeout_threshold(&self) -> Option<chrono::Duration> {
        None
    }

    async fn submit(&self, request: ProviderSubmission<'_>) -> Result<SubmitOutcome, ProviderError>;

    async fn poll_status(&self, external_task_id: &str) -> Result<NormalizedStatus, ProviderError>;

    /// Checks a webhook delivery against the provider's signing scheme.
    fn verify_webhook(&self, _headers: &HeaderMap, _body: &[u8]) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Normalizes a provider status document. Webhook bodies and poll responses share this.
    fn parse_webhook(&self, payload: &Value) -> Result<ProviderUpdate, ProviderError>;

    async fn cancel(&self, _external_task_id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            platform: self.platform(),
            operation: "cancel",
        })
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client, ProviderError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Reads a JSON body, mapping non-success statuses to [`ProviderError::Rejected`].
pub(crate) async fn read_json(response: Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<Value>().await?)
}

/// Drops null fields so optional inputs are omitted rather than sent as `null`.
pub(crate) fn compact(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.retain(|_, v| !v.is_null());
    }
    value
}

pub(crate) fn string_field(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Output fields arrive either as a single url or a list of urls.
pub(crate) fn first_url(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(url) if !url.trim().is_empty() => Some(url.clone()),
        Value::Array(items) => items.iter().find_map(|item| first_url(Some(item))),
        _ => None,
    }
}

pub(crate) fn required_id(value: &Value, pointer: &str) -> Result<String, ProviderError> {
    string_field(value, pointer)
        .ok_or_else(|| ProviderError::Malformed(format!("missing `{pointer}` in provider payload")))
}

/// Percent progress from a 0..=1 fraction.
pub(crate) fn fraction_to_percent(value: Option<&Value>) -> Option<u8> {
    let fraction = value?.as_f64()?;
    Some((fraction.clamp(0.0, 1.0) * 100.0).round() as u8)
}

pub(crate) fn missing_input(platform: Platform, input: &str) -> ProviderError {
    ProviderError::InvalidParams(format!("{platform} requires `{input}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_url_accepts_string_or_list() {
        assert_eq!(
            first_url(Some(&json!("https://cdn.example/a.mp4"))),
            Some("https://cdn.example/a.mp4".into())
        );
        assert_eq!(
            first_url(Some(&json!(["", "https://cdn.example/b.mp4"]))),
            Some("https://cdn.example/b.mp4".into())
        );
        assert_eq!(first_url(Some(&json!(null))), None);
        assert_eq!(first_url(None), None);
    }

    #[test]
    fn compact_drops_nulls_only() {
        let value = compact(json!({"prompt": "hi", "image": null, "duration": 0}));
        assert_eq!(value, json!({"prompt": "hi", "duration": 0}));
    }

    #[test]
    fn fraction_is_clamped() {
        assert_eq!(fraction_to_percent(Some(&json!(0.42))), Some(42));
        assert_eq!(fraction_to_percent(Some(&json!(3.0))), Some(100));
        assert_eq!(fraction_to_percent(Some(&json!("x"))), None);
    }
}
