use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;

use super::{
    compact, first_url, http_client, read_json, required_id, string_field, NormalizedStatus,
    ProviderAdapter, ProviderCapabilities, ProviderError, ProviderSubmission, ProviderUpdate,
    SubmitOutcome,
};
use crate::config::ProviderCredentials;
use crate::tasks::models::Platform;

/// Deliveries signed further than this from the local clock are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// key: provider-replicate -> predictions API with signed completion webhooks
pub struct ReplicateAdapter {
    client: Client,
    base_url: String,
    api_token: String,
    webhook_secret: Option<String>,
}

impl ReplicateAdapter {
    pub fn new(
        credentials: &ProviderCredentials,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: credentials.base_url.clone(),
            api_token: credentials.api_key.clone(),
            webhook_secret: credentials.webhook_secret.clone(),
        })
    }

    fn build_input(request: &ProviderSubmission<'_>) -> Value {
        let payload = request.payload;
        match request.model.id {
            "flux-schnell" => compact(json!({
                "prompt": payload.prompt,
                "aspect_ratio": payload.aspect_ratio,
            })),
            "ray-flash-v2v" => compact(json!({
                "video": payload.video,
                "prompt": payload.prompt,
                "start_image": payload.primary_image(),
                "aspect_ratio": payload.aspect_ratio,
            })),
            _ => compact(json!({
                "prompt": payload.prompt,
                "first_frame_image": payload.primary_image(),
                "duration": payload.duration,
                "resolution": payload.resolution,
                "aspect_ratio": payload.aspect_ratio,
            })),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ReplicateAdapter {
    fn platform(&self) -> Platform {
        Platform::Replicate
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            webhook: true,
            poll: true,
        }
    }

    async fn submit(
        &self,
        request: ProviderSubmission<'_>,
    ) -> Result<SubmitOutcome, ProviderError> {
        let mut body = json!({ "input": Self::build_input(&request) });
        if let Some(callback_url) = request.callback_url {
            body["webhook"] = json!(callback_url);
            body["webhook_events_filter"] = json!(["completed"]);
        }
        let url = match request.model.name.split_once(':') {
            Some((_, version)) => {
                body["version"] = json!(version);
                format!("{}/predictions", self.base_url)
            }
            None => format!("{}/models/{}/predictions", self.base_url, request.model.name),
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        let prediction = read_json(response).await?;
        Ok(SubmitOutcome {
            external_task_id: required_id(&prediction, "/id")?,
            confirmed: prediction.get("status").and_then(Value::as_str) == Some("processing"),
        })
    }

    async fn poll_status(&self, external_task_id: &str) -> Result<NormalizedStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{}/predictions/{external_task_id}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let prediction = read_json(response).await?;
        Ok(self.parse_webhook(&prediction)?.status)
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ProviderError> {
        let secret = self
            .webhook_secret
            .as_deref()
            .ok_or_else(|| ProviderError::InvalidSignature("no signing secret configured".into()))?;
        verify_signature(secret, headers, body, chrono::Utc::now().timestamp())
    }

    fn parse_webhook(&self, payload: &Value) -> Result<ProviderUpdate, ProviderError> {
        let external_task_id = required_id(payload, "/id")?;
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("starting") | Some("processing") => {
                NormalizedStatus::Processing { progress: None }
            }
            Some("succeeded") => match first_url(payload.get("output")) {
                Some(output_url) => NormalizedStatus::Succeeded { output_url },
                None => NormalizedStatus::failed("provider returned no output", Some("NO_OUTPUT")),
            },
            Some("failed") => NormalizedStatus::failed(
                string_field(payload, "/error").unwrap_or_else(|| "generation failed".into()),
                None,
            ),
            Some("canceled") => NormalizedStatus::failed("prediction canceled", Some("CANCELED")),
            other => {
                return Err(ProviderError::Malformed(format!(
                    "unknown prediction status {other:?}"
                )))
            }
        };
        Ok(ProviderUpdate {
            external_task_id,
            status,
        })
    }

    async fn cancel(&self, external_task_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(format!(
                "{}/predictions/{external_task_id}/cancel",
                self.base_url
            ))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        read_json(response).await.map(|_| ())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProviderError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ProviderError::InvalidSignature(format!("missing {name} header")))
}

/// Checks a `webhook-signature` header: HMAC-SHA256 over `{id}.{timestamp}.{body}` keyed with
/// the base64 part of a `whsec_` secret. The header may list several space-separated
/// `v1,<base64>` signatures; any match passes.
pub fn verify_signature(
    secret: &str,
    headers: &HeaderMap,
    body: &[u8],
    now: i64,
) -> Result<(), ProviderError> {
    let id = header(headers, "webhook-id")?;
    let timestamp = header(headers, "webhook-timestamp")?;
    let signatures = header(headers, "webhook-signature")?;

    let sent_at: i64 = timestamp
        .parse()
        .map_err(|_| ProviderError::InvalidSignature("timestamp is not a number".into()))?;
    if (now - sent_at).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(ProviderError::InvalidSignature(
            "timestamp outside tolerance".into(),
        ));
    }

    let key = STANDARD
        .decode(secret.strip_prefix("whsec_").unwrap_or(secret))
        .map_err(|_| ProviderError::InvalidSignature("signing secret is not base64".into()))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|_| ProviderError::InvalidSignature("unusable signing secret".into()))?;
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);

    let matched = signatures
        .split_whitespace()
        .filter_map(|entry| entry.strip_prefix("v1,"))
        .filter_map(|encoded| STANDARD.decode(encoded).ok())
        .any(|candidate| mac.clone().verify_slice(&candidate).is_ok());
    if matched {
        Ok(())
    } else {
        Err(ProviderError::InvalidSignature("no matching signature".into()))
    }
}
