use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    compact, http_client, missing_input, read_json, required_id, string_field, NormalizedStatus,
    ProviderAdapter, ProviderCapabilities, ProviderError, ProviderSubmission, ProviderUpdate,
    SubmitOutcome,
};
use crate::config::ProviderCredentials;
use crate::tasks::models::Platform;

/// Luma jobs occasionally stall without ever reporting failure.
const STALL_THRESHOLD_MINUTES: i64 = 15;

/// key: provider-luma -> dream machine modify-video generations
pub struct LumaAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl LumaAdapter {
    pub fn new(
        credentials: &ProviderCredentials,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: credentials.base_url.clone(),
            api_key: credentials.api_key.clone(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for LumaAdapter {
    fn platform(&self) -> Platform {
        Platform::Luma
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            webhook: true,
            poll: true,
        }
    }

    fn timeout_threshold(&self) -> Option<chrono::Duration> {
        Some(chrono::Duration::minutes(STALL_THRESHOLD_MINUTES))
    }

    async fn submit(
        &self,
        request: ProviderSubmission<'_>,
    ) -> Result<SubmitOutcome, ProviderError> {
        let payload = request.payload;
        let video = payload
            .video
            .as_deref()
            .ok_or_else(|| missing_input(Platform::Luma, "video"))?;
        let body = compact(json!({
            "generation_type": "modify_video",
            "model": request.model.name,
            "mode": "flex_1",
            "prompt": payload.prompt,
            "media": { "url": video },
            "first_frame": payload.primary_image().map(|url| json!({ "url": url })),
            "callback_url": request.callback_url,
        }));
        let response = self
            .client
            .post(format!("{}/generations/video/modify", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let generation = read_json(response).await?;
        Ok(SubmitOutcome {
            external_task_id: required_id(&generation, "/id")?,
            confirmed: generation.get("state").and_then(Value::as_str) == Some("dreaming"),
        })
    }

    async fn poll_status(&self, external_task_id: &str) -> Result<NormalizedStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{}/generations/{external_task_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let generation = read_json(response).await?;
        Ok(self.parse_webhook(&generation)?.status)
    }

    fn parse_webhook(&self, payload: &Value) -> Result<ProviderUpdate, ProviderError> {
        let external_task_id = required_id(payload, "/id")?;
        let status = match payload.get("state").and_then(Value::as_str) {
            Some("queued") | Some("dreaming") => NormalizedStatus::Processing { progress: None },
            Some("completed") => match string_field(payload, "/assets/video") {
                Some(output_url) => NormalizedStatus::Succeeded { output_url },
                None => NormalizedStatus::failed("provider returned no output", Some("NO_OUTPUT")),
            },
            Some("failed") => NormalizedStatus::failed(
                string_field(payload, "/failure_reason")
                    .unwrap_or_else(|| "generation failed".into()),
                None,
            ),
            other => {
                return Err(ProviderError::Malformed(format!(
                    "unknown generation state {other:?}"
                )))
            }
        };
        Ok(ProviderUpdate {
            external_task_id,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::find_model;
    use crate::tasks::models::TaskPayload;
    use httpmock::prelude::*;

    fn adapter(base_url: String) -> LumaAdapter {
        LumaAdapter::new(
            &ProviderCredentials {
                api_key: "luma-key".into(),
                base_url,
                webhook_secret: None,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn submit_requires_source_video() {
        let payload = TaskPayload {
            prompt: Some("make it snow".into()),
            ..TaskPayload::default()
        };
        let err = adapter("http://unused".into())
            .submit(ProviderSubmission {
                model: find_model("ray-flash-modify").unwrap(),
                payload: &payload,
                callback_url: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn submit_omits_absent_first_frame() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/generations/video/modify")
                    .json_body(json!({
                        "generation_type": "modify_video",
                        "model": "ray-flash-2",
                        "mode": "flex_1",
                        "prompt": "make it snow",
                        "media": {"url": "https://cdn.example/in.mp4"}
                    }));
                then.status(201)
                    .json_body(json!({"id": "luma-1", "state": "queued"}));
            })
            .await;
        let payload = TaskPayload {
            prompt: Some("make it snow".into()),
            video: Some("https://cdn.example/in.mp4".into()),
            ..TaskPayload::default()
        };
        let outcome = adapter(server.base_url())
            .submit(ProviderSubmission {
                model: find_model("ray-flash-modify").unwrap(),
                payload: &payload,
                callback_url: None,
            })
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(outcome.external_task_id, "luma-1");
        assert!(!outcome.confirmed);
    }

    #[test]
    fn completed_generation_yields_video_asset() {
        let update = adapter("http://unused".into())
            .parse_webhook(&json!({
                "id": "luma-1",
                "state": "completed",
                "assets": {"video": "https://luma.example/out.mp4"}
            }))
            .unwrap();
        assert_eq!(
            update.status,
            NormalizedStatus::Succeeded {
                output_url: "https://luma.example/out.mp4".into()
            }
        );
    }

    #[test]
    fn advertises_stall_threshold() {
        let adapter = adapter("http://unused".into());
        assert_eq!(
            adapter.timeout_threshold(),
            Some(chrono::Duration::minutes(15))
        );
    }
}
