use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use super::{
    compact, fraction_to_percent, http_client, missing_input, read_json, required_id,
    string_field, NormalizedStatus, ProviderAdapter, ProviderCapabilities, ProviderError,
    ProviderSubmission, ProviderUpdate, SettlementMode, SubmitOutcome,
};
use crate::config::ProviderCredentials;
use crate::tasks::models::Platform;

/// key: provider-hedra -> talking-head generations settled against a reservation
pub struct HedraAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HedraAdapter {
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

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("x-api-key", &self.api_key)
    }
}

#[async_trait]
impl ProviderAdapter for HedraAdapter {
    fn platform(&self) -> Platform {
        Platform::Hedra
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            webhook: false,
            poll: true,
        }
    }

    fn settlement_mode(&self) -> SettlementMode {
        SettlementMode::Reservation
    }

    async fn submit(
        &self,
        request: ProviderSubmission<'_>,
    ) -> Result<SubmitOutcome, ProviderError> {
        let payload = request.payload;
        let image = payload
            .primary_image()
            .ok_or_else(|| missing_input(Platform::Hedra, "image"))?;
        let audio = payload
            .audio
            .as_deref()
            .ok_or_else(|| missing_input(Platform::Hedra, "audio"))?;
        let body = json!({
            "type": "video",
            "ai_model_id": request.model.name,
            "start_keyframe_url": image,
            "audio_url": audio,
            "generated_video_inputs": compact(json!({
                "text_prompt": payload.prompt.as_deref().unwrap_or("A person talking"),
                "resolution": payload.resolution.as_deref().unwrap_or("540p"),
                "aspect_ratio": payload.aspect_ratio.as_deref().unwrap_or("1:1"),
                "duration_ms": payload.duration.map(|seconds| u64::from(seconds) * 1000),
            })),
        });
        let response = self
            .authorized(self.client.post(format!("{}/generations", self.base_url)))
            .json(&body)
            .send()
            .await?;
        let generation = read_json(response).await?;
        Ok(SubmitOutcome {
            external_task_id: required_id(&generation, "/id")?,
            confirmed: false,
        })
    }

    async fn poll_status(&self, external_task_id: &str) -> Result<NormalizedStatus, ProviderError> {
        let response = self
            .authorized(self.client.get(format!(
                "{}/generations/{external_task_id}/status",
                self.base_url
            )))
            .send()
            .await?;
        let status = read_json(response).await?;
        Ok(self.parse_webhook(&status)?.status)
    }

    fn parse_webhook(&self, payload: &Value) -> Result<ProviderUpdate, ProviderError> {
        let external_task_id = required_id(payload, "/id")?;
        let progress = fraction_to_percent(payload.get("progress"));
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("queued") | Some("pending") | Some("processing") | Some("finalizing") => {
                NormalizedStatus::Processing { progress }
            }
            Some("complete") => match (
                string_field(payload, "/url"),
                string_field(payload, "/error_message"),
            ) {
                (Some(output_url), _) => NormalizedStatus::Succeeded { output_url },
                (None, Some(error)) => NormalizedStatus::failed(error, None),
                // Completion is reported before the asset url is attached.
                (None, None) => NormalizedStatus::Processing {
                    progress: Some(progress.unwrap_or(95).min(99)),
                },
            },
            Some("error") => NormalizedStatus::failed(
                string_field(payload, "/error_message")
                    .unwrap_or_else(|| "generation failed".into()),
                None,
            ),
            other => {
                return Err(ProviderError::Malformed(format!(
                    "unknown generation status {other:?}"
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
    use httpmock::prelude::*;

    fn adapter(base_url: String) -> HedraAdapter {
        HedraAdapter::new(
            &ProviderCredentials {
                api_key: "hedra-key".into(),
                base_url,
                webhook_secret: None,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn settles_through_reservation() {
        let adapter = adapter("http://unused".into());
        assert_eq!(adapter.settlement_mode(), SettlementMode::Reservation);
        assert!(!adapter.capabilities().webhook);
    }

    #[test]
    fn complete_without_url_is_still_processing() {
        let update = adapter("http://unused".into())
            .parse_webhook(&json!({"id": "h-1", "status": "complete", "progress": 1.0}))
            .unwrap();
        assert_eq!(update.status, NormalizedStatus::Processing { progress: Some(99) });
    }

    #[tokio::test]
    async fn poll_uses_api_key_header() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/generations/h-1/status")
                    .header("x-api-key", "hedra-key");
                then.status(200).json_body(json!({
                    "id": "h-1",
                    "status": "complete",
                    "url": "https://hedra.example/talk.mp4"
                }));
            })
            .await;
        let status = adapter(server.base_url()).poll_status("h-1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(
            status,
            NormalizedStatus::Succeeded {
                output_url: "https://hedra.example/talk.mp4".into()
            }
        );
    }
}
