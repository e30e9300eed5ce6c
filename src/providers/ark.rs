use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    http_client, missing_input, read_json, required_id, string_field, NormalizedStatus,
    ProviderAdapter, ProviderCapabilities, ProviderError, ProviderSubmission, ProviderUpdate,
    SubmitOutcome,
};
use crate::config::ProviderCredentials;
use crate::tasks::models::Platform;

/// key: provider-ark -> content generation tasks API
pub struct ArkAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ArkAdapter {
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

/// Ark takes generation options as `--flag value` suffixes on the text prompt.
fn prompt_with_options(request: &ProviderSubmission<'_>) -> Option<String> {
    let payload = request.payload;
    let prompt = payload.prompt.as_deref()?.trim();
    if prompt.is_empty() {
        return None;
    }
    let mut text = prompt.to_string();
    if let Some(resolution) = payload.resolution.as_deref() {
        text.push_str(&format!(" --rs {resolution}"));
    }
    if let Some(duration) = payload.duration {
        text.push_str(&format!(" --dur {duration}"));
    }
    if let Some(ratio) = payload.aspect_ratio.as_deref() {
        text.push_str(&format!(" --rt {ratio}"));
    }
    Some(text)
}

#[async_trait]
impl ProviderAdapter for ArkAdapter {
    fn platform(&self) -> Platform {
        Platform::Ark
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
        let text =
            prompt_with_options(&request).ok_or_else(|| missing_input(Platform::Ark, "prompt"))?;
        let mut content = vec![json!({ "type": "text", "text": text })];
        if let Some(image) = request.payload.primary_image() {
            content.push(json!({ "type": "image_url", "image_url": { "url": image } }));
        }
        let mut body = json!({ "model": request.model.name, "content": content });
        if let Some(callback_url) = request.callback_url {
            body["callback_url"] = json!(callback_url);
        }

        let response = self
            .client
            .post(format!("{}/contents/generations/tasks", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let task = read_json(response).await?;
        Ok(SubmitOutcome {
            external_task_id: required_id(&task, "/id")?,
            confirmed: true,
        })
    }

    async fn poll_status(&self, external_task_id: &str) -> Result<NormalizedStatus, ProviderError> {
        let response = self
            .client
            .get(format!(
                "{}/contents/generations/tasks/{external_task_id}",
                self.base_url
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let task = read_json(response).await?;
        Ok(self.parse_webhook(&task)?.status)
    }

    fn parse_webhook(&self, payload: &Value) -> Result<ProviderUpdate, ProviderError> {
        let external_task_id = required_id(payload, "/id")?;
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("queued") | Some("running") => NormalizedStatus::Processing { progress: None },
            Some("succeeded") => match string_field(payload, "/content/video_url") {
                Some(output_url) => NormalizedStatus::Succeeded { output_url },
                None => NormalizedStatus::failed("provider returned no output", Some("NO_OUTPUT")),
            },
            Some("failed") => NormalizedStatus::Failed {
                reason: string_field(payload, "/error/message")
                    .unwrap_or_else(|| "generation failed".into()),
                code: string_field(payload, "/error/code"),
            },
            Some("cancelled") => NormalizedStatus::failed("task cancelled", Some("CANCELED")),
            other => {
                return Err(ProviderError::Malformed(format!(
                    "unknown task status {other:?}"
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
            .delete(format!(
                "{}/contents/generations/tasks/{external_task_id}",
                self.base_url
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProviderError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::find_model;
    use crate::tasks::models::TaskPayload;
    use httpmock::prelude::*;

    fn adapter(base_url: String) -> ArkAdapter {
        ArkAdapter::new(
            &ProviderCredentials {
                api_key: "ark-key".into(),
                base_url,
                webhook_secret: None,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn submit_encodes_options_into_prompt() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/contents/generations/tasks")
                    .json_body_partial(
                        r#"{"model": "doubao-seedance-1-0-pro-250528", "content": [{"type": "text", "text": "a fox --rs 1080p --dur 5"}]}"#,
                    );
                then.status(200).json_body(json!({"id": "cgt-1"}));
            })
            .await;
        let payload = TaskPayload {
            prompt: Some("a fox".into()),
            resolution: Some("1080p".into()),
            duration: Some(5),
            ..TaskPayload::default()
        };
        let outcome = adapter(server.base_url())
            .submit(ProviderSubmission {
                model: find_model("seedance-pro").unwrap(),
                payload: &payload,
                callback_url: None,
            })
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(outcome.external_task_id, "cgt-1");
        assert!(outcome.confirmed);
    }

    #[tokio::test]
    async fn poll_reads_video_url() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/contents/generations/tasks/cgt-1");
                then.status(200).json_body(json!({
                    "id": "cgt-1",
                    "model": "doubao-seedance-1-0-pro-250528",
                    "status": "succeeded",
                    "content": {"video_url": "https://ark.example/v.mp4"}
                }));
            })
            .await;
        let status = adapter(server.base_url()).poll_status("cgt-1").await.unwrap();
        assert_eq!(
            status,
            NormalizedStatus::Succeeded {
                output_url: "https://ark.example/v.mp4".into()
            }
        );
    }

    #[test]
    fn failed_task_keeps_provider_code() {
        let update = adapter("http://unused".into())
            .parse_webhook(&json!({
                "id": "cgt-2",
                "status": "failed",
                "error": {"code": "OutputVideoSensitiveContentDetected", "message": "blocked"}
            }))
            .unwrap();
        assert_eq!(
            update.status,
            NormalizedStatus::failed("blocked", Some("OutputVideoSensitiveContentDetected"))
        );
    }
}
