use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use super::{
    first_url, fraction_to_percent, http_client, missing_input, read_json, required_id,
    string_field, NormalizedStatus, ProviderAdapter, ProviderCapabilities, ProviderError,
    ProviderSubmission, ProviderUpdate, SubmitOutcome,
};
use crate::config::ProviderCredentials;
use crate::tasks::models::Platform;

const API_VERSION: &str = "2024-11-06";

/// key: provider-runway -> character performance tasks, poll only
pub struct RunwayAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RunwayAdapter {
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
        builder
            .bearer_auth(&self.api_key)
            .header("X-Runway-Version", API_VERSION)
    }
}

#[async_trait]
impl ProviderAdapter for RunwayAdapter {
    fn platform(&self) -> Platform {
        Platform::Runway
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            webhook: false,
            poll: true,
        }
    }

    async fn submit(
        &self,
        request: ProviderSubmission<'_>,
    ) -> Result<SubmitOutcome, ProviderError> {
        let payload = request.payload;
        let character = payload
            .primary_image()
            .ok_or_else(|| missing_input(Platform::Runway, "image"))?;
        let reference = payload
            .video
            .as_deref()
            .ok_or_else(|| missing_input(Platform::Runway, "video"))?;
        let body = json!({
            "model": request.model.name,
            "character": { "type": "image", "uri": character },
            "reference": { "type": "video", "uri": reference },
            "ratio": payload.aspect_ratio.as_deref().unwrap_or("1280:720"),
            "bodyControl": true,
            "contentModeration": { "publicFigureThreshold": "low" },
        });
        let response = self
            .authorized(
                self.client
                    .post(format!("{}/character_performance", self.base_url)),
            )
            .json(&body)
            .send()
            .await?;
        let task = read_json(response).await?;
        Ok(SubmitOutcome {
            external_task_id: required_id(&task, "/id")?,
            confirmed: false,
        })
    }

    async fn poll_status(&self, external_task_id: &str) -> Result<NormalizedStatus, ProviderError> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/tasks/{external_task_id}", self.base_url)),
            )
            .send()
            .await?;
        let task = read_json(response).await?;
        Ok(self.parse_webhook(&task)?.status)
    }

    fn parse_webhook(&self, payload: &Value) -> Result<ProviderUpdate, ProviderError> {
        let external_task_id = required_id(payload, "/id")?;
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("PENDING") | Some("THROTTLED") => NormalizedStatus::Processing { progress: None },
            Some("RUNNING") => NormalizedStatus::Processing {
                progress: fraction_to_percent(payload.get("progress")),
            },
            Some("SUCCEEDED") => match first_url(payload.get("output")) {
                Some(output_url) => NormalizedStatus::Succeeded { output_url },
                None => NormalizedStatus::failed("provider returned no output", Some("NO_OUTPUT")),
            },
            Some("FAILED") => NormalizedStatus::Failed {
                reason: string_field(payload, "/failure")
                    .unwrap_or_else(|| "generation failed".into()),
                code: string_field(payload, "/failureCode"),
            },
            Some("CANCELLED") => NormalizedStatus::failed("task cancelled", Some("CANCELED")),
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
            .authorized(
                self.client
                    .delete(format!("{}/tasks/{external_task_id}", self.base_url)),
            )
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
    use httpmock::prelude::*;

    fn adapter(base_url: String) -> RunwayAdapter {
        RunwayAdapter::new(
            &ProviderCredentials {
                api_key: "rw-key".into(),
                base_url,
                webhook_secret: None,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn poll_sends_version_header_and_reports_progress() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/tasks/rw-1")
                    .header("x-runway-version", API_VERSION);
                then.status(200)
                    .json_body(json!({"id": "rw-1", "status": "RUNNING", "progress": 0.5}));
            })
            .await;
        let status = adapter(server.base_url()).poll_status("rw-1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(status, NormalizedStatus::Processing { progress: Some(50) });
    }

    #[test]
    fn failure_code_is_carried() {
        let update = adapter("http://unused".into())
            .parse_webhook(&json!({
                "id": "rw-2",
                "status": "FAILED",
                "failure": "Content moderation",
                "failureCode": "SAFETY.INPUT.IMAGE"
            }))
            .unwrap();
        assert_eq!(
            update.status,
            NormalizedStatus::failed("Content moderation", Some("SAFETY.INPUT.IMAGE"))
        );
    }
}
