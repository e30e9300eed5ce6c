use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    compact, http_client, read_json, required_id, string_field, NormalizedStatus, ProviderAdapter,
    ProviderCapabilities, ProviderError, ProviderSubmission, ProviderUpdate, SubmitOutcome,
};
use crate::config::ProviderCredentials;
use crate::tasks::models::Platform;

/// key: provider-kie -> job API with callback-only completion
pub struct KieAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl KieAdapter {
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

fn envelope_code(payload: &Value) -> Option<i64> {
    payload.get("code").and_then(Value::as_i64)
}

/// `resultJson` is a JSON document encoded as a string.
fn result_url(data: &Value) -> Result<Option<String>, String> {
    let Some(raw) = data.get("resultJson").and_then(Value::as_str) else {
        return Ok(None);
    };
    let parsed: Value = serde_json::from_str(raw).map_err(|err| err.to_string())?;
    Ok(super::first_url(parsed.get("resultUrls")))
}

#[async_trait]
impl ProviderAdapter for KieAdapter {
    fn platform(&self) -> Platform {
        Platform::Kie
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            webhook: true,
            poll: false,
        }
    }

    async fn submit(
        &self,
        request: ProviderSubmission<'_>,
    ) -> Result<SubmitOutcome, ProviderError> {
        let payload = request.payload;
        let image_urls: Vec<&str> = payload.primary_image().into_iter().collect();
        let mut input = compact(json!({
            "prompt": payload.prompt,
            "aspect_ratio": payload.aspect_ratio,
            "n_frames": payload.duration.map(|seconds| seconds.to_string()),
        }));
        if !image_urls.is_empty() {
            input["image_urls"] = json!(image_urls);
        }
        let body = compact(json!({
            "model": request.model.name,
            "callBackUrl": request.callback_url,
            "input": input,
        }));
        let response = self
            .client
            .post(format!("{}/jobs/createTask", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let envelope = read_json(response).await?;
        if envelope_code(&envelope) != Some(200) {
            return Err(ProviderError::Rejected {
                status: envelope_code(&envelope)
                    .and_then(|code| u16::try_from(code).ok())
                    .unwrap_or(502),
                body: string_field(&envelope, "/msg").unwrap_or_default(),
            });
        }
        Ok(SubmitOutcome {
            external_task_id: required_id(&envelope, "/data/taskId")?,
            confirmed: false,
        })
    }

    async fn poll_status(
        &self,
        _external_task_id: &str,
    ) -> Result<NormalizedStatus, ProviderError> {
        Err(ProviderError::Unsupported {
            platform: Platform::Kie,
            operation: "polling",
        })
    }

    fn parse_webhook(&self, payload: &Value) -> Result<ProviderUpdate, ProviderError> {
        let data = payload
            .get("data")
            .ok_or_else(|| ProviderError::Malformed("missing `data` envelope".into()))?;
        let external_task_id = required_id(data, "/taskId")?;
        let code = envelope_code(payload);
        let state = data.get("state").and_then(Value::as_str);

        let status = if code.map_or(false, |code| code != 200) || state == Some("fail") {
            NormalizedStatus::Failed {
                reason: string_field(data, "/failMsg")
                    .or_else(|| string_field(payload, "/msg"))
                    .unwrap_or_else(|| "generation failed".into()),
                code: string_field(data, "/failCode").or_else(|| code.map(|c| c.to_string())),
            }
        } else {
            match state {
                Some("waiting") | Some("queuing") | Some("generating") => {
                    NormalizedStatus::Processing { progress: None }
                }
                Some("success") => match result_url(data) {
                    Ok(Some(output_url)) => NormalizedStatus::Succeeded { output_url },
                    Ok(None) => {
                        NormalizedStatus::failed("provider returned no output", Some("NO_OUTPUT"))
                    }
                    Err(err) => NormalizedStatus::failed(
                        format!("unreadable resultJson: {err}"),
                        Some("PARSE_ERROR"),
                    ),
                },
                other => {
                    return Err(ProviderError::Malformed(format!(
                        "unknown job state {other:?}"
                    )))
                }
            }
        };
        Ok(ProviderUpdate {
            external_task_id,
            status,
        })
    }
}
