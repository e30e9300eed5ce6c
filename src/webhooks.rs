use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::context::AppContext;
use crate::error::{AppError, AppResult};
use crate::tasks::lifecycle::TaskLifecycle;
use crate::tasks::models::Platform;

/// key: webhooks-generation -> provider completion callbacks
///
/// Unknown or webhook-less platforms get 404, a bad signature 401 and a non-JSON body 400.
/// Any JSON body that passes verification is acknowledged with 200 even when it matches no
/// task or cannot be applied, since providers retry non-2xx responses.
pub async fn provider_webhook(
    Extension(ctx): Extension<AppContext>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let platform = Platform::parse(&platform).ok_or(AppError::NotFound)?;
    let adapter = ctx
        .providers
        .get(platform)
        .filter(|adapter| adapter.capabilities().webhook)
        .ok_or(AppError::NotFound)?;

    adapter.verify_webhook(&headers, &body).map_err(|err| {
        warn!(?err, %platform, "rejected webhook delivery");
        AppError::Unauthorized
    })?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("webhook body is not JSON: {err}")))?;

    let update = match adapter.parse_webhook(&payload) {
        Ok(update) => update,
        Err(err) => {
            warn!(?err, %platform, "ignoring unrecognised webhook payload");
            return Ok(Json(json!({ "received": true, "outcome": "ignored" })));
        }
    };

    let external_task_id = update.external_task_id.clone();
    let label = match TaskLifecycle::new(ctx).apply(platform, update).await {
        Ok(outcome) => outcome.label(),
        Err(err) => {
            // The poll and timeout sweep pick the task up again.
            error!(?err, %platform, %external_task_id, "failed to apply webhook delivery");
            "error"
        }
    };
    debug!(%platform, %external_task_id, outcome = label, "webhook applied");
    Ok(Json(json!({ "received": true, "outcome": label })))
}
