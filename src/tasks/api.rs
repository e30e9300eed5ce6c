use axum::{extract::Extension, Json};
use serde::Serialize;
use serde_json::{json, Value};

use super::query::{QueryService, TaskQuery, TaskView};
use super::submission::{GenerationRequest, SubmissionService, SubmitResponse};
use crate::context::AppContext;
use crate::error::AppResult;
use crate::extractor::AuthUser;
use crate::reconciler::ReconcileHandle;

pub async fn submit_generation(
    Extension(ctx): Extension<AppContext>,
    AuthUser { user_id }: AuthUser,
    Json(request): Json<GenerationRequest>,
) -> AppResult<Json<SubmitResponse>> {
    let response = SubmissionService::new(ctx).submit(user_id, request).await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub tasks: Vec<TaskView>,
}

pub async fn query_generations(
    Extension(ctx): Extension<AppContext>,
    Extension(reconciler): Extension<ReconcileHandle>,
    AuthUser { user_id }: AuthUser,
    Json(query): Json<TaskQuery>,
) -> AppResult<Json<TaskList>> {
    let tasks = QueryService::new(ctx, reconciler)
        .query(user_id, query)
        .await?;
    Ok(Json(TaskList { tasks }))
}

pub async fn credit_balance(
    Extension(ctx): Extension<AppContext>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<Value>> {
    let balance = ctx.ledger.balance(user_id).await?;
    Ok(Json(json!({ "balance": balance })))
}
