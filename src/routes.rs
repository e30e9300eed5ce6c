use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};

use crate::context::AppContext;
use crate::reconciler::ReconcileHandle;
use crate::{tasks, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/generation/submit", post(tasks::api::submit_generation))
        .route("/api/generation/query", post(tasks::api::query_generations))
        .route(
            "/api/generation/webhook/:platform",
            post(webhooks::provider_webhook),
        )
        .route("/api/credits", get(tasks::api::credit_balance))
}

async fn root() -> &'static str {
    "Generation API"
}

/// Full application router minus the metrics layer, which can only be installed once per
/// process.
pub fn app(ctx: AppContext, reconciler: ReconcileHandle) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(ctx))
        .layer(Extension(reconciler))
}
