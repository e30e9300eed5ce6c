mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use generation_backend::reconciler::ReconcileHandle;
use generation_backend::routes;
use tower::ServiceExt;

#[tokio::test]
async fn metrics_returns_ok() {
    let h = common::harness(vec![]);
    let (reconciler, _jobs) = ReconcileHandle::detached(4);
    let (layer, handle) = PrometheusMetricLayer::pair();
    let app = routes::app(h.ctx.clone(), reconciler)
        .route("/metrics", get(move || async move { handle.render() }))
        .layer(layer);
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
