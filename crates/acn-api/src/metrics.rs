//! Prometheus text exposition.

use acn_kernel::Monitor;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

pub fn router(monitor: Monitor) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(monitor)
}

async fn metrics(State(monitor): State<Monitor>) -> Response {
    match monitor.encode() {
        Some(text) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], text).into_response(),
        None => (StatusCode::NOT_FOUND, "monitoring disabled").into_response(),
    }
}
