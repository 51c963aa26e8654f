//! HTTP routes

use axum::{extract::State, http::header, response::IntoResponse};
use std::sync::Arc;

use super::AppState;

/// Prometheus scrape endpoint
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
        state.metrics.gather(),
    )
}

pub async fn healthz() -> &'static str {
    "ok"
}
