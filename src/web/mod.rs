//! Metrics HTTP server

mod routes;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::MetricsAggregator;

pub struct AppState {
    pub metrics: Arc<MetricsAggregator>,
}

pub fn router(metrics: Arc<MetricsAggregator>) -> Router {
    let state = Arc::new(AppState { metrics });

    Router::new()
        .route("/metrics", get(routes::metrics))
        .route("/healthz", get(routes::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `/metrics` on `addr` until `shutdown` fires
pub async fn start_server(addr: &str, metrics: Arc<MetricsAggregator>, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind metrics server to {}", addr))?;
    serve(listener, metrics, shutdown).await
}

pub async fn serve(listener: TcpListener, metrics: Arc<MetricsAggregator>, shutdown: CancellationToken) -> Result<()> {
    info!("Metrics server starting on http://{}/metrics", listener.local_addr()?);

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Metrics server stopped");
    Ok(())
}
