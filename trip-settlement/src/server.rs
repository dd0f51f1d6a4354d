//! Metrics and health endpoints for the consumer process

use crate::metrics;
use axum::{http::StatusCode, routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::export().map_err(|e| {
        error!("Failed to export metrics: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to export metrics: {}", e),
        )
    })
}

/// Serve [`router`] on `addr` until `shutdown` turns true
pub async fn serve(addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics listening on http://{}/metrics", listener.local_addr()?);

    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        })
        .await
}
