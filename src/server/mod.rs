//! HTTP surface: the WebSocket control plane plus health and metrics side
//! channels.

pub mod protocol;
pub mod ws;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::gateway::Gateway;

/// Build the gateway's router: `/ws`, `/healthz`, `/metrics`.
pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(gateway)
}

/// Bind and serve until `shutdown` resolves, then stop accepting and let the
/// gateway wind down its runs.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(
    gateway: Gateway,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "control plane listening");

    axum::serve(listener, router(gateway.clone()))
        .with_graceful_shutdown(shutdown)
        .await?;

    gateway.shutdown().await;
    Ok(())
}

async fn healthz(State(gateway): State<Gateway>) -> impl IntoResponse {
    let health = gateway.health().await;
    let status = if health.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn metrics(State(gateway): State<Gateway>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gateway.metrics_text(),
    )
}
