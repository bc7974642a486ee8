use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tracing::info;

use super::RpcServer;

/// Build the HTTP transport router: JSON-RPC frames on `POST /`, plus a
/// health probe.
pub fn build_router(server: Arc<RpcServer>) -> Router {
    Router::new()
        .route("/", post(rpc_handler))
        .route("/health", get(health_handler))
        .with_state(server)
}

/// Serve JSON-RPC over HTTP on `addr` until the process exits.
pub async fn serve(server: Arc<RpcServer>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {}", addr))?;
    info!("HTTP JSON-RPC server listening on {}", addr);
    axum::serve(listener, build_router(server))
        .await
        .context("HTTP server failed")?;
    Ok(())
}

/// POST / — one JSON-RPC request per HTTP request. Notifications get an
/// empty 204 since there is no frame to return.
async fn rpc_handler(
    State(server): State<Arc<RpcServer>>,
    Json(frame): Json<Value>,
) -> impl IntoResponse {
    match server.handle_value(frame).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}
