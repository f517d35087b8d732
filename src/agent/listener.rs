//! HTTP endpoint of a registered service.
//!
//! Bound on a random local port before registration, so the port can be
//! advertised in the catalog.

use axum::http::StatusCode;
use axum::{Extension, Json, Router, routing::get};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub service: String,
    pub address: String,
    pub port: u16,
}

/// Binds `127.0.0.1:0` and returns the listener with its actual address.
pub async fn bind_local() -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

pub fn router(info: ServiceInfo) -> Router {
    Router::new()
        .route("/", get(handle_info))
        .route("/health", get(handle_health))
        .layer(Extension(Arc::new(info)))
}

async fn handle_info(Extension(info): Extension<Arc<ServiceInfo>>) -> Json<ServiceInfo> {
    Json(info.as_ref().clone())
}

async fn handle_health() -> StatusCode {
    StatusCode::OK
}

/// Serves until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    info: ServiceInfo,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!("{} listening on {}:{}", info.service, info.address, info.port);

    axum::serve(listener, router(info))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
