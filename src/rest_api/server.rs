//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers;
use crate::backend::Backend;
use crate::error::{Error, Result};

pub fn router(backend: Arc<dyn Backend>) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/containers", get(handlers::list_containers))
        .route("/api/v1/containers/{app_id}", get(handlers::get_container))
        .route(
            "/api/v1/containers/{app_id}/restart",
            post(handlers::restart_container),
        )
        .route(
            "/api/v1/containers/{app_id}/logs",
            get(handlers::container_logs),
        );
    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(handlers::metrics));

    router.layer(TraceLayer::new_for_http()).with_state(backend)
}

/// Run the REST API server until the listener fails
pub async fn run_server(addr: SocketAddr, backend: Arc<dyn Backend>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, router(backend))
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;
    Ok(())
}
