//! Axum HTTP server for the operator REST API

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers;
use crate::{Error, Result};

#[derive(Clone)]
pub struct ApiState {
    pub client: kube::Client,
    pub is_leader: Arc<AtomicBool>,
}

pub fn router(state: ApiState) -> Router {
    let router = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/api/v1/clusters", get(handlers::list_clusters))
        .route(
            "/api/v1/clusters/{namespace}/{name}",
            get(handlers::get_cluster),
        );
    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(handlers::metrics));

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the REST API server
pub async fn run_server(state: ApiState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;
    Ok(())
}
