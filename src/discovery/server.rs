//! Axum HTTP transport for the bootstrap coordinator

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Router,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

use super::coordinator::Coordinator;
use super::registry::ClusterKey;
use crate::{Error, Result};

/// Delay before the listener is started again after it failed
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DiscoveryState {
    pub coordinator: Arc<Coordinator>,
    /// Cluster whose routing document `/proxy-config` serves
    pub proxy_cluster: Option<ClusterKey>,
}

type HandlerError = (StatusCode, String);

fn internal_error(e: Error) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(feature = "metrics")]
fn record_outcome(result: &Result<String>) {
    let outcome = match result {
        Ok(args) if args.starts_with("--join") => "join",
        Ok(_) => "initial_cluster",
        Err(e) => e.kind(),
    };
    crate::controller::metrics::inc_discover(outcome);
}

/// Decode the base64 path segment; the standard alphabet first, URL-safe second
pub fn decode_peer_url(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .map_err(|e| Error::Malformed(format!("advertise peer URL is not base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| Error::Malformed(format!("advertise peer URL is not UTF-8: {e}")))
}

#[instrument(skip(state))]
async fn new_member(
    State(state): State<DiscoveryState>,
    Path(encoded): Path<String>,
) -> std::result::Result<String, HandlerError> {
    let advertise_peer_url = decode_peer_url(&encoded).map_err(|e| {
        error!("Failed to decode advertise-peer-url {}: {}", encoded, e);
        internal_error(e)
    })?;

    let result = state.coordinator.discover(&advertise_peer_url).await;
    #[cfg(feature = "metrics")]
    record_outcome(&result);

    match result {
        Ok(args) => {
            info!("Generated PD args for {}: {}", advertise_peer_url, args);
            Ok(args)
        }
        Err(e) => {
            error!("Failed to discover {}: {}", advertise_peer_url, e);
            Err(internal_error(e))
        }
    }
}

#[instrument(skip(state))]
async fn proxy_config(
    State(state): State<DiscoveryState>,
) -> std::result::Result<String, HandlerError> {
    let key = state.proxy_cluster.as_ref().ok_or_else(|| {
        internal_error(Error::ConfigError(
            "no cluster configured for /proxy-config".to_string(),
        ))
    })?;

    match state.coordinator.get_proxy_config(key).await {
        Ok(doc) => {
            info!("Generated proxy config: {}", doc);
            Ok(doc)
        }
        Err(e) => {
            error!("Failed to build proxy config for {}: {}", key, e);
            Err(internal_error(e))
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> std::result::Result<String, HandlerError> {
    crate::controller::metrics::encode()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

pub fn router(state: DiscoveryState) -> Router {
    let router = Router::new()
        .route("/new/{*advertise_peer_url}", get(new_member))
        .route("/proxy-config", get(proxy_config))
        .route("/healthz", get(healthz));
    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the discovery API until the listener fails
pub async fn run_server(state: DiscoveryState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Starting PD discovery server, listening on {}", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;
    Ok(())
}

/// Keep the discovery server up, restarting it after every exit
pub async fn serve_forever(state: DiscoveryState, port: u16) {
    loop {
        match run_server(state.clone(), port).await {
            Ok(()) => warn!("Discovery server exited"),
            Err(e) => error!("Discovery server failed: {}", e),
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}
