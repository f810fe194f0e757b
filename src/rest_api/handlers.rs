//! HTTP handlers for the operator REST API

use std::sync::atomic::Ordering;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::api::{Api, ListParams};
use tracing::{error, instrument};

use super::dto::{ClusterListResponse, ClusterSummary, ErrorResponse, HealthResponse};
use super::server::ApiState;
use crate::crd::ManagedCluster;

type HandlerError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader.load(Ordering::Relaxed),
    })
}

#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, HandlerError> {
    crate::controller::metrics::encode().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("encode_failed", &e.to_string())),
        )
    })
}

/// List every ManagedCluster the operator can see
#[instrument(skip(state))]
pub async fn list_clusters(
    State(state): State<ApiState>,
) -> Result<Json<ClusterListResponse>, HandlerError> {
    let api: Api<ManagedCluster> = Api::all(state.client.clone());

    match api.list(&ListParams::default()).await {
        Ok(clusters) => {
            let items: Vec<ClusterSummary> =
                clusters.items.iter().map(ClusterSummary::from).collect();
            let total = items.len();
            Ok(Json(ClusterListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list clusters: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_cluster(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ClusterSummary>, HandlerError> {
    let api: Api<ManagedCluster> = Api::namespaced(state.client.clone(), &namespace);

    match api.get(&name).await {
        Ok(cluster) => Ok(Json(ClusterSummary::from(&cluster))),
        Err(kube::Error::Api(e)) if e.code == 404 => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("ManagedCluster {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get cluster {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}
