//! Response bodies for the operator REST API

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::crd::{ManagedCluster, MemberPhase};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether this replica currently holds the leader lease
    pub leader: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub phase: MemberPhase,
    pub synced: bool,
    pub leader: Option<String>,
    pub members: usize,
    pub healthy_members: usize,
}

impl From<&ManagedCluster> for ClusterSummary {
    fn from(cluster: &ManagedCluster) -> Self {
        let pd = cluster.status.as_ref().map(|s| &s.pd);
        let leader = pd
            .map(|pd| pd.leader.name.clone())
            .filter(|name| !name.is_empty());
        Self {
            name: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            replicas: cluster.spec.pd.replicas,
            phase: pd.map(|pd| pd.phase).unwrap_or_default(),
            synced: pd.map(|pd| pd.synced).unwrap_or(false),
            leader,
            members: pd.map(|pd| pd.members.len()).unwrap_or(0),
            healthy_members: pd
                .map(|pd| pd.members.values().filter(|m| m.health).count())
                .unwrap_or(0),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterListResponse {
    pub items: Vec<ClusterSummary>,
    pub total: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
