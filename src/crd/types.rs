//! Shared types for the ManagedCluster CRD

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Member types managed by this operator
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum MemberType {
    #[serde(rename = "pd")]
    Pd,
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberType::Pd => write!(f, "pd"),
        }
    }
}

/// Compute and storage quantities, kept as Kubernetes quantity strings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

/// Container-level settings for a member type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
}

/// Per-member-type service exposure override
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Member type this override applies to, e.g. "pd"
    pub name: String,
    /// Kubernetes Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(rename = "type")]
    pub type_: String,
}

/// Lifecycle phase of the PD member set
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MemberPhase {
    #[default]
    Normal,
    Upgrading,
}

impl fmt::Display for MemberPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberPhase::Normal => write!(f, "Normal"),
            MemberPhase::Upgrading => write!(f, "Upgrading"),
        }
    }
}

/// One PD member as reported by the admin API
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PdMember {
    pub name: String,
    /// Member ID in decimal form
    pub id: String,
    #[serde(rename = "clientURL")]
    pub client_url: String,
    pub health: bool,
    /// RFC3339 time of the last health flip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// A member marked for replacement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PdFailureMember {
    pub pod_name: String,
    #[serde(default)]
    pub member_id: String,
    /// The member was removed from the PD cluster; its replacement pod
    /// counts on top of the desired replicas until cleanup
    #[serde(default)]
    pub member_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Observed state of the PD member set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PdStatus {
    #[serde(default)]
    pub phase: MemberPhase,

    /// True only when the last admin API poll succeeded end to end
    #[serde(default)]
    pub synced: bool,

    #[serde(default)]
    pub members: BTreeMap<String, PdMember>,

    #[serde(default)]
    pub leader: PdMember,

    #[serde(default)]
    pub failure_members: BTreeMap<String, PdFailureMember>,

    /// Mirror of the live StatefulSet status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub stateful_set: Option<k8s_openapi::api::apps::v1::StatefulSetStatus>,
}

impl PdStatus {
    /// Number of failure members already deleted from the PD cluster
    pub fn deleted_failure_count(&self) -> i32 {
        self.failure_members
            .values()
            .filter(|m| m.member_deleted)
            .count() as i32
    }
}
