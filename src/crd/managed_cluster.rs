//! ManagedCluster Custom Resource Definition
//!
//! A ManagedCluster describes one PD (placement driver) deployment: its
//! desired member spec and the observed member, leader and workload state.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ContainerSpec, PdStatus, ServiceConfig};

/// Structured validation error for `ManagedClusterSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "pd.operator.rs",
    version = "v1alpha1",
    kind = "ManagedCluster",
    namespaced,
    status = "ManagedClusterStatus",
    shortname = "mc",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.pd.phase"}"#,
    printcolumn = r#"{"name":"Synced","type":"boolean","jsonPath":".status.pd.synced"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.pd.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    pub pd: PdSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,
}

/// Desired state of the PD members
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PdSpec {
    /// Founding member count; rescaling after bootstrap is not supported
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(flatten)]
    pub container: ContainerSpec,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class_name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub node_selector_required: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub tolerations: Vec<k8s_openapi::api::core::v1::Toleration>,
}

fn default_replicas() -> i32 {
    3
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_scheduler_name() -> String {
    "default-scheduler".to_string()
}

impl ManagedClusterSpec {
    /// Validate the spec before any object is derived from it
    ///
    /// # Errors
    ///
    /// Returns every violation found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.pd.replicas < 1 {
            errors.push(SpecValidationError::new(
                "spec.pd.replicas",
                "PD needs at least one replica",
            ));
        }

        if self.pd.container.image.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.pd.image",
                "image must not be empty",
            ));
        }

        let storage = self
            .pd
            .container
            .requests
            .as_ref()
            .and_then(|r| r.storage.as_deref())
            .unwrap_or("");
        if storage.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.pd.requests.storage",
                "a storage request is required to size the volume claim",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Service type override for a member type, ClusterIP by default
    pub fn service_type(&self, member_type: &str) -> String {
        self.services
            .iter()
            .find(|s| s.name == member_type)
            .map(|s| s.type_.clone())
            .unwrap_or_else(|| "ClusterIP".to_string())
    }
}

/// Observed state of a ManagedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// Cluster identity reported by the PD admin API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    #[serde(default)]
    pub pd: PdStatus,
}
