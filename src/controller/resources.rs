//! Kubernetes object builders for ManagedCluster PD members
//!
//! Desired objects are derived fresh from the spec on every pass. The
//! last-applied annotation stamped on each written object is what later
//! passes diff against, so fields defaulted or assigned by the platform
//! never read as drift.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, ContainerPort, DownwardAPIVolumeFile,
    DownwardAPIVolumeSource, EnvVar, EnvVarSource, KeyToPath, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, PreferredSchedulingTerm,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crd::{ManagedCluster, MemberType, ResourceSpec};
use crate::error::{Error, Result};

/// Annotation holding the JSON of the last spec this operator applied
pub const LAST_APPLIED_CONFIG_ANNOTATION: &str = "pd.operator.rs/last-applied-configuration";

/// Pod label the StatefulSet controller stamps with the pod's revision
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";

pub const INSTANCE_LABEL_KEY: &str = "app.kubernetes.io/instance";

pub const CLIENT_PORT: i32 = 2379;
pub const PEER_PORT: i32 = 2380;
pub const RPC_PORT: i32 = 20800;

/// Client Service, StatefulSet and configuration bundle name
pub fn member_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pd")
}

/// Headless peer Service name
pub fn peer_member_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pd-peer")
}

pub fn pod_name(cluster_name: &str, ordinal: i32) -> String {
    format!("{}-{}", member_name(cluster_name), ordinal)
}

/// Stable DNS name of a member pod behind the peer Service
pub fn pod_host(cluster_name: &str, namespace: &str, ordinal: i32) -> String {
    format!(
        "{}.{}.{}.svc",
        pod_name(cluster_name, ordinal),
        peer_member_name(cluster_name),
        namespace
    )
}

pub fn peer_url(cluster_name: &str, namespace: &str, ordinal: i32) -> String {
    format!(
        "http://{}:{}",
        pod_host(cluster_name, namespace, ordinal),
        PEER_PORT
    )
}

pub fn client_url(cluster_name: &str, namespace: &str, ordinal: i32) -> String {
    format!(
        "http://{}:{}",
        pod_host(cluster_name, namespace, ordinal),
        CLIENT_PORT
    )
}

// ============================================================================
// Labels
// ============================================================================

/// Labels identifying the members of one component of one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberLabels {
    instance: String,
    component: MemberType,
}

impl MemberLabels {
    pub fn new(instance: impl Into<String>, component: MemberType) -> Self {
        Self {
            instance: instance.into(),
            component,
        }
    }

    /// PD labels for a cluster; the instance falls back to the resource name
    pub fn pd(cluster: &ManagedCluster) -> Self {
        let instance = cluster
            .labels()
            .get(INSTANCE_LABEL_KEY)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| cluster.name_any());
        Self::new(instance, MemberType::Pd)
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "app.kubernetes.io/name".to_string(),
                "managed-cluster".to_string(),
            ),
            (
                "app.kubernetes.io/managed-by".to_string(),
                "pd-operator".to_string(),
            ),
            (INSTANCE_LABEL_KEY.to_string(), self.instance.clone()),
            (
                "app.kubernetes.io/component".to_string(),
                self.component.to_string(),
            ),
        ])
    }

    /// Label selector string for list calls, e.g. `a=b,c=d`
    pub fn selector(&self) -> String {
        self.to_map()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn label_selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: Some(self.to_map()),
            ..Default::default()
        }
    }
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(cluster: &ManagedCluster) -> OwnerReference {
    OwnerReference {
        api_version: ManagedCluster::api_version(&()).to_string(),
        kind: ManagedCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn member_meta(cluster: &ManagedCluster, name: String, labels: &MemberLabels) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(labels.to_map()),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

fn tcp_service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn tcp_container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

// ============================================================================
// Services
// ============================================================================

/// Client Service: one port for PD clients, address assigned by the platform
pub fn build_client_service(cluster: &ManagedCluster) -> Service {
    let labels = MemberLabels::pd(cluster);
    Service {
        metadata: member_meta(cluster, member_name(&cluster.name_any()), &labels),
        spec: Some(ServiceSpec {
            type_: Some(cluster.spec.service_type(&MemberType::Pd.to_string())),
            ports: Some(vec![tcp_service_port("client", CLIENT_PORT)]),
            selector: Some(labels.to_map()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Headless peer Service backing the StatefulSet's stable pod DNS names
pub fn build_peer_service(cluster: &ManagedCluster) -> Service {
    let labels = MemberLabels::pd(cluster);
    Service {
        metadata: member_meta(cluster, peer_member_name(&cluster.name_any()), &labels),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ports: Some(vec![
                tcp_service_port("peer", PEER_PORT),
                tcp_service_port("rpc", RPC_PORT),
            ]),
            selector: Some(labels.to_map()),
            ..Default::default()
        }),
        status: None,
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
struct AppliedService {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    spec: Option<ServiceSpec>,
}

impl AppliedService {
    fn of(svc: &Service) -> Self {
        Self {
            labels: svc.metadata.labels.clone(),
            spec: svc.spec.clone(),
        }
    }
}

fn last_applied(meta: &ObjectMeta) -> Option<&String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_CONFIG_ANNOTATION))
}

fn stamp_last_applied(meta: &mut ObjectMeta, value: String) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(LAST_APPLIED_CONFIG_ANNOTATION.to_string(), value);
}

/// Record the Service's labels and spec as last applied
pub fn set_service_last_applied(svc: &mut Service) -> Result<()> {
    let applied = serde_json::to_string(&AppliedService::of(svc))?;
    stamp_last_applied(&mut svc.metadata, applied);
    Ok(())
}

/// Compare a desired Service against what was last applied to the live one
///
/// A missing or unreadable annotation compares unequal so the next write
/// repairs it.
pub fn service_equal(desired: &Service, live: &Service) -> bool {
    let Some(raw) = last_applied(&live.metadata) else {
        return false;
    };
    match serde_json::from_str::<AppliedService>(raw) {
        Ok(applied) => applied == AppliedService::of(desired),
        Err(e) => {
            warn!(
                "Unreadable last-applied annotation on Service {}: {}",
                live.name_any(),
                e
            );
            false
        }
    }
}

/// Merge a desired Service into the live one for an update
///
/// The platform-assigned cluster address is immutable and must survive.
pub fn merge_service_update(desired: &Service, live: &Service) -> Result<Service> {
    let applied = serde_json::to_string(&AppliedService::of(desired))?;
    let mut svc = live.clone();
    svc.metadata.labels = desired.metadata.labels.clone();
    let mut spec = desired.spec.clone().unwrap_or_default();
    if let Some(live_spec) = &live.spec {
        spec.cluster_ip = live_spec.cluster_ip.clone();
        spec.cluster_ips = live_spec.cluster_ips.clone();
    }
    svc.spec = Some(spec);
    stamp_last_applied(&mut svc.metadata, applied);
    Ok(svc)
}

// ============================================================================
// StatefulSet
// ============================================================================

/// Effective replica count: desired members plus deleted failure members
pub fn effective_replicas(cluster: &ManagedCluster) -> i32 {
    let failures = cluster
        .status
        .as_ref()
        .map(|s| s.pd.deleted_failure_count())
        .unwrap_or(0);
    cluster.spec.pd.replicas + failures
}

fn quantities(spec: Option<&ResourceSpec>) -> Option<BTreeMap<String, Quantity>> {
    let spec = spec?;
    let mut map = BTreeMap::new();
    if let Some(cpu) = spec.cpu.as_ref().filter(|v| !v.is_empty()) {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = spec.memory.as_ref().filter(|v| !v.is_empty()) {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn affinity_for_node_selector(
    node_selector: &BTreeMap<String, String>,
    required: bool,
) -> Option<Affinity> {
    if node_selector.is_empty() {
        return None;
    }
    let term = NodeSelectorTerm {
        match_expressions: Some(
            node_selector
                .iter()
                .map(|(k, v)| NodeSelectorRequirement {
                    key: k.clone(),
                    operator: "In".to_string(),
                    values: Some(vec![v.clone()]),
                })
                .collect(),
        ),
        ..Default::default()
    };
    let node_affinity = if required {
        NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![term],
            }),
            ..Default::default()
        }
    } else {
        NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                PreferredSchedulingTerm {
                    weight: 80,
                    preference: term,
                },
            ]),
            ..Default::default()
        }
    };
    Some(Affinity {
        node_affinity: Some(node_affinity),
        ..Default::default()
    })
}

fn config_bundle_volume(name: &str, bundle: &str, key: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(bundle.to_string()),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path: path.to_string(),
                mode: None,
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_pod_template(cluster: &ManagedCluster, labels: &MemberLabels) -> PodTemplateSpec {
    let name = cluster.name_any();
    let bundle = member_name(&name);
    let pd = &cluster.spec.pd;
    let member = MemberType::Pd.to_string();

    let volumes = vec![
        Volume {
            name: "annotations".to_string(),
            downward_api: Some(DownwardAPIVolumeSource {
                items: Some(vec![DownwardAPIVolumeFile {
                    path: "annotations".to_string(),
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.annotations".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        config_bundle_volume("config", &bundle, "config-file", "pd.toml"),
        config_bundle_volume(
            "startup-script",
            &bundle,
            "startup-script",
            "pd_start_script.sh",
        ),
    ];

    let volume_mounts = vec![
        VolumeMount {
            name: "annotations".to_string(),
            read_only: Some(true),
            mount_path: "/etc/podinfo".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "config".to_string(),
            read_only: Some(true),
            mount_path: "/etc/pd".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "startup-script".to_string(),
            read_only: Some(true),
            mount_path: "/usr/local/bin/startup".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: member.clone(),
            mount_path: "/var/lib/pd".to_string(),
            ..Default::default()
        },
    ];

    let container = Container {
        name: member,
        image: Some(pd.container.image.clone()),
        image_pull_policy: pd.container.image_pull_policy.clone(),
        command: Some(vec![
            "/bin/sh".to_string(),
            "/usr/local/bin/startup/pd_start_script.sh".to_string(),
        ]),
        ports: Some(vec![
            tcp_container_port("peer", PEER_PORT),
            tcp_container_port("client", CLIENT_PORT),
            tcp_container_port("rpc", RPC_PORT),
        ]),
        volume_mounts: Some(volume_mounts),
        resources: Some(ResourceRequirements {
            requests: quantities(pd.container.requests.as_ref()),
            limits: quantities(pd.container.limits.as_ref()),
            ..Default::default()
        }),
        env: Some(vec![
            EnvVar {
                name: "NAMESPACE".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.namespace".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: "PEER_SERVICE_NAME".to_string(),
                value: Some(peer_member_name(&name)),
                ..Default::default()
            },
            EnvVar {
                name: "TZ".to_string(),
                value: Some(cluster.spec.timezone.clone()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.to_map()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            scheduler_name: Some(cluster.spec.scheduler_name.clone()),
            affinity: affinity_for_node_selector(&pd.node_selector, pd.node_selector_required),
            containers: vec![container],
            restart_policy: Some("Always".to_string()),
            tolerations: if pd.tolerations.is_empty() {
                None
            } else {
                Some(pd.tolerations.clone())
            },
            volumes: Some(volumes),
            ..Default::default()
        }),
    }
}

/// Build the desired PD StatefulSet
///
/// The rolling-update partition starts at the effective replica count so no
/// pod rolls until the upgrade engine lowers it.
pub fn build_stateful_set(
    cluster: &ManagedCluster,
    default_storage_class: &str,
) -> Result<StatefulSet> {
    let name = cluster.name_any();
    let labels = MemberLabels::pd(cluster);
    let pd = &cluster.spec.pd;

    let storage = pd
        .container
        .requests
        .as_ref()
        .and_then(|r| r.storage.clone())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "ManagedCluster {}/{} has no spec.pd.requests.storage",
                cluster.namespace().unwrap_or_default(),
                name
            ))
        })?;

    let storage_class = if pd.storage_class_name.is_empty() {
        default_storage_class.to_string()
    } else {
        pd.storage_class_name.clone()
    };

    let replicas = effective_replicas(cluster);

    Ok(StatefulSet {
        metadata: member_meta(cluster, member_name(&name), &labels),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: labels.label_selector(),
            template: build_pod_template(cluster, &labels),
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(MemberType::Pd.to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: Some(storage_class),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(storage),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                status: None,
            }]),
            service_name: peer_member_name(&name),
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    partition: Some(replicas),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Record the StatefulSet's spec as last applied
pub fn set_stateful_set_last_applied(set: &mut StatefulSet) -> Result<()> {
    let applied = set.spec.clone().unwrap_or_default();
    stamp_stateful_set_applied(set, &applied)
}

/// Record `applied` as the StatefulSet's last-applied spec
///
/// Used when the written object is the live one patched in place, so the
/// annotation keeps the operator's values rather than platform defaults.
pub fn stamp_stateful_set_applied(set: &mut StatefulSet, applied: &StatefulSetSpec) -> Result<()> {
    let applied = serde_json::to_string(&Some(applied))?;
    stamp_last_applied(&mut set.metadata, applied);
    Ok(())
}

fn applied_stateful_set_spec(live: &StatefulSet) -> Option<StatefulSetSpec> {
    let raw = last_applied(&live.metadata)?;
    match serde_json::from_str::<Option<StatefulSetSpec>>(raw) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(
                "Unreadable last-applied annotation on StatefulSet {}: {}",
                live.name_any(),
                e
            );
            None
        }
    }
}

/// Whether the desired pod template matches the one last applied to `live`
pub fn template_equal(desired: &PodTemplateSpec, live: &StatefulSet) -> bool {
    applied_stateful_set_spec(live)
        .map(|applied| &applied.template == desired)
        .unwrap_or(false)
}

/// Whether the fields this operator patches in place are already applied
///
/// Compares template, replica count and update strategy against the
/// last-applied copy instead of the live spec; the live spec carries
/// platform-injected defaults and would never compare equal.
pub fn stateful_set_equal(desired: &StatefulSet, live: &StatefulSet) -> bool {
    let (Some(desired_spec), Some(applied)) = (desired.spec.as_ref(), applied_stateful_set_spec(live))
    else {
        return false;
    };
    desired_spec.template == applied.template
        && desired_spec.replicas == applied.replicas
        && desired_spec.update_strategy == applied.update_strategy
}

pub fn replicas(set: &StatefulSet) -> i32 {
    set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// Partition of the rolling update, if any
pub fn partition(set: &StatefulSet) -> Option<i32> {
    set.spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.rolling_update.as_ref())
        .and_then(|r| r.partition)
}

/// Copy the desired template, replicas and update strategy onto the live set
pub fn merge_stateful_set_update(desired: &StatefulSet, live: &StatefulSet) -> Result<StatefulSet> {
    let mut set = live.clone();
    let desired_spec = desired
        .spec
        .as_ref()
        .ok_or_else(|| Error::ConfigError("desired StatefulSet has no spec".to_string()))?;
    let spec = set.spec.get_or_insert_with(Default::default);
    spec.template = desired_spec.template.clone();
    spec.replicas = desired_spec.replicas;
    spec.update_strategy = desired_spec.update_strategy.clone();
    stamp_stateful_set_applied(&mut set, desired_spec)?;
    Ok(set)
}
