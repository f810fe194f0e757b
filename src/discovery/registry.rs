//! Versioned storage for bootstrap bookkeeping
//!
//! The registry record lives in an annotation on the owning `ManagedCluster`,
//! so the object's `resourceVersion` doubles as the record's version token and
//! the API server enforces compare-and-swap for us.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::crd::{ManagedCluster, PdMember};
use crate::error::{is_kube_conflict, Error, Result};

/// Annotation carrying the JSON-encoded `RegistryRecord`
pub const BOOTSTRAP_REGISTRY_ANNOTATION: &str = "pd.operator.rs/bootstrap-registry";

/// Identity of one managed cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FoundingPeer {
    pub peer_url: String,
    pub client_url: String,
}

/// Founding-set membership of one cluster
///
/// Once `founded` is set the record never changes again.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRecord {
    /// Founding peers that have checked in, keyed by member name
    #[serde(default)]
    pub peers: BTreeMap<String, FoundingPeer>,
    #[serde(default)]
    pub founded: bool,
}

/// Everything the coordinator reads in one registry load
#[derive(Clone, Debug, Default)]
pub struct Registration {
    /// Desired founding-set size
    pub replicas: i32,
    pub record: RegistryRecord,
    /// Members last reported by the status aggregator
    pub members: BTreeMap<String, PdMember>,
    pub leader: Option<String>,
    /// Opaque version token for `compare_and_swap`
    pub version: String,
}

/// Versioned persistence with an explicit compare-and-swap primitive
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// # Errors
    ///
    /// `NotFound` when the owning cluster resource does not exist.
    async fn load(&self, key: &ClusterKey) -> Result<Registration>;

    /// Write `record` only if the stored version still equals
    /// `expected_version`; returns the new version.
    ///
    /// # Errors
    ///
    /// `Conflict` when the version moved underneath the caller.
    async fn compare_and_swap(
        &self,
        key: &ClusterKey,
        record: &RegistryRecord,
        expected_version: &str,
    ) -> Result<String>;
}

/// Registry backed by `ManagedCluster` annotations
#[derive(Clone)]
pub struct KubeRegistryStore {
    client: Client,
}

impl KubeRegistryStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ClusterKey) -> Api<ManagedCluster> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

/// The API server could not serve the registry call
fn unavailable(key: &ClusterKey, op: &str, err: kube::Error) -> Error {
    Error::Unavailable(format!("registry {op} for {key} failed: {err}"))
}

/// Decode the registry record stored on a cluster, empty if absent
pub fn record_of(cluster: &ManagedCluster) -> Result<RegistryRecord> {
    match cluster.annotations().get(BOOTSTRAP_REGISTRY_ANNOTATION) {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(RegistryRecord::default()),
    }
}

/// Flatten a cluster object into a `Registration`
pub fn registration_of(cluster: &ManagedCluster) -> Result<Registration> {
    let status = cluster.status.clone().unwrap_or_default();
    let leader = Some(status.pd.leader.name.clone()).filter(|n| !n.is_empty());
    Ok(Registration {
        replicas: cluster.spec.pd.replicas,
        record: record_of(cluster)?,
        members: status.pd.members,
        leader,
        version: cluster.resource_version().unwrap_or_default(),
    })
}

#[async_trait]
impl RegistryStore for KubeRegistryStore {
    #[instrument(skip(self), fields(cluster = %key))]
    async fn load(&self, key: &ClusterKey) -> Result<Registration> {
        let cluster = self
            .api(key)
            .get_opt(&key.name)
            .await
            .map_err(|e| unavailable(key, "load", e))?
            .ok_or_else(|| Error::not_found("ManagedCluster", key.to_string()))?;
        registration_of(&cluster)
    }

    #[instrument(skip(self, record), fields(cluster = %key))]
    async fn compare_and_swap(
        &self,
        key: &ClusterKey,
        record: &RegistryRecord,
        expected_version: &str,
    ) -> Result<String> {
        let annotations = BTreeMap::from([(
            BOOTSTRAP_REGISTRY_ANNOTATION.to_string(),
            serde_json::to_string(record)?,
        )]);
        // resourceVersion in a merge patch is a precondition on the write.
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": expected_version,
                "annotations": annotations,
            }
        });

        match self
            .api(key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => {
                let version = updated.resource_version().unwrap_or_default();
                debug!("Registry for {} now at version {}", key, version);
                Ok(version)
            }
            Err(e) if is_kube_conflict(&e) => Err(Error::Conflict(format!(
                "registry of {key} moved past version {expected_version}"
            ))),
            Err(e) if matches!(&e, kube::Error::Api(resp) if resp.code < 500) => Err(e.into()),
            Err(e) => Err(unavailable(key, "write", e)),
        }
    }
}


#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const DEMO_PATH: &str = "/apis/pd.operator.rs/v1alpha1/namespaces/default/managedclusters/demo";

    fn kube_store(server: &MockServer) -> KubeRegistryStore {
        let config = kube::Config::new(server.uri().parse().unwrap());
        KubeRegistryStore::new(Client::try_from(config).unwrap())
    }

    fn status_body(code: u16, reason: &str) -> serde_json::Value {
        serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code
        })
    }

    #[tokio::test]
    async fn test_api_server_failure_on_load_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEMO_PATH))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(status_body(503, "ServiceUnavailable")),
            )
            .mount(&server)
            .await;

        let err = kube_store(&server)
            .load(&ClusterKey::new("default", "demo"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_cluster_on_load_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEMO_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
            .mount(&server)
            .await;

        let err = kube_store(&server)
            .load(&ClusterKey::new("default", "demo"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_stale_version_on_write_is_a_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(DEMO_PATH))
            .respond_with(ResponseTemplate::new(409).set_body_json(status_body(409, "Conflict")))
            .mount(&server)
            .await;

        let err = kube_store(&server)
            .compare_and_swap(
                &ClusterKey::new("default", "demo"),
                &RegistryRecord::default(),
                "7",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn test_registration_reads_annotation_and_status() {
        let spec = serde_json::from_value(serde_json::json!({
            "pd": { "replicas": 3, "image": "pd:latest", "requests": { "storage": "1Gi" } }
        }))
        .unwrap();
        let mut cluster = ManagedCluster::new("demo", spec);
        cluster.metadata.resource_version = Some("42".to_string());
        cluster.annotations_mut().insert(
            BOOTSTRAP_REGISTRY_ANNOTATION.to_string(),
            r#"{"peers":{"demo-pd-0":{"peerUrl":"http://a:2380","clientUrl":"http://a:2379"}},"founded":false}"#
                .to_string(),
        );
        let status = cluster.status.get_or_insert_with(Default::default);
        status.pd.leader.name = "demo-pd-0".to_string();

        let registration = registration_of(&cluster).unwrap();
        assert_eq!(registration.replicas, 3);
        assert_eq!(registration.version, "42");
        assert_eq!(registration.leader.as_deref(), Some("demo-pd-0"));
        assert_eq!(
            registration.record.peers["demo-pd-0"].client_url,
            "http://a:2379"
        );
        assert!(!registration.record.founded);
    }

    #[test]
    fn test_missing_annotation_is_an_empty_record() {
        let spec = serde_json::from_value(serde_json::json!({
            "pd": { "image": "pd:latest", "requests": { "storage": "1Gi" } }
        }))
        .unwrap();
        let cluster = ManagedCluster::new("demo", spec);
        let registration = registration_of(&cluster).unwrap();
        assert_eq!(registration.record, RegistryRecord::default());
        assert!(registration.leader.is_none());
    }
}
