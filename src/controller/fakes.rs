//! Scriptable test doubles for the controller's collaborator traits

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;

use super::control::{ClusterStatusWriter, PodLister, ServiceControl, StatefulSetControl};
use super::member_manager::MemberManager;
use super::pd_client::{ClusterInfo, LeaderInfo, MemberHealth, PdClient, PdControl};
use super::resources::CONTROLLER_REVISION_HASH_LABEL;
use super::upgrader::Upgrader;
use crate::crd::{ManagedCluster, MemberPhase};
use crate::error::{Error, Result};

/// A valid three-member cluster in the `default` namespace
pub fn cluster(name: &str) -> ManagedCluster {
    let spec = serde_json::from_value(serde_json::json!({
        "pd": {
            "replicas": 3,
            "image": "pingcap/pd:v7.5.0",
            "requests": { "storage": "10Gi" }
        }
    }))
    .unwrap();
    let mut cluster = ManagedCluster::new(name, spec);
    cluster.metadata.namespace = Some("default".to_string());
    cluster.metadata.uid = Some(format!("{name}-uid"));
    cluster
}

pub fn pod(name: &str, revision: Option<&str>) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.metadata.namespace = Some("default".to_string());
    if let Some(revision) = revision {
        pod.labels_mut()
            .insert(CONTROLLER_REVISION_HASH_LABEL.to_string(), revision.to_string());
    }
    pod
}

pub fn health(name: &str, id: u64, healthy: bool) -> MemberHealth {
    MemberHealth {
        name: name.to_string(),
        member_id: id,
        client_urls: vec![format!("http://{name}.demo-pd-peer.default.svc:2379")],
        health: healthy,
    }
}

// ============================================================================
// Orchestration client
// ============================================================================

/// In-memory Services; creation assigns a cluster address like the platform
#[derive(Default)]
pub struct FakeServiceControl {
    pub services: Mutex<BTreeMap<String, Service>>,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
}

impl FakeServiceControl {
    pub fn get(&self, name: &str) -> Option<Service> {
        self.services.lock().unwrap().get(name).cloned()
    }

    pub fn writes(&self) -> usize {
        self.creates.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceControl for FakeServiceControl {
    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.get(name))
    }

    async fn create_service(&self, _cluster: &ManagedCluster, svc: &Service) -> Result<()> {
        let mut svc = svc.clone();
        if let Some(spec) = svc.spec.as_mut() {
            if spec.cluster_ip.is_none() {
                spec.cluster_ip = Some("10.96.0.17".to_string());
                spec.cluster_ips = Some(vec!["10.96.0.17".to_string()]);
            }
            spec.session_affinity = Some("None".to_string());
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.services
            .lock()
            .unwrap()
            .insert(svc.name_any(), svc);
        Ok(())
    }

    async fn update_service(&self, _cluster: &ManagedCluster, svc: &Service) -> Result<Service> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.services
            .lock()
            .unwrap()
            .insert(svc.name_any(), svc.clone());
        Ok(svc.clone())
    }
}

/// In-memory StatefulSets; creation fills in platform defaults and a status
#[derive(Default)]
pub struct FakeStatefulSetControl {
    pub sets: Mutex<BTreeMap<String, StatefulSet>>,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
}

impl FakeStatefulSetControl {
    pub fn get(&self, name: &str) -> Option<StatefulSet> {
        self.sets.lock().unwrap().get(name).cloned()
    }

    pub fn insert(&self, set: StatefulSet) {
        self.sets.lock().unwrap().insert(set.name_any(), set);
    }

    pub fn writes(&self) -> usize {
        self.creates.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst)
    }
}

/// What the API server adds to a StatefulSet that the operator never sets
pub fn with_platform_defaults(mut set: StatefulSet, revision: &str) -> StatefulSet {
    if let Some(spec) = set.spec.as_mut() {
        spec.revision_history_limit = Some(10);
        if let Some(pod_spec) = spec.template.spec.as_mut() {
            pod_spec.dns_policy = Some("ClusterFirst".to_string());
            pod_spec.termination_grace_period_seconds = Some(30);
        }
    }
    set.metadata.generation = Some(1);
    set.status = Some(StatefulSetStatus {
        observed_generation: Some(1),
        replicas: set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
        current_revision: Some(revision.to_string()),
        update_revision: Some(revision.to_string()),
        ..Default::default()
    });
    set
}

#[async_trait]
impl StatefulSetControl for FakeStatefulSetControl {
    async fn get_stateful_set(&self, _namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.get(name))
    }

    async fn create_stateful_set(&self, _cluster: &ManagedCluster, set: &StatefulSet) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.insert(with_platform_defaults(set.clone(), "rev-1"));
        Ok(())
    }

    async fn update_stateful_set(
        &self,
        _cluster: &ManagedCluster,
        set: &StatefulSet,
    ) -> Result<StatefulSet> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.insert(set.clone());
        Ok(set.clone())
    }
}

#[derive(Default)]
pub struct FakePodLister {
    pub pods: Mutex<Vec<Pod>>,
    pub fail: AtomicBool,
}

impl FakePodLister {
    pub fn with_pods(pods: Vec<Pod>) -> Self {
        Self {
            pods: Mutex::new(pods),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PodLister for FakePodLister {
    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("pod lister down".to_string()));
        }
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name_any() == name)
            .cloned())
    }
}

#[derive(Default)]
pub struct FakeStatusWriter {
    pub written: Mutex<Vec<ManagedCluster>>,
}

impl FakeStatusWriter {
    pub fn writes(&self) -> usize {
        self.written.lock().unwrap().len()
    }
}

#[async_trait]
impl ClusterStatusWriter for FakeStatusWriter {
    async fn update_status(&self, cluster: &ManagedCluster) -> Result<()> {
        self.written.lock().unwrap().push(cluster.clone());
        Ok(())
    }
}

// ============================================================================
// PD admin API
// ============================================================================

/// Admin API double; each call can be made to fail independently
#[derive(Default)]
pub struct FakePdClient {
    pub cluster_id: u64,
    pub healths: Mutex<Vec<MemberHealth>>,
    pub leader: Mutex<LeaderInfo>,
    pub fail_cluster: AtomicBool,
    pub fail_health: AtomicBool,
    pub fail_leader: AtomicBool,
}

impl FakePdClient {
    pub fn healthy(names: &[&str]) -> Self {
        Self {
            cluster_id: 6801,
            healths: Mutex::new(
                names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| health(n, i as u64 + 1, true))
                    .collect(),
            ),
            leader: Mutex::new(LeaderInfo {
                name: names.first().map(|n| n.to_string()).unwrap_or_default(),
                member_id: 1,
                client_urls: vec![],
            }),
            ..Default::default()
        }
    }

    pub fn set_healths(&self, healths: Vec<MemberHealth>) {
        *self.healths.lock().unwrap() = healths;
    }
}

fn scripted<T>(fail: &AtomicBool, what: &str, value: T) -> Result<T> {
    if fail.load(Ordering::SeqCst) {
        return Err(Error::Unavailable(format!("{what} query failed")));
    }
    Ok(value)
}

#[async_trait]
impl PdClient for FakePdClient {
    async fn get_cluster(&self) -> Result<ClusterInfo> {
        scripted(
            &self.fail_cluster,
            "cluster",
            ClusterInfo {
                id: self.cluster_id,
                max_peer_count: 3,
            },
        )
    }

    async fn get_health(&self) -> Result<Vec<MemberHealth>> {
        scripted(&self.fail_health, "health", self.healths.lock().unwrap().clone())
    }

    async fn get_leader(&self) -> Result<LeaderInfo> {
        scripted(&self.fail_leader, "leader", self.leader.lock().unwrap().clone())
    }
}

pub struct FakePdControl(pub Arc<FakePdClient>);

impl PdControl for FakePdControl {
    fn client_for(&self, _cluster: &ManagedCluster) -> Arc<dyn PdClient> {
        self.0.clone()
    }
}

// ============================================================================
// Upgrade engine and member manager
// ============================================================================

#[derive(Default)]
pub struct FakeUpgrader {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Upgrader for FakeUpgrader {
    async fn upgrade(
        &self,
        cluster: &mut ManagedCluster,
        _live: &StatefulSet,
        _desired: &StatefulSet,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cluster.status.get_or_insert_with(Default::default).pd.phase = MemberPhase::Upgrading;
        Ok(())
    }
}

/// Member manager whose outcome is scripted per test
#[derive(Default)]
pub struct FakeMemberManager {
    pub calls: AtomicUsize,
    /// Returned from the next sync, if set
    pub error: Mutex<Option<Error>>,
    /// Mark the status synced during sync
    pub touch_status: AtomicBool,
}

impl FakeMemberManager {
    pub fn failing(err: Error) -> Self {
        Self {
            error: Mutex::new(Some(err)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MemberManager for FakeMemberManager {
    async fn sync(&self, cluster: &mut ManagedCluster) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.touch_status.load(Ordering::SeqCst) {
            cluster.status.get_or_insert_with(Default::default).pd.synced = true;
        }
        match self.error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
