//! Orchestration client seams
//!
//! Narrow traits over the Kubernetes operations the member reconciler needs,
//! so the reconciler can run against scripted doubles in tests. `KubeControl`
//! is the single production implementation.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

use crate::crd::ManagedCluster;
use crate::error::{Error, Result};

/// Create/update primitives for Services plus a read-through lookup
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn create_service(&self, cluster: &ManagedCluster, svc: &Service) -> Result<()>;

    async fn update_service(&self, cluster: &ManagedCluster, svc: &Service) -> Result<Service>;
}

/// Create/update primitives for the member StatefulSet
#[async_trait]
pub trait StatefulSetControl: Send + Sync {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    async fn create_stateful_set(&self, cluster: &ManagedCluster, set: &StatefulSet)
        -> Result<()>;

    async fn update_stateful_set(
        &self,
        cluster: &ManagedCluster,
        set: &StatefulSet,
    ) -> Result<StatefulSet>;
}

/// Read-only pod listing by label selector
#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
}

/// Persists a ManagedCluster's status sub-resource
#[async_trait]
pub trait ClusterStatusWriter: Send + Sync {
    async fn update_status(&self, cluster: &ManagedCluster) -> Result<()>;
}

/// Kubernetes-backed implementation of every orchestration seam
#[derive(Clone)]
pub struct KubeControl {
    client: Client,
}

impl KubeControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn cluster_namespace(cluster: &ManagedCluster) -> String {
    cluster.namespace().unwrap_or_else(|| "default".to_string())
}

#[async_trait]
impl ServiceControl for KubeControl {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument(skip(self, cluster, svc), fields(cluster = %cluster.name_any(), service = %svc.name_any()))]
    async fn create_service(&self, cluster: &ManagedCluster, svc: &Service) -> Result<()> {
        let api: Api<Service> = self.namespaced(&cluster_namespace(cluster));
        api.create(&PostParams::default(), svc).await?;
        info!("Created Service {}", svc.name_any());
        Ok(())
    }

    #[instrument(skip(self, cluster, svc), fields(cluster = %cluster.name_any(), service = %svc.name_any()))]
    async fn update_service(&self, cluster: &ManagedCluster, svc: &Service) -> Result<Service> {
        let api: Api<Service> = self.namespaced(&cluster_namespace(cluster));
        let updated = api
            .replace(&svc.name_any(), &PostParams::default(), svc)
            .await?;
        info!("Updated Service {}", svc.name_any());
        Ok(updated)
    }
}

#[async_trait]
impl StatefulSetControl for KubeControl {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument(skip(self, cluster, set), fields(cluster = %cluster.name_any(), statefulset = %set.name_any()))]
    async fn create_stateful_set(
        &self,
        cluster: &ManagedCluster,
        set: &StatefulSet,
    ) -> Result<()> {
        let api: Api<StatefulSet> = self.namespaced(&cluster_namespace(cluster));
        api.create(&PostParams::default(), set).await?;
        info!("Created StatefulSet {}", set.name_any());
        Ok(())
    }

    #[instrument(skip(self, cluster, set), fields(cluster = %cluster.name_any(), statefulset = %set.name_any()))]
    async fn update_stateful_set(
        &self,
        cluster: &ManagedCluster,
        set: &StatefulSet,
    ) -> Result<StatefulSet> {
        let api: Api<StatefulSet> = self.namespaced(&cluster_namespace(cluster));
        let updated = api
            .replace(&set.name_any(), &PostParams::default(), set)
            .await?;
        info!("Updated StatefulSet {}", set.name_any());
        Ok(updated)
    }
}

#[async_trait]
impl PodLister for KubeControl {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = self.namespaced(namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }
}

#[async_trait]
impl ClusterStatusWriter for KubeControl {
    #[instrument(skip(self, cluster), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
    async fn update_status(&self, cluster: &ManagedCluster) -> Result<()> {
        let api: Api<ManagedCluster> = self.namespaced(&cluster_namespace(cluster));
        let patch = serde_json::json!({ "status": cluster.status });
        api.patch_status(
            &cluster.name_any(),
            &PatchParams::apply("pd-operator"),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
        debug!("Persisted status for {}", cluster.name_any());
        Ok(())
    }
}
