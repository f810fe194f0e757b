//! PD member reconciliation
//!
//! One `sync` pass converges the client Service, the headless peer Service
//! and the PD StatefulSet towards what the `ManagedCluster` spec asks for,
//! refreshing `status.pd` on the way. Rollouts are handed to the upgrader.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use super::control::{ServiceControl, StatefulSetControl};
use super::resources::{
    build_client_service, build_peer_service, build_stateful_set, merge_service_update,
    merge_stateful_set_update, replicas, service_equal, set_service_last_applied,
    set_stateful_set_last_applied, stateful_set_equal, template_equal,
};
use super::status::StatusAggregator;
use super::upgrader::Upgrader;
use crate::crd::{ManagedCluster, MemberPhase};
use crate::error::{Error, Result};

/// Reconciles one member type of a `ManagedCluster`
#[async_trait]
pub trait MemberManager: Send + Sync {
    /// Converge the member's objects; `cluster.status` is updated in place
    /// and left for the caller to persist.
    async fn sync(&self, cluster: &mut ManagedCluster) -> Result<()>;
}

/// Static settings for the PD member manager
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Storage class for the data claim when the spec names none
    pub default_storage_class: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_storage_class: "standard".to_string(),
        }
    }
}

pub struct PdMemberManager {
    svc_control: Arc<dyn ServiceControl>,
    set_control: Arc<dyn StatefulSetControl>,
    status: StatusAggregator,
    upgrader: Arc<dyn Upgrader>,
    config: ManagerConfig,
}

impl PdMemberManager {
    pub fn new(
        svc_control: Arc<dyn ServiceControl>,
        set_control: Arc<dyn StatefulSetControl>,
        status: StatusAggregator,
        upgrader: Arc<dyn Upgrader>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            svc_control,
            set_control,
            status,
            upgrader,
            config,
        }
    }

    /// Create the Service if absent, otherwise update it when it drifted
    /// from what was last applied
    async fn sync_service(&self, cluster: &ManagedCluster, desired: Service) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let name = desired.name_any();

        match self.svc_control.get_service(&namespace, &name).await? {
            None => {
                let mut svc = desired;
                set_service_last_applied(&mut svc)?;
                self.svc_control.create_service(cluster, &svc).await
            }
            Some(live) => {
                if service_equal(&desired, &live) {
                    return Ok(());
                }
                let svc = merge_service_update(&desired, &live)?;
                self.svc_control.update_service(cluster, &svc).await?;
                Ok(())
            }
        }
    }

    async fn sync_stateful_set(&self, cluster: &mut ManagedCluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let name = cluster.name_any();

        let desired = build_stateful_set(cluster, &self.config.default_storage_class)?;
        let set_name = desired.name_any();

        let Some(live) = self
            .set_control
            .get_stateful_set(&namespace, &set_name)
            .await?
        else {
            let mut set = desired;
            set_stateful_set_last_applied(&mut set)?;
            self.set_control.create_stateful_set(cluster, &set).await?;
            cluster
                .status
                .get_or_insert_with(Default::default)
                .pd
                .stateful_set = Some(StatefulSetStatus::default());
            return Err(Error::Requeue(format!(
                "ManagedCluster {namespace}/{name}: waiting for PD StatefulSet to come up"
            )));
        };

        if let Err(e) = self.status.sync_status(cluster, &live).await {
            error!(
                "Failed to sync PD status of ManagedCluster {}/{}: {}",
                namespace, name, e
            );
        }

        let desired_template = desired
            .spec
            .as_ref()
            .map(|s| &s.template)
            .ok_or_else(|| Error::ConfigError("desired StatefulSet has no spec".to_string()))?;
        let upgrading = cluster
            .status
            .as_ref()
            .map(|s| s.pd.phase == MemberPhase::Upgrading)
            .unwrap_or(false);

        if !template_equal(desired_template, &live) || upgrading {
            return self.upgrader.upgrade(cluster, &live, &desired).await;
        }

        if let Err(e) = check_rescale(&desired, &live) {
            error!("ManagedCluster {}/{}: {}", namespace, name, e);
            return Ok(());
        }

        if !stateful_set_equal(&desired, &live) {
            let set = merge_stateful_set_update(&desired, &live)?;
            self.set_control.update_stateful_set(cluster, &set).await?;
            info!("Updated PD StatefulSet of {}/{}", namespace, name);
        } else {
            debug!("PD StatefulSet of {}/{} is up to date", namespace, name);
        }
        Ok(())
    }
}

/// PD membership changes go through the PD API, not replica counts
pub fn check_rescale(desired: &StatefulSet, live: &StatefulSet) -> Result<()> {
    let (want, have) = (replicas(desired), replicas(live));
    if want != have {
        return Err(Error::Unsupported(format!(
            "rescaling PD from {have} to {want} replicas is not supported"
        )));
    }
    Ok(())
}

#[async_trait]
impl MemberManager for PdMemberManager {
    #[instrument(skip(self, cluster), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
    async fn sync(&self, cluster: &mut ManagedCluster) -> Result<()> {
        self.sync_service(cluster, build_client_service(cluster))
            .await?;
        self.sync_service(cluster, build_peer_service(cluster))
            .await?;
        self.sync_stateful_set(cluster).await
    }
}
