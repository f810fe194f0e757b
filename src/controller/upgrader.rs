//! Rolling upgrade engine for the PD StatefulSet
//!
//! Steps the RollingUpdate partition down one ordinal at a time, highest
//! ordinal first, and only after every already-updated member reports healthy.
//! The phase returns to `Normal` once the partition is at zero and every
//! member runs the update revision and is healthy.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use kube::ResourceExt;
use tracing::{info, instrument};

use super::control::{PodLister, StatefulSetControl};
use super::resources::{
    partition, pod_name, replicas, stamp_stateful_set_applied, template_equal,
    CONTROLLER_REVISION_HASH_LABEL,
};
use crate::crd::{ManagedCluster, MemberPhase};
use crate::error::{Error, Result};

/// Executes a rollout once the member reconciler has decided one is due
#[async_trait]
pub trait Upgrader: Send + Sync {
    async fn upgrade(
        &self,
        cluster: &mut ManagedCluster,
        live: &StatefulSet,
        desired: &StatefulSet,
    ) -> Result<()>;
}

pub struct PartitionUpgrader {
    set_control: Arc<dyn StatefulSetControl>,
    pod_lister: Arc<dyn PodLister>,
}

fn rolling_update(partition: i32) -> StatefulSetUpdateStrategy {
    StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateStatefulSetStrategy {
            partition: Some(partition),
            ..Default::default()
        }),
    }
}

/// Live set with the partition moved, annotated with the desired spec at that partition
fn with_partition(live: &StatefulSet, desired: &StatefulSetSpec, value: i32) -> Result<StatefulSet> {
    let mut set = live.clone();
    set.spec.get_or_insert_with(Default::default).update_strategy = Some(rolling_update(value));

    let mut applied = desired.clone();
    applied.update_strategy = Some(rolling_update(value));
    stamp_stateful_set_applied(&mut set, &applied)?;
    Ok(set)
}

impl PartitionUpgrader {
    pub fn new(set_control: Arc<dyn StatefulSetControl>, pod_lister: Arc<dyn PodLister>) -> Self {
        Self {
            set_control,
            pod_lister,
        }
    }
}

#[async_trait]
impl Upgrader for PartitionUpgrader {
    #[instrument(skip_all, fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
    async fn upgrade(
        &self,
        cluster: &mut ManagedCluster,
        live: &StatefulSet,
        desired: &StatefulSet,
    ) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let name = cluster.name_any();
        let status = cluster.status.get_or_insert_with(Default::default);
        status.pd.phase = MemberPhase::Upgrading;

        let desired_spec = desired
            .spec
            .as_ref()
            .ok_or_else(|| Error::ConfigError("desired StatefulSet has no spec".to_string()))?;

        // New template first, partition untouched so nothing rolls yet.
        if !template_equal(&desired_spec.template, live) {
            let live_spec = live.spec.clone().unwrap_or_default();
            let mut applied = desired_spec.clone();
            applied.replicas = live_spec.replicas;
            applied.update_strategy = live_spec.update_strategy.clone();

            let mut set = live.clone();
            set.spec.get_or_insert_with(Default::default).template = desired_spec.template.clone();
            stamp_stateful_set_applied(&mut set, &applied)?;
            self.set_control.update_stateful_set(cluster, &set).await?;
            info!("Applied new pod template for {}/{}", namespace, name);
            return Ok(());
        }

        if !status.pd.synced {
            return Err(Error::Requeue(format!(
                "ManagedCluster {namespace}/{name}: PD status not synced, holding upgrade"
            )));
        }

        let Some(update_revision) = live
            .status
            .as_ref()
            .and_then(|s| s.update_revision.clone())
        else {
            return Err(Error::Requeue(format!(
                "ManagedCluster {namespace}/{name}: StatefulSet has no update revision yet"
            )));
        };

        for ordinal in (0..replicas(live)).rev() {
            let pod_name = pod_name(&name, ordinal);
            let pod = self
                .pod_lister
                .get_pod(&namespace, &pod_name)
                .await?
                .ok_or_else(|| {
                    Error::Requeue(format!("{namespace}/{pod_name} does not exist yet"))
                })?;

            let revision = pod.labels().get(CONTROLLER_REVISION_HASH_LABEL).cloned();
            if revision.as_deref() == Some(update_revision.as_str()) {
                let healthy = status
                    .pd
                    .members
                    .get(&pod_name)
                    .map(|m| m.health)
                    .unwrap_or(false);
                if !healthy {
                    return Err(Error::Requeue(format!(
                        "{namespace}/{pod_name} upgraded, waiting for it to become healthy"
                    )));
                }
                continue;
            }

            if partition(live) != Some(ordinal) {
                let set = with_partition(live, desired_spec, ordinal)?;
                self.set_control.update_stateful_set(cluster, &set).await?;
                info!("Upgrading {}/{}: partition set to {}", namespace, name, ordinal);
            }
            return Ok(());
        }

        if partition(live) != Some(0) {
            let set = with_partition(live, desired_spec, 0)?;
            self.set_control.update_stateful_set(cluster, &set).await?;
            info!("All PD members of {}/{} run the update revision", namespace, name);
            return Ok(());
        }

        cluster.status.get_or_insert_with(Default::default).pd.phase = MemberPhase::Normal;
        info!("Upgrade of {}/{} finished", namespace, name);
        Ok(())
    }
}
