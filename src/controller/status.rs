//! Status aggregation for PD members
//!
//! Folds the live StatefulSet status, pod revisions and the PD admin API's
//! view of the cluster into `status.pd`. Admin API results are applied all or
//! nothing: if any of the three queries fails, members, leader and cluster id
//! keep their previous values and `synced` drops to false.
//!
//! The aggregator can raise the phase to `Upgrading` but never clears it.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use super::control::PodLister;
use super::pd_client::{LeaderInfo, MemberHealth, PdControl};
use super::resources::{MemberLabels, CONTROLLER_REVISION_HASH_LABEL};
use crate::crd::{ManagedCluster, ManagedClusterStatus, MemberPhase, PdMember};
use crate::error::Result;

pub struct StatusAggregator {
    pd_control: Arc<dyn PdControl>,
    pod_lister: Arc<dyn PodLister>,
}

/// The StatefulSet controller itself reports a rollout in progress
pub fn stateful_set_is_upgrading(set: &StatefulSet) -> bool {
    let Some(status) = set.status.as_ref() else {
        return false;
    };
    if status.current_revision.as_deref().unwrap_or("").is_empty() {
        return false;
    }
    match (status.observed_generation, set.metadata.generation) {
        (None, _) => return false,
        (Some(observed), Some(generation)) if generation > observed => return false,
        _ => {}
    }
    status.current_revision != status.update_revision
}

fn status_mut(cluster: &mut ManagedCluster) -> &mut ManagedClusterStatus {
    cluster.status.get_or_insert_with(Default::default)
}

fn mark_unsynced(cluster: &mut ManagedCluster) {
    status_mut(cluster).pd.synced = false;
}

/// Upsert reported members into `previous`
///
/// A member keeps its transition time while its health is unchanged.
/// Members missing from `healths` are left as they were.
pub fn merge_members(
    previous: &BTreeMap<String, PdMember>,
    healths: &[MemberHealth],
    now: &str,
    cluster_ref: &str,
) -> BTreeMap<String, PdMember> {
    let mut members = previous.clone();
    for health in healths {
        if health.name.is_empty() {
            warn!(
                "PD member [{}] has no name (clientUrls: {:?}) in {}, skipping",
                health.member_id, health.client_urls, cluster_ref
            );
            continue;
        }

        let last_transition_time = match previous.get(&health.name) {
            Some(old) if old.health == health.health => old.last_transition_time.clone(),
            _ => Some(now.to_string()),
        };

        members.insert(
            health.name.clone(),
            PdMember {
                name: health.name.clone(),
                id: health.member_id.to_string(),
                client_url: health.client_urls.first().cloned().unwrap_or_default(),
                health: health.health,
                last_transition_time,
            },
        );
    }
    members
}

fn leader_member(leader: &LeaderInfo, members: &BTreeMap<String, PdMember>) -> PdMember {
    members.get(&leader.name).cloned().unwrap_or_else(|| PdMember {
        name: leader.name.clone(),
        id: leader.member_id.to_string(),
        client_url: leader.client_urls.first().cloned().unwrap_or_default(),
        health: true,
        last_transition_time: None,
    })
}

impl StatusAggregator {
    pub fn new(pd_control: Arc<dyn PdControl>, pod_lister: Arc<dyn PodLister>) -> Self {
        Self {
            pd_control,
            pod_lister,
        }
    }

    /// Refresh `status.pd` from the live StatefulSet and the admin API
    ///
    /// # Errors
    ///
    /// Returns the first failing remote call; `status.pd.synced` is false
    /// afterwards and member data is untouched.
    #[instrument(skip(self, cluster, set), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
    pub async fn sync_status(&self, cluster: &mut ManagedCluster, set: &StatefulSet) -> Result<()> {
        let cluster_ref = format!(
            "{}/{}",
            cluster.namespace().unwrap_or_default(),
            cluster.name_any()
        );

        status_mut(cluster).pd.stateful_set = set.status.clone();

        let upgrading = match self.is_upgrading(cluster, set).await {
            Ok(upgrading) => upgrading,
            Err(e) => {
                mark_unsynced(cluster);
                return Err(e);
            }
        };
        // Only the upgrader moves the phase back to Normal.
        if upgrading {
            status_mut(cluster).pd.phase = MemberPhase::Upgrading;
        }

        let pd = self.pd_control.client_for(cluster);

        let cluster_info = match pd.get_cluster().await {
            Ok(info) => info,
            Err(e) => {
                mark_unsynced(cluster);
                return Err(e);
            }
        };
        let healths = match pd.get_health().await {
            Ok(healths) => healths,
            Err(e) => {
                mark_unsynced(cluster);
                return Err(e);
            }
        };
        let leader = match pd.get_leader().await {
            Ok(leader) => leader,
            Err(e) => {
                mark_unsynced(cluster);
                return Err(e);
            }
        };

        let now = chrono::Utc::now().to_rfc3339();
        let status = status_mut(cluster);
        let members = merge_members(&status.pd.members, &healths, &now, &cluster_ref);

        status.cluster_id = Some(cluster_info.id.to_string());
        status.pd.leader = leader_member(&leader, &members);
        status.pd.members = members;
        status.pd.synced = true;

        debug!(
            "Status of {} synced: {} member(s), leader {}",
            cluster_ref,
            status.pd.members.len(),
            status.pd.leader.name
        );
        Ok(())
    }

    /// Upgrading while the workload rolls or any pod is off the update revision
    async fn is_upgrading(&self, cluster: &ManagedCluster, set: &StatefulSet) -> Result<bool> {
        if stateful_set_is_upgrading(set) {
            return Ok(true);
        }

        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let selector = MemberLabels::pd(cluster).selector();
        let pods = self.pod_lister.list_pods(&namespace, &selector).await?;

        let update_revision = set
            .status
            .as_ref()
            .and_then(|s| s.update_revision.as_deref());

        for pod in &pods {
            match pod.labels().get(CONTROLLER_REVISION_HASH_LABEL) {
                None => return Ok(false),
                Some(revision) if Some(revision.as_str()) != update_revision => return Ok(true),
                Some(_) => {}
            }
        }
        Ok(false)
    }
}
