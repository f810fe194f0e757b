//! Controller module for ManagedCluster reconciliation
//! This module contains the main controller loop, the PD member manager,
//! status aggregation, the upgrade engine and Kubernetes object builders.

pub mod control;
#[cfg(test)]
pub(crate) mod fakes;
mod member_manager;
#[cfg(test)]
mod member_manager_test;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pd_client;
mod reconciler;
pub mod resources;
mod status;
mod upgrader;

pub use control::{ClusterStatusWriter, KubeControl, PodLister, ServiceControl, StatefulSetControl};
pub use member_manager::{check_rescale, ManagerConfig, MemberManager, PdMemberManager};
pub use pd_client::{HttpPdClient, HttpPdControl, PdClient, PdControl};
pub use reconciler::{
    reconcile_cluster, run_controller, ControllerState, LONG_REQUEUE, SHORT_REQUEUE,
};
pub use status::{merge_members, stateful_set_is_upgrading, StatusAggregator};
pub use upgrader::{PartitionUpgrader, Upgrader};
