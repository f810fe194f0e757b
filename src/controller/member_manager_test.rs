//! Tests for the PD member manager
//!
//! These tests verify the sync sequence against in-memory doubles:
//! - Object creation on a fresh cluster
//! - Idempotence once everything is in place
//! - Service updates that keep platform-assigned fields
//! - Upgrade hand-off and rescale rejection

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use kube::ResourceExt;

    use crate::controller::fakes::{
        cluster, health, pod, FakePdClient, FakePdControl, FakePodLister, FakeServiceControl,
        FakeStatefulSetControl, FakeUpgrader,
    };
    use crate::controller::member_manager::{
        check_rescale, ManagerConfig, MemberManager, PdMemberManager,
    };
    use crate::controller::resources::{
        build_stateful_set, partition, replicas, set_service_last_applied,
        stamp_stateful_set_applied,
    };
    use crate::controller::status::StatusAggregator;
    use crate::controller::upgrader::PartitionUpgrader;
    use crate::crd::{ManagedCluster, MemberPhase};
    use crate::error::Error;

    const MEMBERS: [&str; 3] = ["demo-pd-0", "demo-pd-1", "demo-pd-2"];

    struct Harness {
        services: Arc<FakeServiceControl>,
        sets: Arc<FakeStatefulSetControl>,
        pd: Arc<FakePdClient>,
        upgrader: Arc<FakeUpgrader>,
        manager: PdMemberManager,
    }

    fn harness() -> Harness {
        let services = Arc::new(FakeServiceControl::default());
        let sets = Arc::new(FakeStatefulSetControl::default());
        let pods = Arc::new(FakePodLister::with_pods(
            MEMBERS.iter().map(|n| pod(n, Some("rev-1"))).collect(),
        ));
        let pd = Arc::new(FakePdClient::healthy(&MEMBERS));
        let upgrader = Arc::new(FakeUpgrader::default());

        let manager = PdMemberManager::new(
            services.clone(),
            sets.clone(),
            StatusAggregator::new(Arc::new(FakePdControl(pd.clone())), pods),
            upgrader.clone(),
            ManagerConfig::default(),
        );

        Harness {
            services,
            sets,
            pd,
            upgrader,
            manager,
        }
    }

    /// Run the first pass, which creates everything and asks for a requeue
    async fn bootstrapped(h: &Harness) -> ManagedCluster {
        let mut c = cluster("demo");
        let err = h.manager.sync(&mut c).await.unwrap_err();
        assert!(err.is_requeue());
        c
    }

    #[tokio::test]
    async fn test_first_sync_creates_objects_and_requeues() {
        let h = harness();
        let c = bootstrapped(&h).await;

        assert_eq!(h.services.creates.load(Ordering::SeqCst), 2);
        assert_eq!(h.sets.creates.load(Ordering::SeqCst), 1);
        assert!(h.services.get("demo-pd").is_some());
        assert!(h.services.get("demo-pd-peer").is_some());

        let set = h.sets.get("demo-pd").unwrap();
        assert_eq!(replicas(&set), 3);
        assert_eq!(partition(&set), Some(3));

        let status = c.status.unwrap();
        assert_eq!(status.pd.stateful_set, Some(Default::default()));
        assert!(!status.pd.synced);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let h = harness();
        let mut c = bootstrapped(&h).await;

        h.manager.sync(&mut c).await.unwrap();
        let writes = (h.services.writes(), h.sets.writes());
        let status = c.status.clone();
        assert!(status.as_ref().unwrap().pd.synced);

        h.manager.sync(&mut c).await.unwrap();
        assert_eq!((h.services.writes(), h.sets.writes()), writes);
        assert_eq!(writes, (2, 1));
        assert_eq!(c.status, status);
        assert_eq!(h.upgrader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_service_label_drift_keeps_cluster_ip() {
        let h = harness();
        let mut c = bootstrapped(&h).await;

        // The live Service was last applied with a label we no longer want.
        let mut live = h.services.get("demo-pd").unwrap();
        live.labels_mut()
            .insert("legacy".to_string(), "true".to_string());
        set_service_last_applied(&mut live).unwrap();
        h.services
            .services
            .lock()
            .unwrap()
            .insert("demo-pd".to_string(), live);

        h.manager.sync(&mut c).await.unwrap();

        assert_eq!(h.services.updates.load(Ordering::SeqCst), 1);
        let updated = h.services.get("demo-pd").unwrap();
        assert!(!updated.labels().contains_key("legacy"));
        assert_eq!(
            updated.spec.as_ref().unwrap().cluster_ip.as_deref(),
            Some("10.96.0.17")
        );

        h.manager.sync(&mut c).await.unwrap();
        assert_eq!(h.services.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_template_change_hands_off_to_upgrader() {
        let h = harness();
        let mut c = bootstrapped(&h).await;

        c.spec.pd.container.image = "pingcap/pd:v8.1.0".to_string();
        h.manager.sync(&mut c).await.unwrap();

        assert_eq!(h.upgrader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.sets.updates.load(Ordering::SeqCst), 0);
        assert_eq!(c.status.unwrap().pd.phase, MemberPhase::Upgrading);
    }

    #[tokio::test]
    async fn test_upgrading_phase_is_sticky() {
        let h = harness();
        let mut c = bootstrapped(&h).await;

        // Template unchanged and every pod already on the update revision.
        c.status.get_or_insert_with(Default::default).pd.phase = MemberPhase::Upgrading;

        h.manager.sync(&mut c).await.unwrap();

        assert_eq!(h.upgrader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.sets.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rollout_detected_by_status_reaches_upgrader() {
        let h = harness();
        let mut c = bootstrapped(&h).await;

        let mut set = h.sets.get("demo-pd").unwrap();
        set.status.as_mut().unwrap().update_revision = Some("rev-2".to_string());
        h.sets.insert(set);

        h.manager.sync(&mut c).await.unwrap();

        assert_eq!(h.upgrader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.status.unwrap().pd.phase, MemberPhase::Upgrading);
    }

    #[tokio::test]
    async fn test_upgrade_is_released_by_the_upgrader_only() {
        let services = Arc::new(FakeServiceControl::default());
        let sets = Arc::new(FakeStatefulSetControl::default());
        let pods = Arc::new(FakePodLister::with_pods(
            MEMBERS.iter().map(|n| pod(n, Some("rev-1"))).collect(),
        ));
        let pd = Arc::new(FakePdClient::healthy(&MEMBERS));
        let manager = PdMemberManager::new(
            services,
            sets.clone(),
            StatusAggregator::new(Arc::new(FakePdControl(pd.clone())), pods.clone()),
            Arc::new(PartitionUpgrader::new(sets.clone(), pods)),
            ManagerConfig::default(),
        );

        let mut c = cluster("demo");
        assert!(manager.sync(&mut c).await.unwrap_err().is_requeue());

        // A rollout left at partition 0 with one member still unhealthy.
        let mut applied = build_stateful_set(&c, "standard").unwrap().spec.unwrap();
        applied
            .update_strategy
            .as_mut()
            .unwrap()
            .rolling_update
            .as_mut()
            .unwrap()
            .partition = Some(0);
        let mut set = sets.get("demo-pd").unwrap();
        set.spec.as_mut().unwrap().update_strategy = applied.update_strategy.clone();
        stamp_stateful_set_applied(&mut set, &applied).unwrap();
        sets.insert(set);
        c.status.get_or_insert_with(Default::default).pd.phase = MemberPhase::Upgrading;

        pd.set_healths(vec![
            health("demo-pd-0", 1, false),
            health("demo-pd-1", 2, true),
            health("demo-pd-2", 3, true),
        ]);
        assert!(manager.sync(&mut c).await.unwrap_err().is_requeue());
        assert_eq!(c.status.as_ref().unwrap().pd.phase, MemberPhase::Upgrading);

        pd.set_healths(
            MEMBERS
                .iter()
                .enumerate()
                .map(|(i, n)| health(n, i as u64 + 1, true))
                .collect(),
        );
        manager.sync(&mut c).await.unwrap();
        assert_eq!(c.status.as_ref().unwrap().pd.phase, MemberPhase::Normal);
        assert_eq!(partition(&sets.get("demo-pd").unwrap()), Some(0));

        // The next pass restores the partition through the strategy patch.
        manager.sync(&mut c).await.unwrap();
        assert_eq!(partition(&sets.get("demo-pd").unwrap()), Some(3));
        assert_eq!(c.status.unwrap().pd.phase, MemberPhase::Normal);
    }

    #[tokio::test]
    async fn test_replica_change_is_rejected_without_writes() {
        let h = harness();
        let mut c = bootstrapped(&h).await;

        c.spec.pd.replicas = 5;
        h.manager.sync(&mut c).await.unwrap();

        assert_eq!(h.sets.updates.load(Ordering::SeqCst), 0);
        assert_eq!(replicas(&h.sets.get("demo-pd").unwrap()), 3);
        assert_eq!(h.upgrader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_strategy_drift_is_patched_in_place() {
        let h = harness();
        let mut c = bootstrapped(&h).await;

        // Left at partition 0 by a finished rollout.
        let mut applied = build_stateful_set(&c, "standard").unwrap().spec.unwrap();
        applied
            .update_strategy
            .as_mut()
            .unwrap()
            .rolling_update
            .as_mut()
            .unwrap()
            .partition = Some(0);
        let mut set = h.sets.get("demo-pd").unwrap();
        set.spec.as_mut().unwrap().update_strategy = applied.update_strategy.clone();
        stamp_stateful_set_applied(&mut set, &applied).unwrap();
        h.sets.insert(set);

        h.manager.sync(&mut c).await.unwrap();

        assert_eq!(h.sets.updates.load(Ordering::SeqCst), 1);
        let set = h.sets.get("demo-pd").unwrap();
        assert_eq!(partition(&set), Some(3));
        assert_eq!(set.spec.unwrap().revision_history_limit, Some(10));
    }

    #[tokio::test]
    async fn test_status_failure_does_not_abort_sync() {
        let h = harness();
        let mut c = bootstrapped(&h).await;
        h.pd.fail_cluster.store(true, Ordering::SeqCst);

        h.manager.sync(&mut c).await.unwrap();
        let status = c.status.unwrap();
        assert!(!status.pd.synced);
        assert!(status.pd.members.is_empty());
    }

    #[test]
    fn test_check_rescale() {
        let c = cluster("demo");
        let live = build_stateful_set(&c, "standard").unwrap();

        let mut bigger = c.clone();
        bigger.spec.pd.replicas = 4;
        let desired = build_stateful_set(&bigger, "standard").unwrap();

        assert!(check_rescale(&live, &live).is_ok());
        assert!(matches!(
            check_rescale(&desired, &live),
            Err(Error::Unsupported(_))
        ));
    }
}
