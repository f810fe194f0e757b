//! Main reconciler for ManagedCluster resources
//!
//! Implements the controller pattern using kube-rs runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Event, Service};
use kube::{
    api::{Api, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::control::ClusterStatusWriter;
use super::member_manager::MemberManager;
use crate::crd::ManagedCluster;
use crate::error::{Error, Result};

/// Requeue delay for expected transient states and retriable errors
pub const SHORT_REQUEUE: Duration = Duration::from_secs(15);
/// Requeue delay for errors that need a human, and the steady-state resync
pub const LONG_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub manager: Arc<dyn MemberManager>,
    pub status_writer: Arc<dyn ClusterStatusWriter>,
    /// Flipped by the leader election loop; followers skip reconciliation
    pub is_leader: Arc<AtomicBool>,
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let clusters: Api<ManagedCluster> = Api::all(client.clone());

    info!("Starting ManagedCluster controller");

    // Verify CRD exists
    match clusters.list(&Default::default()).await {
        Ok(_) => info!("ManagedCluster CRD is available"),
        Err(e) => {
            error!(
                "ManagedCluster CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "ManagedCluster CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(clusters, Config::default())
        .owns::<StatefulSet>(Api::all(client.clone()), Config::default())
        .owns::<Service>(Api::all(client.clone()), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Helper to emit a Kubernetes Event
async fn emit_event(
    client: &Client,
    cluster: &ManagedCluster,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", cluster.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: cluster.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// The reconciliation function
async fn reconcile(obj: Arc<ManagedCluster>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping {}", obj.name_any());
        return Ok(Action::requeue(LONG_REQUEUE));
    }

    let started = Instant::now();
    let result = reconcile_cluster(ctx.manager.as_ref(), ctx.status_writer.as_ref(), &obj).await;

    if let Err(Error::ValidationError(message)) = &result {
        if let Err(e) = emit_event(&ctx.client, &obj, "Warning", "InvalidSpec", message).await {
            warn!("Failed to emit event for {}: {}", obj.name_any(), e);
        }
    }

    #[cfg(feature = "metrics")]
    {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        super::metrics::inc_reconcile("managedcluster", outcome);
        super::metrics::observe_reconcile_duration_seconds(
            "managedcluster",
            started.elapsed().as_secs_f64(),
        );
    }
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    result
}

/// One reconciliation pass over a ManagedCluster
///
/// Runs the member manager on a copy of the object, then persists the status
/// if the pass changed it, whether or not the pass succeeded. A `Requeue`
/// outcome is turned into a short requeue rather than an error.
#[instrument(skip(manager, status_writer, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn reconcile_cluster(
    manager: &dyn MemberManager,
    status_writer: &dyn ClusterStatusWriter,
    obj: &ManagedCluster,
) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    if let Err(errors) = obj.spec.validate() {
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        warn!("Validation failed for {}/{}: {}", namespace, name, message);
        return Err(Error::ValidationError(message));
    }

    let mut cluster = obj.clone();
    let result = manager.sync(&mut cluster).await;

    if cluster.status != obj.status {
        if let Err(e) = status_writer.update_status(&cluster).await {
            error!("Failed to persist status of {}/{}: {}", namespace, name, e);
            return Err(result.err().unwrap_or(e));
        }
    }

    match result {
        Ok(()) => Ok(Action::requeue(LONG_REQUEUE)),
        Err(e) if e.is_requeue() => {
            info!("{}", e);
            Ok(Action::requeue(SHORT_REQUEUE))
        }
        Err(e) => Err(e),
    }
}

/// Error policy for the controller
fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", cluster.name_any(), error);

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        SHORT_REQUEUE
    } else {
        LONG_REQUEUE
    };

    Action::requeue(retry_duration)
}
