use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use pd_operator::controller::{
    self, HttpPdControl, KubeControl, ManagerConfig, PartitionUpgrader, PdMemberManager,
    StatusAggregator,
};
use pd_operator::discovery::{self, ClusterKey, Coordinator, DiscoveryConfig, KubeRegistryStore};
use pd_operator::rest_api::{self, ApiState};
use pd_operator::telemetry::{self, LogFormat};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ManagedCluster controller and the operator REST API
    Run(RunArgs),
    /// Run the bootstrap discovery service
    Discovery(DiscoveryArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace holding the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Storage class for PD volumes when the cluster names none
    #[arg(long, env = "DEFAULT_STORAGE_CLASS", default_value = "standard")]
    default_storage_class: String,

    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    api_port: u16,

    /// Timeout for every PD admin API call
    #[arg(long, env = "PD_ADMIN_TIMEOUT_SECS", default_value_t = 5)]
    admin_timeout_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Parser, Debug)]
struct DiscoveryArgs {
    #[arg(long, env = "DISCOVERY_PORT", default_value_t = 10261)]
    port: u16,

    /// Cluster served at /proxy-config
    #[arg(long, env = "CLUSTER_NAME")]
    cluster: Option<String>,

    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Retries after a conflicting registry write
    #[arg(long, env = "MAX_CAS_RETRIES", default_value_t = 5)]
    max_cas_retries: u32,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 5)]
    request_timeout_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("PD Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
        Commands::Discovery(discovery_args) => run_discovery(discovery_args).await,
    }
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    telemetry::init("pd-operator", args.log_format)?;
    info!("Starting PD operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let leader_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });
    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));
    {
        let lease_client = client.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            run_leader_election(lease_client, &leader_namespace, &holder_identity, is_leader_bg)
                .await;
        });
    }

    let kube_control = Arc::new(KubeControl::new(client.clone()));
    let pd_control = Arc::new(HttpPdControl::new(Duration::from_secs(
        args.admin_timeout_secs,
    ))?);
    let status = StatusAggregator::new(pd_control, kube_control.clone());
    let upgrader = Arc::new(PartitionUpgrader::new(
        kube_control.clone(),
        kube_control.clone(),
    ));
    let manager = Arc::new(PdMemberManager::new(
        kube_control.clone(),
        kube_control.clone(),
        status,
        upgrader,
        ManagerConfig {
            default_storage_class: args.default_storage_class.clone(),
        },
    ));

    let state = Arc::new(controller::ControllerState {
        client: client.clone(),
        manager,
        status_writer: kube_control,
        is_leader: Arc::clone(&is_leader),
    });

    let api_state = ApiState {
        client: client.clone(),
        is_leader: Arc::clone(&is_leader),
    };
    let api_port = args.api_port;
    tokio::spawn(async move {
        if let Err(e) = rest_api::run_server(api_state, api_port).await {
            error!("REST API server error: {:?}", e);
        }
    });

    let result = controller::run_controller(state).await;

    telemetry::shutdown();
    Ok(result?)
}

async fn run_discovery(args: DiscoveryArgs) -> anyhow::Result<()> {
    telemetry::init("pd-discovery", args.log_format)?;
    info!("Starting PD discovery v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let config = DiscoveryConfig {
        max_cas_retries: args.max_cas_retries,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        ..Default::default()
    };
    let store = Arc::new(KubeRegistryStore::new(client));
    let state = discovery::DiscoveryState {
        coordinator: Arc::new(Coordinator::new(store, config)),
        proxy_cluster: args
            .cluster
            .map(|name| ClusterKey::new(args.namespace.clone(), name)),
    };

    discovery::serve_forever(state, args.port).await;
    Ok(())
}

const LEASE_NAME: &str = "pd-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(existing) = leases.get_opt(LEASE_NAME).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        leases.create(&PostParams::default(), &lease).await?;
        info!("Created lease {} with holder {}", LEASE_NAME, identity);
        return Ok(true);
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    if current_holder == Some(identity) {
        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        leases
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(true);
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true);

    if !expired {
        return Ok(false);
    }

    info!("Lease held by {:?} has expired, taking over", current_holder);
    // The resourceVersion makes a concurrent takeover fail with 409.
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": existing.metadata.resource_version },
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}
