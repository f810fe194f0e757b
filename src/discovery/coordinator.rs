//! Bootstrap coordinator
//!
//! Every starting PD pod asks, through the discovery server, how it should
//! start: as a founding member (`--initial-cluster=...`) or as a joiner of an
//! already bootstrapped cluster (`--join=...`). Calls from the pods of one
//! cluster are concurrent and unordered; the registry record is the only
//! shared state and every change to it goes through compare-and-swap.
//!
//! The founding roster is deterministic: ordinals `0..replicas` behind the
//! same peer Service. Every founding caller therefore gets the same
//! `initial-cluster` string no matter in which order the calls land.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::registry::{ClusterKey, FoundingPeer, Registration, RegistryStore};
use crate::controller::resources::{CLIENT_PORT, PEER_PORT, RPC_PORT};
use crate::error::{Error, Result};

/// Tunables for the coordinator
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Retries after a conflicting registry write before giving up
    pub max_cas_retries: u32,
    /// Base delay between conflicting writes, doubled per attempt
    pub retry_backoff: Duration,
    /// Upper bound on every registry call
    pub request_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: 5,
            retry_backoff: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// A starting member, decoded from its advertised peer URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub key: ClusterKey,
    pub ordinal: i32,
    /// Member name, which is also the pod name
    pub name: String,
    scheme: String,
    /// Host part after the pod name, e.g. `demo-pd-peer.default.svc`
    domain: String,
    port: u16,
}

impl PeerAddress {
    /// Parse `http://{cluster}-pd-{ordinal}.{cluster}-pd-peer.{namespace}[.svc...]:{port}`
    pub fn parse(advertise_peer_url: &str) -> Result<Self> {
        let malformed =
            |why: &str| Error::Malformed(format!("advertise peer URL {advertise_peer_url:?}: {why}"));

        let url = Url::parse(advertise_peer_url).map_err(|e| malformed(&e.to_string()))?;
        let host = url.host_str().ok_or_else(|| malformed("no host"))?;

        let (pod, domain) = host
            .split_once('.')
            .ok_or_else(|| malformed("host has no peer service"))?;
        let mut labels = domain.split('.');
        let peer_service = labels.next().unwrap_or_default();
        let namespace = labels
            .next()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| malformed("host has no namespace"))?;

        let cluster = peer_service
            .strip_suffix("-pd-peer")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| malformed("not a PD peer service"))?;
        let ordinal = pod
            .strip_prefix(cluster)
            .and_then(|rest| rest.strip_prefix("-pd-"))
            .and_then(|n| n.parse::<i32>().ok())
            .filter(|n| *n >= 0)
            .ok_or_else(|| malformed("pod name carries no ordinal"))?;

        Ok(Self {
            key: ClusterKey::new(namespace, cluster),
            ordinal,
            name: pod.to_string(),
            scheme: url.scheme().to_string(),
            domain: domain.to_string(),
            port: url.port().unwrap_or(PEER_PORT as u16),
        })
    }

    fn member_name(&self, ordinal: i32) -> String {
        format!("{}-pd-{}", self.key.name, ordinal)
    }

    fn url_for(&self, ordinal: i32, port: u16) -> String {
        format!(
            "{}://{}.{}:{}",
            self.scheme,
            self.member_name(ordinal),
            self.domain,
            port
        )
    }

    pub fn peer_url(&self) -> String {
        self.url_for(self.ordinal, self.port)
    }

    pub fn client_url(&self) -> String {
        self.url_for(self.ordinal, CLIENT_PORT as u16)
    }

    /// `--initial-cluster` for a founding set of `replicas` members
    fn initial_cluster_args(&self, replicas: i32) -> String {
        let mut roster: Vec<(String, String)> = (0..replicas)
            .map(|i| (self.member_name(i), self.url_for(i, self.port)))
            .collect();
        roster.sort();
        let peers = roster
            .iter()
            .map(|(name, url)| format!("{name}={url}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("--initial-cluster={peers}")
    }
}

/// Exponential backoff, capped at 32x the base
pub fn calculate_backoff(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt.min(5)))
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 2;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Routing document served at `/proxy-config`
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub cluster: String,
    pub leader: Option<String>,
    pub pd_addrs: Vec<String>,
    pub client_urls: Vec<String>,
}

fn rpc_addr(client_url: &str) -> Option<String> {
    let url = Url::parse(client_url).ok()?;
    Some(format!("{}:{}", url.host_str()?, RPC_PORT))
}

pub struct Coordinator {
    store: Arc<dyn RegistryStore>,
    config: DiscoveryConfig,
}

impl Coordinator {
    pub fn new(store: Arc<dyn RegistryStore>, config: DiscoveryConfig) -> Self {
        Self { store, config }
    }

    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.request_timeout, call)
            .await
            .map_err(|_| {
                Error::Unavailable(format!(
                    "{what} timed out after {:?}",
                    self.config.request_timeout
                ))
            })?
    }

    /// Resolve the startup arguments for one starting member
    ///
    /// # Errors
    ///
    /// - `Malformed` when the URL does not name a PD member
    /// - `NotFound` when the owning cluster is gone
    /// - `Unavailable` for an ordinal outside the founding roster before
    ///   founding completed, or a registry call that timed out
    /// - `ConflictExhausted` when concurrent writers kept winning
    #[instrument(skip(self))]
    pub async fn discover(&self, advertise_peer_url: &str) -> Result<String> {
        let peer = PeerAddress::parse(advertise_peer_url)?;
        let attempts = self.config.max_cas_retries + 1;

        for attempt in 0..attempts {
            let registration = self
                .bounded("registry load", self.store.load(&peer.key))
                .await?;

            if registration.record.founded {
                return Ok(join_args(&registration, &peer));
            }

            if peer.ordinal >= registration.replicas {
                return Err(Error::Unavailable(format!(
                    "{} is outside the founding set of {} and {} is not founded yet",
                    peer.name, registration.replicas, peer.key
                )));
            }

            // A founding member that restarted before founding completed.
            if registration.record.peers.contains_key(&peer.name) {
                return Ok(peer.initial_cluster_args(registration.replicas));
            }

            let mut record = registration.record.clone();
            record.peers.insert(
                peer.name.clone(),
                FoundingPeer {
                    peer_url: peer.peer_url(),
                    client_url: peer.client_url(),
                },
            );
            record.founded = record.peers.len() >= registration.replicas as usize;

            let written = self
                .bounded(
                    "registry write",
                    self.store
                        .compare_and_swap(&peer.key, &record, &registration.version),
                )
                .await;

            match written {
                Ok(version) => {
                    if record.founded {
                        info!("Founding set of {} is complete", peer.key);
                    }
                    debug!(
                        "Registered {} as founding member of {} (version {})",
                        peer.name, peer.key, version
                    );
                    return Ok(peer.initial_cluster_args(registration.replicas));
                }
                Err(Error::Conflict(reason)) => {
                    let delay = with_jitter(calculate_backoff(attempt, self.config.retry_backoff));
                    debug!(
                        "Registry conflict for {} (attempt {}/{}): {}; retrying in {:?}",
                        peer.name,
                        attempt + 1,
                        attempts,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            "Giving up on registering {} after {} conflicting writes",
            peer.name, attempts
        );
        Err(Error::ConflictExhausted {
            cluster: peer.key.to_string(),
            attempts,
        })
    }

    /// Build the proxy routing document for a cluster
    ///
    /// # Errors
    ///
    /// `Unavailable` until at least one member is known.
    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn get_proxy_config(&self, key: &ClusterKey) -> Result<String> {
        let registration = self.bounded("registry load", self.store.load(key)).await?;

        let mut client_urls: Vec<String> = registration
            .members
            .values()
            .map(|m| m.client_url.clone())
            .filter(|u| !u.is_empty())
            .collect();
        if client_urls.is_empty() {
            client_urls = registration
                .record
                .peers
                .values()
                .map(|p| p.client_url.clone())
                .collect();
        }
        if client_urls.is_empty() {
            return Err(Error::Unavailable(format!("no PD member of {key} is known yet")));
        }
        client_urls.sort();

        let config = ProxyConfig {
            cluster: key.to_string(),
            leader: registration.leader.clone(),
            pd_addrs: client_urls.iter().filter_map(|u| rpc_addr(u)).collect(),
            client_urls,
        };
        Ok(serde_json::to_string(&config)?)
    }
}

/// `--join` pointing at the founding members other than the caller
fn join_args(registration: &Registration, peer: &PeerAddress) -> String {
    let others: Vec<&str> = registration
        .record
        .peers
        .iter()
        .filter(|(name, _)| **name != peer.name)
        .map(|(_, p)| p.client_url.as_str())
        .collect();
    let urls = if others.is_empty() {
        registration
            .record
            .peers
            .values()
            .map(|p| p.client_url.as_str())
            .collect()
    } else {
        others
    };
    format!("--join={}", urls.join(","))
}
