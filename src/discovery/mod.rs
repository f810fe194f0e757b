//! Bootstrap discovery for starting PD members
//!
//! Decides, per starting pod, between founding a new PD cluster and joining
//! an existing one, and serves that decision over HTTP.

mod coordinator;
pub mod registry;
mod server;
#[cfg(test)]
mod server_test;

pub use coordinator::{calculate_backoff, Coordinator, DiscoveryConfig, PeerAddress, ProxyConfig};
pub use registry::{
    ClusterKey, FoundingPeer, KubeRegistryStore, Registration, RegistryRecord, RegistryStore,
    BOOTSTRAP_REGISTRY_ANNOTATION,
};
pub use server::{decode_peer_url, router, run_server, serve_forever, DiscoveryState, RESTART_DELAY};
