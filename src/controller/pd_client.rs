//! HTTP client for the PD admin API
//!
//! Only three reads are needed by the status aggregator: cluster identity,
//! per-member health and the current leader. Any transport error or
//! non-success status is a hard failure for the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::controller::resources::{member_name, CLIENT_PORT};
use crate::crd::ManagedCluster;
use crate::error::{Error, Result};

/// `GET /pd/api/v1/cluster`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id: u64,
    #[serde(default)]
    pub max_peer_count: u32,
}

/// One entry of `GET /pd/api/v1/health`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct MemberHealth {
    #[serde(default)]
    pub name: String,
    pub member_id: u64,
    #[serde(default)]
    pub client_urls: Vec<String>,
    pub health: bool,
}

/// `GET /pd/api/v1/leader`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct LeaderInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub member_id: u64,
    #[serde(default)]
    pub client_urls: Vec<String>,
}

/// Admin API of one PD cluster
#[async_trait]
pub trait PdClient: Send + Sync {
    async fn get_cluster(&self) -> Result<ClusterInfo>;

    async fn get_health(&self) -> Result<Vec<MemberHealth>>;

    async fn get_leader(&self) -> Result<LeaderInfo>;
}

/// Hands out an admin API client for a given cluster
pub trait PdControl: Send + Sync {
    fn client_for(&self, cluster: &ManagedCluster) -> Arc<dyn PdClient>;
}

/// reqwest-backed admin API client
pub struct HttpPdClient {
    http_client: Client,
    base_url: String,
}

impl HttpPdClient {
    pub fn new(http_client: Client, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Querying PD admin API {}", url);

        let resp = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("GET {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Unavailable(format!(
                "GET {} returned HTTP {}",
                url,
                resp.status()
            )));
        }

        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl PdClient for HttpPdClient {
    async fn get_cluster(&self) -> Result<ClusterInfo> {
        self.get_json("/pd/api/v1/cluster").await
    }

    async fn get_health(&self) -> Result<Vec<MemberHealth>> {
        self.get_json("/pd/api/v1/health").await
    }

    async fn get_leader(&self) -> Result<LeaderInfo> {
        self.get_json("/pd/api/v1/leader").await
    }
}

/// Builds HTTP clients that address each cluster's client Service
pub struct HttpPdControl {
    http_client: Client,
}

impl HttpPdControl {
    /// Every admin call is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ConfigError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http_client })
    }
}

/// In-cluster URL of a cluster's client Service
pub fn pd_client_url(cluster: &ManagedCluster) -> String {
    format!(
        "http://{}.{}:{}",
        member_name(&cluster.name_any()),
        cluster.namespace().unwrap_or_else(|| "default".to_string()),
        CLIENT_PORT
    )
}

impl PdControl for HttpPdControl {
    fn client_for(&self, cluster: &ManagedCluster) -> Arc<dyn PdClient> {
        Arc::new(HttpPdClient::new(
            self.http_client.clone(),
            pd_client_url(cluster),
        ))
    }
}
