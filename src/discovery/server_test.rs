//! HTTP-level tests for the discovery server

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::engine::general_purpose::{STANDARD, URL_SAFE};
    use base64::Engine;
    use tower::ServiceExt;

    use super::super::coordinator::{Coordinator, DiscoveryConfig};
    use super::super::registry::memory::MemoryRegistryStore;
    use super::super::registry::ClusterKey;
    use super::super::server::{decode_peer_url, router, DiscoveryState};

    const PEER_URL: &str = "http://demo-pd-0.demo-pd-peer.default.svc:2380";

    fn state(proxy_cluster: Option<ClusterKey>) -> DiscoveryState {
        let key = ClusterKey::new("default", "demo");
        let store = Arc::new(MemoryRegistryStore::with_cluster(&key, 3));
        DiscoveryState {
            coordinator: Arc::new(Coordinator::new(
                store,
                DiscoveryConfig {
                    retry_backoff: Duration::from_millis(1),
                    ..Default::default()
                },
            )),
            proxy_cluster,
        }
    }

    async fn get(state: DiscoveryState, uri: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_decode_accepts_both_alphabets() {
        // The standard encoding of this string contains '+'.
        let raw = "http://a.b/?>>>~~~";
        assert_eq!(decode_peer_url(&STANDARD.encode(raw)).unwrap(), raw);
        assert_eq!(decode_peer_url(&URL_SAFE.encode(raw)).unwrap(), raw);
        assert!(decode_peer_url("%%%").is_err());
    }

    #[tokio::test]
    async fn test_new_member_returns_startup_args() {
        let uri = format!("/new/{}", STANDARD.encode(PEER_URL));
        let (status, body) = get(state(None), &uri).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("--initial-cluster=demo-pd-0=http://demo-pd-0."));
        assert!(body.contains("demo-pd-2="));
    }

    #[tokio::test]
    async fn test_undecodable_segment_is_a_500() {
        let (status, body) = get(state(None), "/new/!!!not-base64!!!").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("base64"));
    }

    #[tokio::test]
    async fn test_coordinator_error_is_a_500() {
        let uri = format!("/new/{}", STANDARD.encode("http://nobody.example.com:2380"));
        let (status, body) = get(state(None), &uri).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("malformed"));
    }

    #[tokio::test]
    async fn test_proxy_config_without_members_is_a_500() {
        let key = ClusterKey::new("default", "demo");
        let (status, _) = get(state(Some(key)), "/proxy-config").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_proxy_config_without_cluster_is_a_500() {
        let (status, body) = get(state(None), "/proxy-config").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("no cluster configured"));
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get(state(None), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
