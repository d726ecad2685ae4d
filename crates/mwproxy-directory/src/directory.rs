//! Node directory with a lazily refreshed IP → node cache
//!
//! All state (token, cache, round-robin cursor) sits behind one async mutex.
//! Token issuance and directory requests run while the lock is held, so at
//! most one refresh is in flight and no caller ever observes a half-built
//! cache. Concurrent lookups queue behind an in-flight refresh.

use crate::lister::{ListError, NodeLister};
use crate::node::Node;
use async_trait::async_trait;
use mwproxy_auth::{AuthError, Credentials, TokenIssuer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors surfaced by directory operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Directory API returned status {0}")]
    UpstreamStatus(u16),

    #[error("Directory API request failed: {0}")]
    Upstream(String),

    #[error("Failed to decode directory response: {0}")]
    Decode(String),

    #[error("No node with IP {0} found")]
    NotFound(IpAddr),

    #[error("There are no nodes in the directory")]
    NoNodesAvailable,
}

impl From<AuthError> for DirectoryError {
    fn from(e: AuthError) -> Self {
        DirectoryError::Auth(e.to_string())
    }
}

impl From<ListError> for DirectoryError {
    fn from(e: ListError) -> Self {
        match e {
            ListError::Unauthorized => DirectoryError::Auth(e.to_string()),
            ListError::Status(status) => DirectoryError::UpstreamStatus(status),
            ListError::Transport(msg) => DirectoryError::Upstream(msg),
            ListError::Decode(msg) => DirectoryError::Decode(msg),
        }
    }
}

/// Node resolution as seen by connection routing
#[async_trait]
pub trait NodeResolver: Send + Sync {
    /// Node whose primary IP is `ip`
    async fn lookup_by_ip(&self, ip: IpAddr) -> Result<String, DirectoryError>;

    /// Next node in round-robin order
    async fn pick_random(&self) -> Result<String, DirectoryError>;
}

/// Directory configuration
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub credentials: Credentials,
    /// Only nodes of this cluster are kept (all nodes when `None`)
    pub cluster_id: Option<String>,
    /// Token to use until the directory first rejects it
    pub initial_token: Option<String>,
}

impl DirectoryConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            cluster_id: None,
            initial_token: None,
        }
    }

    /// Set the cluster filter; an empty id disables filtering
    pub fn with_cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        let cluster_id = cluster_id.into();
        self.cluster_id = (!cluster_id.is_empty()).then_some(cluster_id);
        self
    }

    pub fn with_initial_token(mut self, token: Option<String>) -> Self {
        self.initial_token = token.filter(|t| !t.is_empty());
        self
    }
}

/// Snapshot of the last successful listing
#[derive(Debug, Default)]
struct DirectoryCache {
    ip_to_uuid: HashMap<IpAddr, String>,
    /// Listing order, used for round-robin
    node_uuids: Vec<String>,
}

impl DirectoryCache {
    fn build(nodes: Vec<Node>, cluster_id: Option<&str>) -> Self {
        let mut cache = DirectoryCache::default();

        for node in nodes {
            if let Some(cluster_id) = cluster_id {
                if node.cluster_uuid != cluster_id {
                    continue;
                }
            }

            match node.primary_ip.parse::<IpAddr>() {
                Ok(ip) => {
                    cache.ip_to_uuid.insert(ip, node.uuid.clone());
                }
                Err(_) => {
                    warn!(
                        uuid = %node.uuid,
                        primary_ip = %node.primary_ip,
                        "Node has no usable primary IP, excluding it from IP lookups"
                    );
                }
            }
            cache.node_uuids.push(node.uuid);
        }

        cache
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    token: Option<String>,
    cache: Option<DirectoryCache>,
    cursor: usize,
}

/// Shared node directory
pub struct NodeDirectory {
    issuer: Arc<dyn TokenIssuer>,
    lister: Arc<dyn NodeLister>,
    credentials: Credentials,
    cluster_id: Option<String>,
    state: Mutex<DirectoryState>,
}

impl NodeDirectory {
    pub fn new(
        config: DirectoryConfig,
        issuer: Arc<dyn TokenIssuer>,
        lister: Arc<dyn NodeLister>,
    ) -> Self {
        Self {
            issuer,
            lister,
            credentials: config.credentials,
            cluster_id: config.cluster_id,
            state: Mutex::new(DirectoryState {
                token: config.initial_token,
                cache: None,
                cursor: 0,
            }),
        }
    }

    /// Node uuid whose primary IP is `ip`, refreshing the cache on a miss
    pub async fn lookup_by_ip(&self, ip: IpAddr) -> Result<String, DirectoryError> {
        let mut state = self.state.lock().await;

        if let Some(uuid) = state.cache.as_ref().and_then(|c| c.ip_to_uuid.get(&ip)) {
            return Ok(uuid.clone());
        }

        self.refresh(&mut state).await?;

        state
            .cache
            .as_ref()
            .and_then(|c| c.ip_to_uuid.get(&ip))
            .cloned()
            .ok_or(DirectoryError::NotFound(ip))
    }

    /// Next node uuid in listing order, refreshing first if the cache is empty
    pub async fn pick_random(&self) -> Result<String, DirectoryError> {
        let mut guard = self.state.lock().await;

        if guard.cache.is_none() {
            self.refresh(&mut guard).await?;
        }

        let state = &mut *guard;
        let nodes = state
            .cache
            .as_ref()
            .map(|c| c.node_uuids.as_slice())
            .unwrap_or_default();
        if nodes.is_empty() {
            return Err(DirectoryError::NoNodesAvailable);
        }

        let uuid = nodes[state.cursor % nodes.len()].clone();
        state.cursor = state.cursor.wrapping_add(1);

        Ok(uuid)
    }

    /// Drop the cache; the token is kept
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.cache = None;
        debug!("Node cache invalidated");
    }

    async fn issue_token(&self) -> Result<String, DirectoryError> {
        let token = self.issuer.issue_token(&self.credentials).await?;
        info!(
            username = %self.credentials.username,
            project_id = %self.credentials.project_id,
            "Refreshed directory token"
        );
        Ok(token)
    }

    /// Rebuild the cache from a fresh listing. Called with the state lock held.
    async fn refresh(&self, state: &mut DirectoryState) -> Result<(), DirectoryError> {
        let mut token_refreshed = false;
        let token = match state.token.clone() {
            Some(token) => token,
            None => {
                let token = self.issue_token().await?;
                state.token = Some(token.clone());
                token_refreshed = true;
                token
            }
        };

        let nodes = match self.lister.list_nodes(&token).await {
            Err(ListError::Unauthorized) if token_refreshed => {
                return Err(DirectoryError::Auth(
                    "directory rejected a freshly issued token".to_string(),
                ));
            }
            Err(ListError::Unauthorized) => {
                debug!("Directory rejected the current token, reissuing once");
                let token = self.issue_token().await?;
                state.token = Some(token.clone());

                match self.lister.list_nodes(&token).await {
                    Err(ListError::Unauthorized) => {
                        return Err(DirectoryError::Auth(
                            "directory rejected the token after reissue".to_string(),
                        ));
                    }
                    result => result?,
                }
            }
            result => result?,
        };

        let fetched = nodes.len();
        let cache = DirectoryCache::build(nodes, self.cluster_id.as_deref());

        info!(
            fetched = fetched,
            retained = cache.node_uuids.len(),
            cluster_id = self.cluster_id.as_deref().unwrap_or("*"),
            "Refreshed node cache"
        );
        debug!(node_map = ?cache.ip_to_uuid, "Node map");

        state.cache = Some(cache);
        Ok(())
    }
}

#[async_trait]
impl NodeResolver for NodeDirectory {
    async fn lookup_by_ip(&self, ip: IpAddr) -> Result<String, DirectoryError> {
        NodeDirectory::lookup_by_ip(self, ip).await
    }

    async fn pick_random(&self) -> Result<String, DirectoryError> {
        NodeDirectory::pick_random(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeIssuer {
        issued: AtomicUsize,
        fail: bool,
    }

    impl FakeIssuer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                issued: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                issued: AtomicUsize::new(0),
                fail: true,
            })
        }

        fn issued(&self) -> usize {
            self.issued.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenIssuer for FakeIssuer {
        async fn issue_token(&self, _credentials: &Credentials) -> Result<String, AuthError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(AuthError::Rejected(401));
            }
            Ok(format!("token-{}", n))
        }
    }

    /// Plays back scripted results, then serves `nodes` forever
    struct FakeLister {
        calls: AtomicUsize,
        scripted: std::sync::Mutex<VecDeque<Result<Vec<Node>, ListError>>>,
        nodes: Vec<Node>,
        tokens: std::sync::Mutex<Vec<String>>,
        delay: Duration,
    }

    impl FakeLister {
        fn new(nodes: Vec<Node>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                scripted: std::sync::Mutex::new(VecDeque::new()),
                nodes,
                tokens: std::sync::Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn with_script(self, script: Vec<Result<Vec<Node>, ListError>>) -> Self {
            *self.scripted.lock().unwrap() = script.into();
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn tokens(&self) -> Vec<String> {
            self.tokens.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeLister for FakeLister {
        async fn list_nodes(&self, token: &str) -> Result<Vec<Node>, ListError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().unwrap().push(token.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self.scripted.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(self.nodes.clone()))
        }
    }

    fn credentials() -> Credentials {
        Credentials::new("admin", "secret", "project-1")
    }

    fn scenario_nodes() -> Vec<Node> {
        vec![
            Node::new("n1", "c1", "10.1.1.5"),
            Node::new("n2", "c1", "10.1.1.6"),
        ]
    }

    fn directory(
        config: DirectoryConfig,
        issuer: &Arc<FakeIssuer>,
        lister: &Arc<FakeLister>,
    ) -> NodeDirectory {
        NodeDirectory::new(config, issuer.clone(), lister.clone())
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_lookup_and_round_robin_scenario() {
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(scenario_nodes()));
        let dir = directory(
            DirectoryConfig::new(credentials()).with_cluster_id("c1"),
            &issuer,
            &lister,
        );

        assert_eq!(dir.lookup_by_ip(ip("10.1.1.5")).await.unwrap(), "n1");
        assert_eq!(
            dir.lookup_by_ip(ip("10.1.1.9")).await,
            Err(DirectoryError::NotFound(ip("10.1.1.9")))
        );
        assert_eq!(dir.pick_random().await.unwrap(), "n1");
        assert_eq!(dir.pick_random().await.unwrap(), "n2");
        assert_eq!(dir.pick_random().await.unwrap(), "n1");

        // Initial fill plus one refresh for the miss; picks are served from cache
        assert_eq!(lister.calls(), 2);
        assert_eq!(issuer.issued(), 1);
    }

    #[tokio::test]
    async fn test_cache_coherence() {
        let nodes = vec![
            Node::new("a", "c1", "192.168.0.1"),
            Node::new("b", "c1", "192.168.0.2"),
            Node::new("c", "c1", "192.168.0.3"),
        ];
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(nodes.clone()));
        let dir = directory(DirectoryConfig::new(credentials()), &issuer, &lister);

        for node in &nodes {
            assert_eq!(
                dir.lookup_by_ip(ip(&node.primary_ip)).await.unwrap(),
                node.uuid
            );
        }
        assert_eq!(lister.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_exactly_one_fetch() {
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(scenario_nodes()));
        let dir = directory(DirectoryConfig::new(credentials()), &issuer, &lister);

        dir.lookup_by_ip(ip("10.1.1.5")).await.unwrap();
        assert_eq!(lister.calls(), 1);

        dir.invalidate().await;
        assert_eq!(dir.lookup_by_ip(ip("10.1.1.6")).await.unwrap(), "n2");
        assert_eq!(lister.calls(), 2);

        dir.lookup_by_ip(ip("10.1.1.5")).await.unwrap();
        assert_eq!(lister.calls(), 2);

        // Invalidation keeps the token
        assert_eq!(issuer.issued(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_on_empty_cache() {
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(scenario_nodes()));
        let dir = directory(DirectoryConfig::new(credentials()), &issuer, &lister);

        dir.invalidate().await;
        dir.invalidate().await;
        assert_eq!(dir.pick_random().await.unwrap(), "n1");
        assert_eq!(lister.calls(), 1);
    }

    #[tokio::test]
    async fn test_round_robin_cycles_in_listing_order() {
        let nodes: Vec<Node> = (0..4)
            .map(|i| Node::new(format!("node-{}", i), "c1", format!("10.0.0.{}", i + 1)))
            .collect();
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(nodes.clone()));
        let dir = directory(DirectoryConfig::new(credentials()), &issuer, &lister);

        for node in &nodes {
            assert_eq!(dir.pick_random().await.unwrap(), node.uuid);
        }
        assert_eq!(dir.pick_random().await.unwrap(), "node-0");
        assert_eq!(lister.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_token_retried_once() {
        let issuer = FakeIssuer::new();
        let lister = Arc::new(
            FakeLister::new(scenario_nodes()).with_script(vec![Err(ListError::Unauthorized)]),
        );
        let dir = directory(
            DirectoryConfig::new(credentials()).with_initial_token(Some("stale".to_string())),
            &issuer,
            &lister,
        );

        assert_eq!(dir.lookup_by_ip(ip("10.1.1.5")).await.unwrap(), "n1");
        assert_eq!(issuer.issued(), 1);
        assert_eq!(lister.calls(), 2);
        assert_eq!(lister.tokens(), vec!["stale", "token-1"]);
    }

    #[tokio::test]
    async fn test_second_unauthorized_fails_without_more_reissues() {
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(scenario_nodes()).with_script(vec![
            Err(ListError::Unauthorized),
            Err(ListError::Unauthorized),
        ]));
        let dir = directory(
            DirectoryConfig::new(credentials()).with_initial_token(Some("stale".to_string())),
            &issuer,
            &lister,
        );

        let result = dir.lookup_by_ip(ip("10.1.1.5")).await;

        assert!(matches!(result, Err(DirectoryError::Auth(_))));
        assert_eq!(issuer.issued(), 1);
        assert_eq!(lister.calls(), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_with_fresh_token_not_retried() {
        let issuer = FakeIssuer::new();
        let lister = Arc::new(
            FakeLister::new(scenario_nodes()).with_script(vec![Err(ListError::Unauthorized)]),
        );
        let dir = directory(DirectoryConfig::new(credentials()), &issuer, &lister);

        let result = dir.pick_random().await;

        assert!(matches!(result, Err(DirectoryError::Auth(_))));
        assert_eq!(issuer.issued(), 1);
        assert_eq!(lister.calls(), 1);
    }

    #[tokio::test]
    async fn test_issuer_failure_skips_listing() {
        let issuer = FakeIssuer::failing();
        let lister = Arc::new(FakeLister::new(scenario_nodes()));
        let dir = directory(DirectoryConfig::new(credentials()), &issuer, &lister);

        let result = dir.lookup_by_ip(ip("10.1.1.5")).await;

        assert!(matches!(result, Err(DirectoryError::Auth(_))));
        assert_eq!(lister.calls(), 0);
    }

    #[tokio::test]
    async fn test_upstream_and_decode_errors() {
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(scenario_nodes()).with_script(vec![
            Err(ListError::Status(503)),
            Err(ListError::Decode("expected array".to_string())),
            Err(ListError::Transport("connection refused".to_string())),
        ]));
        let dir = directory(DirectoryConfig::new(credentials()), &issuer, &lister);

        assert_eq!(
            dir.pick_random().await,
            Err(DirectoryError::UpstreamStatus(503))
        );
        assert!(matches!(
            dir.pick_random().await,
            Err(DirectoryError::Decode(_))
        ));
        assert!(matches!(
            dir.pick_random().await,
            Err(DirectoryError::Upstream(_))
        ));

        // Failures never cost a token reissue, and the next call recovers
        assert_eq!(dir.pick_random().await.unwrap(), "n1");
        assert_eq!(issuer.issued(), 1);
    }

    #[tokio::test]
    async fn test_cluster_filter_excludes_other_clusters() {
        let nodes = vec![
            Node::new("n1", "c1", "10.1.1.5"),
            Node::new("x1", "c2", "10.1.1.7"),
            Node::new("n2", "c1", "10.1.1.6"),
        ];
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(nodes));
        let dir = directory(
            DirectoryConfig::new(credentials()).with_cluster_id("c1"),
            &issuer,
            &lister,
        );

        assert_eq!(
            dir.lookup_by_ip(ip("10.1.1.7")).await,
            Err(DirectoryError::NotFound(ip("10.1.1.7")))
        );
        let picks = vec![
            dir.pick_random().await.unwrap(),
            dir.pick_random().await.unwrap(),
            dir.pick_random().await.unwrap(),
        ];
        assert_eq!(picks, vec!["n1", "n2", "n1"]);
    }

    #[tokio::test]
    async fn test_unattached_and_unreported_nodes_do_not_break_listing() {
        let json = r#"[
            {"uuid": "n1", "clusterUuid": "c1", "status": "ok", "name": "w1", "primaryIp": "10.1.1.5"},
            {"uuid": "u1", "clusterUuid": null, "status": "ok", "name": "spare", "primaryIp": "10.1.1.8"},
            {"uuid": "n2", "clusterUuid": "c1", "status": null, "name": null, "primaryIp": null}
        ]"#;
        let nodes: Vec<Node> = serde_json::from_str(json).unwrap();
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(nodes));
        let dir = directory(
            DirectoryConfig::new(credentials()).with_cluster_id("c1"),
            &issuer,
            &lister,
        );

        assert_eq!(dir.lookup_by_ip(ip("10.1.1.5")).await.unwrap(), "n1");
        assert_eq!(
            dir.lookup_by_ip(ip("10.1.1.8")).await,
            Err(DirectoryError::NotFound(ip("10.1.1.8")))
        );
        // A node without a primary IP still takes part in round-robin
        assert_eq!(dir.pick_random().await.unwrap(), "n1");
        assert_eq!(dir.pick_random().await.unwrap(), "n2");
    }

    #[tokio::test]
    async fn test_no_cluster_filter_keeps_all_nodes() {
        let nodes = vec![
            Node::new("n1", "c1", "10.1.1.5"),
            Node::new("x1", "c2", "10.1.1.7"),
        ];
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(nodes));
        let dir = directory(
            DirectoryConfig::new(credentials()).with_cluster_id(""),
            &issuer,
            &lister,
        );

        assert_eq!(dir.lookup_by_ip(ip("10.1.1.7")).await.unwrap(), "x1");
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(Vec::new()));
        let dir = directory(DirectoryConfig::new(credentials()), &issuer, &lister);

        assert_eq!(
            dir.pick_random().await,
            Err(DirectoryError::NoNodesAvailable)
        );
        // An empty listing is still a valid cache
        assert_eq!(
            dir.pick_random().await,
            Err(DirectoryError::NoNodesAvailable)
        );
        assert_eq!(lister.calls(), 1);
    }

    #[tokio::test]
    async fn test_unparsable_primary_ip_still_round_robins() {
        let nodes = vec![Node::new("n1", "c1", ""), Node::new("n2", "c1", "10.1.1.6")];
        let issuer = FakeIssuer::new();
        let lister = Arc::new(FakeLister::new(nodes));
        let dir = directory(DirectoryConfig::new(credentials()), &issuer, &lister);

        assert_eq!(dir.pick_random().await.unwrap(), "n1");
        assert_eq!(dir.lookup_by_ip(ip("10.1.1.6")).await.unwrap(), "n2");
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_refresh() {
        let issuer = FakeIssuer::new();
        let lister = Arc::new(
            FakeLister::new(scenario_nodes()).with_delay(Duration::from_millis(50)),
        );
        let dir = Arc::new(directory(
            DirectoryConfig::new(credentials()),
            &issuer,
            &lister,
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let dir = dir.clone();
            handles.push(tokio::spawn(async move {
                dir.lookup_by_ip("10.1.1.6".parse().unwrap()).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "n2");
        }

        assert_eq!(lister.calls(), 1);
        assert_eq!(issuer.issued(), 1);
    }

    #[test]
    fn test_list_error_mapping() {
        assert!(matches!(
            DirectoryError::from(ListError::Unauthorized),
            DirectoryError::Auth(_)
        ));
        assert_eq!(
            DirectoryError::from(ListError::Status(500)),
            DirectoryError::UpstreamStatus(500)
        );
    }
}
