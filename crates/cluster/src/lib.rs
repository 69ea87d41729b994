//! Head/worker coordination. One node of a deployment is the head; the
//! rest register with it, heartbeat, and forward iteration-state
//! operations to it. All nodes share the same KV store. Node-to-node
//! requests authenticate with a salted digest of the cluster's shared
//! secret carried in an HTTP Basic header.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cache::{Store, StoreExt};
use models::NodeStatus;
use rand::Rng;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

mod auth;
pub use auth::{decode_basic_auth, to_basic_auth};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cluster auth rejected by {0}; check that the shared secret matches")]
    AuthFailed(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {detail}")]
    Status {
        url: String,
        status: u16,
        detail: String,
    },
    #[error("node {0} did not become ready in time")]
    NodeNotReady(String),
    #[error("operation is only allowed on the {0} node")]
    WrongRole(&'static str),
    #[error(transparent)]
    Store(#[from] cache::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Heartbeat records expire after a day regardless of watchdog pruning.
const HEARTBEAT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// How long a registering node may take to answer its readiness probe.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub head_url: String,
    pub node_url: String,
    pub secret: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_threshold: u32,
}

impl ClusterConfig {
    pub fn new(head_url: &str, node_url: &str, secret: &str) -> Self {
        ClusterConfig {
            head_url: head_url.trim_end_matches('/').to_string(),
            node_url: node_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_threshold: 3,
        }
    }
}

pub struct Cluster {
    pub head_url: String,
    pub node_url: String,
    secret: String,
    heartbeat_interval: Duration,
    heartbeat_threshold: u32,
    store: Arc<dyn Store>,
    http: reqwest::Client,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl Cluster {
    pub fn new(config: ClusterConfig, store: Arc<dyn Store>) -> Self {
        Cluster {
            head_url: config.head_url,
            node_url: config.node_url,
            secret: config.secret,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_threshold: config.heartbeat_threshold,
            store,
            http: reqwest::Client::new(),
            shutdown: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn is_head(&self) -> bool {
        self.head_url == self.node_url
    }

    fn key(&self, key: &str) -> String {
        format!("cluster:{key}")
    }

    fn digest(&self, salt: &str) -> String {
        hex::encode(Sha256::digest(format!("{salt}:{}", self.secret).as_bytes()))
    }

    /// Validate the (salt, digest) pair of an incoming node request.
    pub fn is_valid_auth(&self, salt: &str, digest: &str) -> bool {
        self.digest(salt) == digest
    }

    fn auth_header(&self) -> String {
        let salt = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
        let digest = self.digest(&salt);
        to_basic_auth(&salt, &digest)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        node_url: &str,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}/{}", node_url.trim_end_matches('/'), path.trim_start_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(body)
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .timeout(timeout)
            .send()
            .await
            .map_err(|source| Error::Request {
                url: url.clone(),
                source,
            })?;
        Self::decode_response(url, response).await
    }

    async fn get<T: DeserializeOwned>(&self, node_url: &str, path: &str) -> Result<T> {
        let url = format!("{}/{}", node_url.trim_end_matches('/'), path.trim_start_matches('/'));
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|source| Error::Request {
                url: url.clone(),
                source,
            })?;
        Self::decode_response(url, response).await
    }

    async fn decode_response<T: DeserializeOwned>(
        url: String,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::AuthFailed(url));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                url,
                status: status.as_u16(),
                detail,
            });
        }
        response
            .json()
            .await
            .map_err(|source| Error::Request { url, source })
    }

    /// POST to the head. Worker-side operation.
    pub async fn head_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        if self.is_head() {
            return Err(Error::WrongRole("worker"));
        }
        self.post(&self.head_url, path, &body, timeout).await
    }

    /// GET from the head. Worker-side operation.
    pub async fn head_get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        if self.is_head() {
            return Err(Error::WrongRole("worker"));
        }
        self.get(&self.head_url, path).await
    }

    /// POST to every registered worker concurrently. Head-side operation;
    /// a node that fails yields None rather than failing the broadcast.
    pub async fn broadcast_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Vec<(String, Option<serde_json::Value>)>> {
        if !self.is_head() {
            return Err(Error::WrongRole("head"));
        }
        let node_urls = self.node_urls(false).await?;
        let results = futures::future::join_all(node_urls.into_iter().map(|node_url| {
            let body = body.clone();
            async move {
                match self
                    .post::<serde_json::Value>(&node_url, path, &body, Duration::from_secs(5))
                    .await
                {
                    Ok(value) => (node_url, Some(value)),
                    Err(err) => {
                        tracing::error!(node_url, %err, "broadcast post failed");
                        (node_url, None)
                    }
                }
            }
        }))
        .await;
        Ok(results)
    }

    /// GET from every registered worker concurrently. Head-side operation.
    pub async fn broadcast_get(
        &self,
        path: &str,
    ) -> Result<Vec<(String, Option<serde_json::Value>)>> {
        if !self.is_head() {
            return Err(Error::WrongRole("head"));
        }
        let node_urls = self.node_urls(false).await?;
        let results = futures::future::join_all(node_urls.into_iter().map(|node_url| async move {
            match self.get::<serde_json::Value>(&node_url, path).await {
                Ok(value) => (node_url, Some(value)),
                Err(err) => {
                    tracing::error!(node_url, %err, "broadcast get failed");
                    (node_url, None)
                }
            }
        }))
        .await;
        Ok(results)
    }

    async fn node_urls(&self, include_self: bool) -> Result<Vec<String>> {
        let mut urls: Vec<String> = self
            .store
            .lrange(&self.key("node_urls"), 0, -1)
            .await?
            .into_iter()
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .collect();
        if include_self {
            urls.push(self.node_url.clone());
        }
        Ok(urls)
    }

    async fn wait_until_node_ready(&self, node_url: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        loop {
            match self.get::<serde_json::Value>(node_url, "/version").await {
                Ok(_) => return Ok(()),
                Err(Error::AuthFailed(url)) => return Err(Error::AuthFailed(url)),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(_) => return Err(Error::NodeNotReady(node_url.to_string())),
            }
        }
    }

    /// Start the node's background role: the head runs the heartbeat
    /// watchdog; a worker registers with the head and heartbeats.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.is_head() {
            self.clone().start_check_heartbeat();
        } else {
            self.register().await?;
            self.clone().start_heartbeat();
        }
        Ok(())
    }

    pub async fn register(&self) -> Result<()> {
        tracing::info!(head_url = self.head_url, "waiting for head node");
        self.wait_until_node_ready(&self.head_url).await?;
        let () = self
            .post(
                &self.head_url,
                "/cluster/register",
                &serde_json::json!({"node_url": self.node_url}),
                Duration::from_secs(30),
            )
            .await?;
        Ok(())
    }

    /// Head-side registration of a worker node.
    pub async fn on_register(&self, node_url: &str) -> Result<()> {
        let known = self.node_urls(false).await?;
        if !known.iter().any(|url| url == node_url) {
            self.store
                .rpush(&self.key("node_urls"), &[node_url.as_bytes().to_vec()])
                .await?;
        }
        if node_url != self.head_url {
            self.wait_until_node_ready(node_url).await?;
            self.record_heartbeat(node_url).await?;
            tracing::info!(node_url, "node registered");
        }
        Ok(())
    }

    pub async fn deregister(&self) -> Result<()> {
        let () = self
            .post(
                &self.head_url,
                "/cluster/deregister",
                &serde_json::json!({"node_url": self.node_url}),
                Duration::from_secs(5),
            )
            .await?;
        Ok(())
    }

    pub async fn on_deregister(&self, node_url: &str) -> Result<()> {
        self.store
            .lrem(&self.key("node_urls"), node_url.as_bytes())
            .await?;
        tracing::info!(node_url, "node deregistered");
        Ok(())
    }

    /// Head-side heartbeat handling. A heartbeat from an unknown node
    /// re-runs registration: the node may have been deregistered by the
    /// watchdog during a transient stall.
    pub async fn on_heartbeat(&self, node_url: &str) -> Result<()> {
        if !self.node_urls(false).await?.iter().any(|url| url == node_url) {
            return self.on_register(node_url).await;
        }
        self.record_heartbeat(node_url).await
    }

    async fn record_heartbeat(&self, node_url: &str) -> Result<()> {
        self.store
            .set_ex(
                &self.key(&format!("heartbeat:{node_url}")),
                now_secs().to_string().as_bytes(),
                HEARTBEAT_TTL,
            )
            .await?;
        Ok(())
    }

    pub async fn last_heartbeat(&self, node_url: &str) -> Result<Option<f64>> {
        Ok(self
            .store
            .get_string(&self.key(&format!("heartbeat:{node_url}")))
            .await?
            .and_then(|s| s.parse().ok()))
    }

    pub async fn node_statuses(&self) -> Result<Vec<NodeStatus>> {
        let mut statuses = Vec::new();
        for node_url in self.node_urls(true).await? {
            statuses.push(NodeStatus {
                last_heartbeat: self.last_heartbeat(&node_url).await?,
                is_head: node_url == self.head_url,
                node_url,
            });
        }
        Ok(statuses)
    }

    fn start_heartbeat(self: Arc<Self>) {
        let cluster = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                let result: Result<()> = cluster
                    .post(
                        &cluster.head_url,
                        "/cluster/heartbeat",
                        &serde_json::json!({"node_url": cluster.node_url}),
                        Duration::from_secs(5),
                    )
                    .await;
                if let Err(err) = result {
                    tracing::error!(head_url = cluster.head_url, %err, "failed to send heartbeat");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(cluster.heartbeat_interval) => (),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// The head's watchdog: deregister nodes whose heartbeat is stale or
    /// missing entirely.
    fn start_check_heartbeat(self: Arc<Self>) {
        let cluster = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(cluster.heartbeat_interval) => (),
                }
                if let Err(err) = cluster.check_heartbeats().await {
                    tracing::error!(%err, "error checking heartbeats");
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    async fn check_heartbeats(&self) -> Result<()> {
        let stale_after = self.heartbeat_threshold as f64 * self.heartbeat_interval.as_secs_f64();
        for node_url in self.node_urls(false).await? {
            if node_url == self.node_url {
                continue;
            }
            match self.last_heartbeat(&node_url).await? {
                None => self.on_deregister(&node_url).await?,
                Some(at) if now_secs() - at > stale_after => {
                    tracing::warn!(node_url, "node heartbeat is stale");
                    self.on_deregister(&node_url).await?;
                }
                Some(_) => (),
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::MemoryStore;

    fn cluster(head_url: &str, node_url: &str, store: Arc<dyn Store>) -> Cluster {
        Cluster::new(ClusterConfig::new(head_url, node_url, "s3cret"), store)
    }

    #[tokio::test]
    async fn test_auth_digest_round_trip() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let head = cluster("http://head:8000", "http://head:8000", store.clone());
        let worker = cluster("http://head:8000", "http://worker:8000", store);

        let header = worker.auth_header();
        let (salt, digest) = decode_basic_auth(&header).unwrap();
        assert!(head.is_valid_auth(&salt, &digest));
        assert!(!head.is_valid_auth(&salt, "bogus"));

        // A different secret fails validation.
        let other = Cluster::new(
            ClusterConfig::new("http://head:8000", "http://head:8000", "other"),
            Arc::new(MemoryStore::new()),
        );
        assert!(!other.is_valid_auth(&salt, &digest));
    }

    #[tokio::test]
    async fn test_roles() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let head = cluster("http://head:8000", "http://head:8000", store.clone());
        let worker = cluster("http://head:8000", "http://worker:8000", store);

        assert!(head.is_head());
        assert!(!worker.is_head());

        let err = head
            .head_get::<serde_json::Value>("/cluster/nodes")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WrongRole("worker")));

        let err = worker.broadcast_get("/version").await.unwrap_err();
        assert!(matches!(err, Error::WrongRole("head")));
    }

    #[tokio::test]
    async fn test_watchdog_deregisters_stale_nodes() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let head = Cluster::new(
            ClusterConfig {
                head_url: "http://head:8000".to_string(),
                node_url: "http://head:8000".to_string(),
                secret: "s".to_string(),
                heartbeat_interval: Duration::from_millis(10),
                heartbeat_threshold: 3,
            },
            store.clone(),
        );

        // Two workers on the roster: one fresh, one with no heartbeat.
        store
            .rpush(
                "cluster:node_urls",
                &[b"http://w1:1".to_vec(), b"http://w2:1".to_vec()],
            )
            .await
            .unwrap();
        head.record_heartbeat("http://w1:1").await.unwrap();

        head.check_heartbeats().await.unwrap();
        let statuses = head.node_statuses().await.unwrap();
        let urls: Vec<&str> = statuses.iter().map(|s| s.node_url.as_str()).collect();
        assert!(urls.contains(&"http://w1:1"));
        assert!(!urls.contains(&"http://w2:1"));

        // Staleness: age the fresh worker's heartbeat past the threshold.
        store
            .set(
                "cluster:heartbeat:http://w1:1",
                (now_secs() - 60.0).to_string().as_bytes(),
            )
            .await
            .unwrap();
        head.check_heartbeats().await.unwrap();
        let statuses = head.node_statuses().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].is_head);
    }
}
