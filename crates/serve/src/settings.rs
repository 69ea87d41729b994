use std::path::PathBuf;

use clap::Parser;

/// A data-loading node: serves iterations over a dataset catalog and,
/// in cluster mode, coordinates with its peers through the shared store.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Address to bind the HTTP API on.
    #[arg(long, default_value = "0.0.0.0", env = "LAVENDER_DATA_HOST")]
    pub host: String,
    #[arg(long, default_value = "8000", env = "LAVENDER_DATA_PORT")]
    pub port: u16,

    /// Redis URL of the shared store. Unset runs an in-process store,
    /// which is only suitable for a single node.
    #[arg(long, env = "LAVENDER_DATA_REDIS_URL")]
    pub redis_url: Option<String>,

    /// JSON fixture of datasets and shardsets to seed the catalog with.
    #[arg(long, env = "LAVENDER_DATA_CATALOG_FIXTURE")]
    pub catalog_fixture: Option<PathBuf>,

    /// Directory of user modules (filters, collaters, categorizers,
    /// preprocessors) to scan and watch.
    #[arg(long, env = "LAVENDER_DATA_MODULES_DIR")]
    pub modules_dir: Option<PathBuf>,
    /// How often the modules directory is rescanned for changes.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s", env = "LAVENDER_DATA_MODULES_RELOAD_INTERVAL")]
    pub modules_reload_interval: std::time::Duration,

    /// Directory of the shard-file disk cache.
    #[arg(long, env = "LAVENDER_DATA_READER_DISK_CACHE_DIR")]
    pub disk_cache_dir: Option<PathBuf>,
    /// Byte budget of the shard-file disk cache.
    #[arg(long, default_value = "10737418240", env = "LAVENDER_DATA_READER_DISK_CACHE_SIZE")]
    pub disk_cache_size: u64,

    /// TTL of prepared batches in the shared store.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10m", env = "LAVENDER_DATA_BATCH_CACHE_TTL")]
    pub batch_cache_ttl: std::time::Duration,

    /// Worker threads of the background processing pool.
    #[arg(long, default_value = "2", env = "LAVENDER_DATA_POOL_WORKERS")]
    pub pool_workers: usize,

    /// Enable cluster mode. Requires --head-url, --node-url and
    /// --cluster-secret; a node whose node-url equals head-url is the head.
    #[arg(long, env = "LAVENDER_DATA_CLUSTER_ENABLED")]
    pub cluster_enabled: bool,
    #[arg(long, env = "LAVENDER_DATA_CLUSTER_HEAD_URL", required_if_eq("cluster_enabled", "true"))]
    pub head_url: Option<String>,
    /// URL under which this node is reachable by its peers.
    #[arg(long, env = "LAVENDER_DATA_CLUSTER_NODE_URL", required_if_eq("cluster_enabled", "true"))]
    pub node_url: Option<String>,
    /// Shared secret authenticating node-to-node requests.
    #[arg(long, env = "LAVENDER_DATA_CLUSTER_SECRET", required_if_eq("cluster_enabled", "true"))]
    pub cluster_secret: Option<String>,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s", env = "LAVENDER_DATA_CLUSTER_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: std::time::Duration,
    /// Heartbeats a node may miss before the head deregisters it.
    #[arg(long, default_value = "3", env = "LAVENDER_DATA_CLUSTER_HEARTBEAT_THRESHOLD")]
    pub heartbeat_threshold: u32,
}
