use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use iteration::PrefetcherPool;
use pool::{SharedBuffers, WorkerPool};
use reader::{DiskCache, LocalStorage, SampleReader};
use registry::{ModuleLoader, ModuleScanner, Registries};
use serve::settings::Cli;
use serve::{build_router, App, AppConfig, MemoryCatalog};
use tokio_util::sync::CancellationToken;

/// Placeholder module host: reports user module files it cannot bind.
/// Deployments embed a real loader (plugin host or scripting runtime)
/// behind the same `ModuleLoader` seam.
struct UnboundLoader;

impl ModuleLoader for UnboundLoader {
    fn load(&self, path: &std::path::Path, _registries: &Registries) -> anyhow::Result<()> {
        anyhow::bail!(
            "no module host is configured to bind '{}'",
            path.display()
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let shutdown = CancellationToken::new();

    // Shared store first: everything else hangs off of it.
    let store = cache::connect(cli.redis_url.as_deref()).await?;

    // Registries, then the module scanner watching for user code.
    let registries = Arc::new(Registries::with_builtins());
    if let Some(modules_dir) = &cli.modules_dir {
        let scanner = Arc::new(ModuleScanner::new(modules_dir, Arc::new(UnboundLoader)));
        scanner.scan(&registries)?;
        let _watch = scanner.clone().watch(
            registries.clone(),
            cli.modules_reload_interval,
            shutdown.clone(),
        );
    }

    // Sample reader with its disk cache.
    let disk_cache_dir = match &cli.disk_cache_dir {
        Some(dir) => dir.clone(),
        None => std::env::temp_dir().join("lavender-data-shards"),
    };
    let reader = Arc::new(SampleReader::new(
        Arc::new(LocalStorage),
        DiskCache::new(&disk_cache_dir, cli.disk_cache_size)
            .context("failed to create shard disk cache")?,
    ));

    // Background worker pool for user-code preprocessing.
    let worker_pool = Arc::new(WorkerPool::new(cli.pool_workers));

    // Cluster role, if enabled. ClusterConfig::new normalizes the URLs;
    // role detection compares them exactly.
    let cluster = if cli.cluster_enabled {
        let mut config = cluster::ClusterConfig::new(
            cli.head_url.as_deref().expect("clap enforces head-url"),
            cli.node_url.as_deref().expect("clap enforces node-url"),
            cli.cluster_secret.as_deref().expect("clap enforces secret"),
        );
        config.heartbeat_interval = cli.heartbeat_interval;
        config.heartbeat_threshold = cli.heartbeat_threshold;
        Some(Arc::new(cluster::Cluster::new(config, store.clone())))
    } else {
        None
    };

    let catalog = Arc::new(MemoryCatalog::new());
    if let Some(fixture) = &cli.catalog_fixture {
        let count = catalog
            .load_fixture(fixture)
            .with_context(|| format!("failed to load catalog fixture {}", fixture.display()))?;
        tracing::info!(count, fixture = %fixture.display(), "seeded catalog");
    }

    let app = Arc::new(App {
        store,
        catalog,
        registries,
        reader,
        pool: worker_pool.clone(),
        cluster: cluster.clone(),
        prefetchers: Arc::new(PrefetcherPool::new()),
        buffers: SharedBuffers::new(),
        config: AppConfig {
            batch_cache_ttl: cli.batch_cache_ttl,
            cluster_sync_default: cli.cluster_enabled,
            ..Default::default()
        },
    });

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?;
    tracing::info!(host = cli.host, port = cli.port, "lavender-data listening");

    let server = {
        let shutdown = shutdown.clone();
        let router = build_router(app.clone());
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        })
    };

    // Register with the head (or start the watchdog) once we can answer
    // the readiness probe.
    if let Some(cluster) = &cluster {
        cluster.clone().start().await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    shutdown.cancel();

    if let Some(cluster) = &cluster {
        if !cluster.is_head() {
            if let Err(err) = cluster.deregister().await {
                tracing::warn!(%err, "failed to deregister from the head");
            }
        }
        cluster.stop();
    }
    app.prefetchers.shutdown().await;
    worker_pool.shutdown();

    server.await??;
    Ok(())
}
