use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use cache::Store;
use iteration::{ClusterStateOps, IterationState, IterationStateOps, PrefetcherPool};
use models::Iteration;
use pool::{SharedBuffers, WorkerPool};
use reader::SampleReader;
use registry::Registries;

mod auth;
mod catalog;
pub use catalog::{Catalog, MemoryCatalog};

mod error;
pub use error::{ApiError, ApiErrorExt};

mod routes;
pub mod settings;

/// Iteration metadata outlives the fingerprint mapping but not the
/// deployment: entries expire after a day, like heartbeats.
const ITERATION_META_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables of the serving layer, resolved from CLI/env settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub batch_cache_ttl: Duration,
    /// Default for CreateIterationParams.cluster_sync when unset.
    pub cluster_sync_default: bool,
    /// Default fingerprint-mapping TTL when the create call does not
    /// carry wait_participant_threshold.
    pub wait_participant_threshold: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            batch_cache_ttl: Duration::from_secs(10 * 60),
            cluster_sync_default: false,
            wait_participant_threshold: Duration::from_secs(10),
        }
    }
}

/// All services of one node, threaded through the HTTP handlers.
/// Initialization order is store → registries → reader → worker pool →
/// cluster → prefetcher pool; `main` owns that sequence.
pub struct App {
    pub store: Arc<dyn Store>,
    pub catalog: Arc<dyn Catalog>,
    pub registries: Arc<Registries>,
    pub reader: Arc<SampleReader>,
    pub pool: Arc<WorkerPool>,
    pub cluster: Option<Arc<cluster::Cluster>>,
    pub prefetchers: Arc<PrefetcherPool>,
    pub buffers: SharedBuffers,
    pub config: AppConfig,
}

impl App {
    pub(crate) fn is_worker(&self) -> bool {
        self.cluster.as_ref().map(|c| !c.is_head()).unwrap_or(false)
    }

    /// Resolve the iteration-state implementation for request handling:
    /// local state everywhere, except on a worker node for an iteration
    /// marked cluster-synced, which proxies every op to the head.
    pub async fn state_for(
        &self,
        iteration_id: &str,
    ) -> Result<Arc<dyn IterationStateOps>, ApiError> {
        let state = self.state_ops(iteration_id).await?;
        if !state.exists().await? {
            return Err(ApiError::not_found("Iteration not initialized"));
        }
        Ok(state)
    }

    pub(crate) async fn state_ops(
        &self,
        iteration_id: &str,
    ) -> Result<Arc<dyn IterationStateOps>, ApiError> {
        if self.is_worker() && self.cluster_sync_enabled(iteration_id).await? {
            let cluster = self.cluster.clone().expect("worker implies cluster");
            return Ok(Arc::new(ClusterStateOps::new(iteration_id, cluster)));
        }
        Ok(Arc::new(IterationState::new(iteration_id, self.store.clone())))
    }

    pub(crate) async fn cluster_sync_enabled(&self, iteration_id: &str) -> Result<bool, ApiError> {
        Ok(self
            .store
            .exists(&format!("{iteration_id}:cluster_sync"))
            .await?)
    }

    pub(crate) async fn set_cluster_sync(&self, iteration_id: &str) -> Result<(), ApiError> {
        self.store
            .set_ex(
                &format!("{iteration_id}:cluster_sync"),
                b"1",
                ITERATION_META_TTL,
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn save_iteration(&self, iteration: &Iteration) -> Result<(), ApiError> {
        let raw = serde_json::to_vec(iteration)
            .map_err(|err| anyhow::anyhow!("cannot encode iteration: {err}"))?;
        self.store
            .set_ex(
                &format!("iteration_meta:{}", iteration.id),
                &raw,
                ITERATION_META_TTL,
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn load_iteration(
        &self,
        iteration_id: &str,
    ) -> Result<Option<Iteration>, ApiError> {
        match self
            .store
            .get(&format!("iteration_meta:{iteration_id}"))
            .await?
        {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(|err| {
                anyhow::anyhow!("corrupt iteration metadata: {err}")
            })?)),
        }
    }
}

/// Build the node's full router. Cluster-internal routes (registration,
/// heartbeats, forwarded state ops) sit behind the shared-secret check;
/// client-facing routes authenticate at the deployment's edge.
pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    let internal = axum::Router::new()
        .route("/cluster/register", post(routes::cluster::register))
        .route("/cluster/deregister", post(routes::cluster::deregister))
        .route("/cluster/heartbeat", post(routes::cluster::heartbeat))
        .route(
            "/iterations/:iteration_id/state/:operation",
            post(routes::iterations::state_operation),
        )
        .layer(axum::middleware::from_fn_with_state(
            app.clone(),
            auth::require_cluster_auth,
        ));

    axum::Router::new()
        .route("/version", get(routes::version))
        .route("/cluster/nodes", get(routes::cluster::nodes))
        .route("/iterations", post(routes::iterations::create_iteration))
        .route(
            "/iterations/iteration-id-from-hash",
            get(routes::iterations::iteration_id_from_hash),
        )
        .route(
            "/iterations/:iteration_id",
            get(routes::iterations::get_iteration),
        )
        .route(
            "/iterations/:iteration_id/next",
            get(routes::iterations::get_next),
        )
        .route(
            "/iterations/:iteration_id/next-preview",
            get(routes::iterations::get_next_preview),
        )
        .route(
            "/iterations/:iteration_id/complete/:index",
            post(routes::iterations::complete_index),
        )
        .route(
            "/iterations/:iteration_id/progress",
            get(routes::iterations::get_progress),
        )
        .route(
            "/iterations/:iteration_id/pushback",
            post(routes::iterations::pushback),
        )
        .route(
            "/iterations/:iteration_id/prefetcher-current",
            get(routes::iterations::prefetcher_current),
        )
        .merge(internal)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}
