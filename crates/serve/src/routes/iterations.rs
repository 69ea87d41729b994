use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use batch::Value;
use iteration::{
    iteration_id_for_fingerprint, process_next_samples, set_iteration_id_for_fingerprint,
    GetNextError, IterationState, IterationStateOps, Prefetcher, PrefetcherConfig,
    ProcessingError,
};
use models::{iteration_fingerprint, Iteration, JoinMethod, Progress, RegistryRef};
use rand::Rng;
use serde::Deserialize;

use crate::{ApiError, App};

const CREATE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

// Lowercase on the wire; header names are case-insensitive to clients.
pub const ERROR_HEADER: &str = "x-lavender-data-error";
pub const CURRENT_HEADER: &str = "x-lavender-data-sample-current";

#[derive(Debug, Deserialize)]
pub struct CreateIterationParams {
    pub dataset_id: String,
    #[serde(default)]
    pub shardsets: Option<Vec<String>>,
    #[serde(default)]
    pub filters: Option<Vec<RegistryRef>>,
    #[serde(default)]
    pub categorizer: Option<RegistryRef>,
    #[serde(default)]
    pub collater: Option<RegistryRef>,
    #[serde(default)]
    pub preprocessors: Option<Vec<RegistryRef>>,
    #[serde(default)]
    pub shuffle: Option<bool>,
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
    #[serde(default)]
    pub shuffle_block_size: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub replication_pg: Option<Vec<Vec<u32>>>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub world_size: Option<u32>,
    #[serde(default)]
    pub wait_participant_threshold: Option<f64>,
    #[serde(default)]
    pub join_method: Option<JoinMethod>,
    #[serde(default)]
    pub no_cache: Option<bool>,
    #[serde(default)]
    pub max_retry_count: Option<usize>,
    #[serde(default)]
    pub num_workers: Option<usize>,
    #[serde(default)]
    pub prefetch_factor: Option<usize>,
    #[serde(default)]
    pub in_order: Option<bool>,
    #[serde(default)]
    pub cluster_sync: Option<bool>,
}

fn validate_registry_names(app: &App, params: &CreateIterationParams) -> Result<(), ApiError> {
    if let Some(filters) = &params.filters {
        for filter in filters {
            if !app.registries.filters.contains(&filter.name) {
                return Err(ApiError::bad_request(format!(
                    "filter must be one of the following: [{}]",
                    app.registries.filters.names().join(", ")
                )));
            }
        }
    }
    if let Some(categorizer) = &params.categorizer {
        if !app.registries.categorizers.contains(&categorizer.name) {
            return Err(ApiError::bad_request(format!(
                "categorizer must be one of the following: [{}]",
                app.registries.categorizers.names().join(", ")
            )));
        }
    }
    if let Some(collater) = &params.collater {
        if !app.registries.collaters.contains(&collater.name) {
            return Err(ApiError::bad_request(format!(
                "collater must be one of the following: [{}]",
                app.registries.collaters.names().join(", ")
            )));
        }
    }
    if let Some(preprocessors) = &params.preprocessors {
        for preprocessor in preprocessors {
            if !app.registries.preprocessors.contains(&preprocessor.name) {
                return Err(ApiError::bad_request(format!(
                    "preprocessor must be one of the following: [{}]",
                    app.registries.preprocessors.names().join(", ")
                )));
            }
        }
    }
    Ok(())
}

pub async fn create_iteration(
    State(app): State<Arc<App>>,
    Json(mut params): Json<CreateIterationParams>,
) -> Result<Json<Iteration>, ApiError> {
    let shuffle = params.shuffle.unwrap_or(false);
    if shuffle {
        if params.shuffle_seed.is_none() {
            params.shuffle_seed = Some(rand::thread_rng().gen_range(0..1_000_000));
        }
        match params.shuffle_block_size {
            None => {
                return Err(ApiError::bad_request(
                    "shuffle_block_size is required if shuffle is true",
                ))
            }
            Some(0) => {
                return Err(ApiError::bad_request(
                    "shuffle_block_size must be a positive integer",
                ))
            }
            Some(_) => (),
        }
    } else {
        params.shuffle_seed = None;
        params.shuffle_block_size = None;
    }

    let batch_size = params.batch_size.unwrap_or(0);
    if batch_size < 0 {
        return Err(ApiError::bad_request("batch_size must be >= 0"));
    }

    validate_registry_names(&app, &params)?;

    let dataset = app
        .catalog
        .dataset(&params.dataset_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Dataset not found"))?;

    let shardsets = app
        .catalog
        .shardsets(&params.dataset_id, params.shardsets.as_deref())
        .await?;
    if shardsets.is_empty() {
        return Err(match &params.shardsets {
            Some(ids) if !ids.is_empty() => ApiError::bad_request(format!(
                "No shardsets found for the provided shardset ids: {}",
                ids.join(", ")
            )),
            _ => ApiError::bad_request(
                "No shardsets found for the dataset. Please create a shardset first.",
            ),
        });
    }

    let total = models::main_shardset(&shardsets)
        .map_err(|err| ApiError::bad_request(err.to_string()))?
        .total_samples();

    let cluster_sync = params
        .cluster_sync
        .unwrap_or(app.config.cluster_sync_default)
        && app.cluster.is_some();

    let mut iteration = Iteration {
        id: format!("it-{}", uuid::Uuid::new_v4().simple()),
        dataset_id: dataset.id.clone(),
        total,
        shardset_ids: shardsets.iter().map(|s| s.id.clone()).collect(),
        filters: params.filters.clone().unwrap_or_default(),
        categorizer: params.categorizer.clone(),
        collater: params.collater.clone(),
        preprocessors: params.preprocessors.clone().unwrap_or_default(),
        shuffle,
        shuffle_seed: params.shuffle_seed,
        shuffle_block_size: params.shuffle_block_size,
        batch_size: batch_size as usize,
        replication_pg: params.replication_pg.clone(),
        join_method: params.join_method.unwrap_or_default(),
    };
    let fingerprint = iteration_fingerprint(&iteration);
    let rank = params.rank.unwrap_or(0);

    // Concurrent creates of the same configuration are serialized on
    // the fingerprint lock; the first one in initializes state, the rest
    // join it.
    let guard = cache::lock(
        app.store.clone(),
        &format!("iteration_create:{fingerprint}"),
        CREATE_LOCK_TIMEOUT,
        CREATE_LOCK_TIMEOUT,
    )
    .await
    .map_err(anyhow::Error::from)?;

    let mut existing_id = iteration_id_for_fingerprint(&app.store, &fingerprint).await?;
    if app.is_worker() && cluster_sync {
        // The head canonically resolves fingerprint → id for the cluster.
        let cluster = app.cluster.clone().expect("worker implies cluster");
        existing_id = cluster
            .head_get(&format!(
                "/iterations/iteration-id-from-hash?iteration_hash={fingerprint}"
            ))
            .await
            .unwrap_or(existing_id);
    }

    let mut reused = false;
    if let Some(existing_id) = existing_id {
        if let Some(existing) = app.load_iteration(&existing_id).await? {
            let state = IterationState::new(&existing_id, app.store.clone());
            if state.exists().await? {
                let ranks = state.get_ranks().await?;
                // Two restart signals force a fresh iteration: this rank
                // already joined (the training script restarted), or the
                // full world already joined.
                let rank_rejoined = ranks.contains(&rank);
                let world_complete = params
                    .world_size
                    .map(|world_size| ranks == (0..world_size).collect::<Vec<u32>>())
                    .unwrap_or(false);
                if !rank_rejoined && !world_complete {
                    iteration = existing;
                    reused = true;
                }
            }
        }
    }

    let state = IterationState::new(&iteration.id, app.store.clone());
    if !reused {
        app.save_iteration(&iteration).await?;
        state.init(&iteration, &dataset, &shardsets).await?;
    }
    if cluster_sync {
        app.set_cluster_sync(&iteration.id).await?;
    }
    state.register_rank(rank).await?;

    let ttl = params
        .wait_participant_threshold
        .map(Duration::from_secs_f64)
        .unwrap_or(app.config.wait_participant_threshold);
    set_iteration_id_for_fingerprint(&app.store, &fingerprint, &iteration.id, ttl).await?;

    guard.release().await.map_err(anyhow::Error::from)?;

    // Prefetching runs against the proxy state on cluster-synced
    // workers and against local state everywhere else.
    let state_ops = app.state_ops(&iteration.id).await?;
    let prefetcher_config = PrefetcherConfig {
        max_retry_count: params.max_retry_count.unwrap_or(0),
        no_cache: params.no_cache.unwrap_or(false),
        num_workers: params.num_workers.unwrap_or(1).max(1),
        prefetch_factor: params.prefetch_factor.unwrap_or(1).max(1),
        in_order: params.in_order.unwrap_or(true),
        batch_cache_ttl: app.config.batch_cache_ttl,
    };
    let prefetcher = app.prefetchers.get_or_create(&iteration.id, || {
        Prefetcher::new(
            &iteration.id,
            state_ops.clone(),
            app.store.clone(),
            app.reader.clone(),
            app.registries.clone(),
            app.pool.clone(),
            app.cluster.clone(),
            prefetcher_config,
        )
    });
    prefetcher.start(rank);

    Ok(Json(iteration))
}

#[derive(Deserialize)]
pub struct IterationHashQuery {
    pub iteration_hash: String,
}

pub async fn iteration_id_from_hash(
    State(app): State<Arc<App>>,
    Query(query): Query<IterationHashQuery>,
) -> Result<Json<Option<String>>, ApiError> {
    let Some(cluster) = &app.cluster else {
        return Err(ApiError::bad_request("Cluster not found"));
    };
    if !cluster.is_head() {
        return Err(ApiError::bad_request(
            "Worker node cannot get iteration id from hash",
        ));
    }
    Ok(Json(
        iteration_id_for_fingerprint(&app.store, &query.iteration_hash).await?,
    ))
}

pub async fn get_iteration(
    State(app): State<Arc<App>>,
    Path(iteration_id): Path<String>,
) -> Result<Json<Iteration>, ApiError> {
    app.load_iteration(&iteration_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Iteration not found"))
}

#[derive(Deserialize)]
pub struct NextQuery {
    #[serde(default)]
    pub rank: u32,
}

fn processing_error_response(err: &ProcessingError) -> Response {
    let mut response = (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{}\n{}", err.message, err.stack),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(ERROR_HEADER, "SAMPLE_PROCESSING_ERROR".parse().unwrap());
    if let Ok(value) = err.current.to_string().parse() {
        headers.insert(CURRENT_HEADER, value);
    }
    response
}

pub async fn get_next(
    State(app): State<Arc<App>>,
    Path(iteration_id): Path<String>,
    Query(query): Query<NextQuery>,
) -> Response {
    let Some(prefetcher) = app.prefetchers.get(&iteration_id) else {
        return ApiError::not_found("Iteration prefetcher not found").into_response();
    };

    match prefetcher.get_next(query.rank, None).await {
        Ok((current, content)) => {
            let mut response = (
                StatusCode::OK,
                [(
                    axum::http::header::CONTENT_TYPE,
                    "application/octet-stream",
                )],
                content,
            )
                .into_response();
            if let Ok(value) = current.to_string().parse() {
                response.headers_mut().insert(CURRENT_HEADER, value);
            }
            response
        }
        Err(GetNextError::NotFetchedYet) => {
            (StatusCode::ACCEPTED, "Not prefetched yet").into_response()
        }
        Err(GetNextError::Done) => {
            ApiError::bad_request("no more batches to fetch").into_response()
        }
        Err(GetNextError::UnknownRank(rank)) => {
            ApiError::bad_request(format!("rank {rank} is not participating")).into_response()
        }
        Err(GetNextError::Processing(err)) => processing_error_response(&err),
        Err(GetNextError::Other(detail)) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, detail).into_response()
        }
    }
}

/// Render a batch as client-readable JSON: scalars stay scalars, arrays
/// and byte blobs collapse to summaries.
fn previewable(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(v) => serde_json::json!(v),
        Value::Int(v) => serde_json::json!(v),
        Value::Float(v) if v.is_finite() => serde_json::json!(v),
        Value::Float(_) => serde_json::Value::Null,
        Value::String(v) => serde_json::json!(v),
        Value::Bytes(v) => serde_json::json!(format!("<{} bytes>", v.len())),
        Value::List(items) => serde_json::Value::Array(items.iter().map(previewable).collect()),
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), previewable(value)))
                .collect(),
        ),
        Value::Array(array) => serde_json::json!({
            "dtype": array.dtype,
            "shape": array.shape,
        }),
    }
}

pub async fn get_next_preview(
    State(app): State<Arc<App>>,
    Path(iteration_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let state = app.state_for(&iteration_id).await?;
    let (_, params) = state.get_next_samples(0).await?;

    match process_next_samples(&app.reader, &app.registries, &params, 0).await {
        Ok((sample, filtered)) => {
            for index in filtered {
                state.filtered(index).await?;
            }
            let preview: serde_json::Map<String, serde_json::Value> = sample
                .iter()
                .map(|(key, value)| (key.clone(), previewable(value)))
                .collect();
            Ok(Json(serde_json::Value::Object(preview)))
        }
        Err(err) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n{}", err.message, err.stack),
        )),
    }
}

pub async fn complete_index(
    State(app): State<Arc<App>>,
    Path((iteration_id, index)): Path<(String, usize)>,
) -> Result<Json<()>, ApiError> {
    let state = app.state_for(&iteration_id).await?;
    state.complete(index).await?;
    Ok(Json(()))
}

pub async fn get_progress(
    State(app): State<Arc<App>>,
    Path(iteration_id): Path<String>,
) -> Result<Json<Progress>, ApiError> {
    let state = app.state_for(&iteration_id).await?;
    Ok(Json(state.get_progress().await?))
}

pub async fn pushback(
    State(app): State<Arc<App>>,
    Path(iteration_id): Path<String>,
) -> Result<Json<()>, ApiError> {
    let state = app.state_for(&iteration_id).await?;
    state.pushback_inprogress().await?;
    Ok(Json(()))
}

pub async fn prefetcher_current(
    State(app): State<Arc<App>>,
    Path(iteration_id): Path<String>,
) -> Result<Json<HashMap<u32, usize>>, ApiError> {
    let Some(prefetcher) = app.prefetchers.get(&iteration_id) else {
        return Err(ApiError::not_found("Iteration prefetcher not found"));
    };
    Ok(Json(prefetcher.currents()))
}

/// Cluster-internal dispatch of forwarded state operations. Only the
/// head executes these; workers reach it through their state proxy.
pub async fn state_operation(
    State(app): State<Arc<App>>,
    Path((iteration_id, operation)): Path<(String, String)>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(cluster) = &app.cluster else {
        return Err(ApiError::bad_request("Cluster not found"));
    };
    if !cluster.is_head() {
        return Err(ApiError::bad_request(
            "Worker node cannot perform state operations",
        ));
    }

    let state = IterationState::new(&iteration_id, app.store.clone());
    if operation == "exists" {
        return Ok(Json(serde_json::json!(state.exists().await?)));
    }
    if !state.exists().await? {
        return Err(ApiError::not_found("Iteration not initialized"));
    }

    let index = || -> Result<usize, ApiError> {
        params
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .ok_or_else(|| ApiError::bad_request("missing 'index' parameter"))
    };
    let rank = || -> Result<u32, ApiError> {
        params
            .get("rank")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .ok_or_else(|| ApiError::bad_request("missing 'rank' parameter"))
    };

    let result = match operation.as_str() {
        "pushback_inprogress" => {
            state.pushback_inprogress().await?;
            serde_json::Value::Null
        }
        "complete" => {
            state.complete(index()?).await?;
            serde_json::Value::Null
        }
        "filtered" => {
            state.filtered(index()?).await?;
            serde_json::Value::Null
        }
        "failed" => {
            state.failed(index()?).await?;
            serde_json::Value::Null
        }
        "next_item" => serde_json::to_value(state.next_item(rank()?).await?)
            .map_err(anyhow::Error::from)?,
        "get_ranks" => serde_json::to_value(state.get_ranks().await?)
            .map_err(anyhow::Error::from)?,
        "get_progress" => serde_json::to_value(state.get_progress().await?)
            .map_err(anyhow::Error::from)?,
        "get_next_samples" => serde_json::to_value(state.get_next_samples(rank()?).await?)
            .map_err(anyhow::Error::from)?,
        _ => return Err(ApiError::bad_request("Invalid operation")),
    };
    Ok(Json(result))
}
