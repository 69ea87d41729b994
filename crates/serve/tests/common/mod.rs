#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use batch::Value;
use cache::Store;
use iteration::PrefetcherPool;
use models::{Column, Dataset, Shard, Shardset};
use pool::{SharedBuffers, WorkerPool};
use reader::{DiskCache, LocalStorage, SampleReader};
use registry::Registries;
use serve::{build_router, App, AppConfig, MemoryCatalog};

/// Write `num_shards` CSV shards of `samples_per_shard` rows each into
/// `dir`, with `uid` and `id` both equal to the global sample index, and
/// register them as one dataset with one shardset.
pub fn seed_catalog(catalog: &MemoryCatalog, dir: &Path, num_shards: usize, samples_per_shard: usize) {
    let mut shards = Vec::new();
    for shard_index in 0..num_shards {
        let path = dir.join(format!("shard-{shard_index:05}.csv"));
        let mut content = String::from("uid,id\n");
        for offset in 0..samples_per_shard {
            let global = shard_index * samples_per_shard + offset;
            content.push_str(&format!("{global},{global}\n"));
        }
        std::fs::write(&path, &content).unwrap();
        shards.push(Shard {
            id: format!("sd-{shard_index}"),
            shardset_id: "ss-main".to_string(),
            index: shard_index,
            location: format!("file://{}", path.display()),
            format: "csv".to_string(),
            filesize: content.len() as u64,
            samples: samples_per_shard,
        });
    }

    catalog.add_dataset(Dataset {
        id: "ds-1".to_string(),
        name: "e2e".to_string(),
        uid_column_name: "uid".to_string(),
    });
    catalog.add_shardset(Shardset {
        id: "ss-main".to_string(),
        dataset_id: "ds-1".to_string(),
        location: format!("file://{}", dir.display()),
        columns: vec![
            Column {
                name: "uid".to_string(),
                type_: "int".to_string(),
            },
            Column {
                name: "id".to_string(),
                type_: "int".to_string(),
            },
        ],
        shards,
    });
}

pub fn build_app(
    store: Arc<dyn Store>,
    catalog: Arc<MemoryCatalog>,
    cluster: Option<Arc<cluster::Cluster>>,
    cache_dir: &Path,
) -> Arc<App> {
    Arc::new(App {
        store,
        catalog,
        registries: Arc::new(Registries::with_builtins()),
        reader: Arc::new(SampleReader::new(
            Arc::new(LocalStorage),
            DiskCache::new(cache_dir, 1 << 30).unwrap(),
        )),
        pool: Arc::new(WorkerPool::new(2)),
        cluster: cluster.clone(),
        prefetchers: Arc::new(PrefetcherPool::new()),
        buffers: SharedBuffers::new(),
        config: AppConfig {
            batch_cache_ttl: Duration::from_secs(600),
            cluster_sync_default: cluster.is_some(),
            wait_participant_threshold: Duration::from_secs(10),
        },
    })
}

/// Serve the app on an ephemeral local port, returning its base URL.
pub async fn spawn_node(app: Arc<App>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(app);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub async fn create_iteration(
    client: &reqwest::Client,
    base: &str,
    body: serde_json::Value,
) -> models::Iteration {
    let response = client
        .post(format!("{base}/iterations"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    let text = response.text().await.unwrap();
    assert!(status.is_success(), "create failed ({status}): {text}");
    serde_json::from_str(&text).unwrap()
}

#[derive(Debug)]
pub enum Next {
    Batch { seq: usize, batch: batch::Batch },
    Pending,
    Done,
    Failed { current: Option<usize>, detail: String },
}

pub async fn fetch_next(
    client: &reqwest::Client,
    base: &str,
    iteration_id: &str,
    rank: u32,
) -> Next {
    let response = client
        .get(format!("{base}/iterations/{iteration_id}/next"))
        .query(&[("rank", rank)])
        .send()
        .await
        .unwrap();

    let current = response
        .headers()
        .get("x-lavender-data-sample-current")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let error_kind = response
        .headers()
        .get("x-lavender-data-error")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match response.status().as_u16() {
        200 => Next::Batch {
            seq: current.expect("200 response carries the sequence header"),
            batch: batch::decode(&response.bytes().await.unwrap()).unwrap(),
        },
        202 => Next::Pending,
        400 => {
            let detail = response.text().await.unwrap();
            assert!(
                detail.contains("no more batches"),
                "unexpected 400 from next: {detail}"
            );
            Next::Done
        }
        500 => {
            assert_eq!(error_kind.as_deref(), Some("SAMPLE_PROCESSING_ERROR"));
            Next::Failed {
                current,
                detail: response.text().await.unwrap(),
            }
        }
        status => panic!("unexpected status {status} from next"),
    }
}

pub fn batch_indices(batch: &batch::Batch) -> Vec<usize> {
    match batch.get(batch::INDICES_KEY) {
        Some(Value::List(items)) => items
            .iter()
            .filter_map(Value::as_i64)
            .map(|v| v as usize)
            .collect(),
        Some(Value::Int(index)) => vec![*index as usize],
        _ => Vec::new(),
    }
}

pub fn batch_ids(batch: &batch::Batch) -> Vec<i64> {
    match batch.get("id") {
        Some(Value::List(items)) => items.iter().filter_map(Value::as_i64).collect(),
        Some(Value::Int(id)) => vec![*id],
        _ => Vec::new(),
    }
}

pub struct DrainOptions {
    pub complete: bool,
    pub skip_on_failure: bool,
    pub max_polls: usize,
}

impl Default for DrainOptions {
    fn default() -> Self {
        DrainOptions {
            complete: false,
            skip_on_failure: false,
            max_polls: 20_000,
        }
    }
}

/// Client-side iteration loop: poll next until exhaustion, optionally
/// reporting completions and skipping failed sequences.
pub async fn drain_rank(
    client: &reqwest::Client,
    base: &str,
    iteration_id: &str,
    rank: u32,
    options: &DrainOptions,
) -> Vec<(usize, batch::Batch)> {
    let mut delivered = Vec::new();
    for _ in 0..options.max_polls {
        match fetch_next(client, base, iteration_id, rank).await {
            Next::Batch { seq, batch } => {
                if options.complete {
                    for index in batch_indices(&batch) {
                        let response = client
                            .post(format!("{base}/iterations/{iteration_id}/complete/{index}"))
                            .send()
                            .await
                            .unwrap();
                        assert!(response.status().is_success());
                    }
                }
                delivered.push((seq, batch));
            }
            Next::Pending => tokio::time::sleep(Duration::from_millis(5)).await,
            Next::Done => return delivered,
            Next::Failed { detail, .. } => {
                if !options.skip_on_failure {
                    panic!("sample processing failed: {detail}");
                }
            }
        }
    }
    panic!("iteration never finished");
}

pub async fn get_progress(
    client: &reqwest::Client,
    base: &str,
    iteration_id: &str,
) -> models::Progress {
    client
        .get(format!("{base}/iterations/{iteration_id}/progress"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}
