use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use batch::Value;
use cache::MemoryStore;
use registry::{Params, Preprocessor};
use serve::MemoryCatalog;

mod common;
use common::{
    batch_ids, build_app, create_iteration, drain_rank, fetch_next, get_progress, seed_catalog,
    spawn_node, DrainOptions, Next,
};

async fn single_node(num_shards: usize, samples_per_shard: usize) -> (Arc<serve::App>, String, Vec<tempfile::TempDir>) {
    let shard_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();

    let catalog = Arc::new(MemoryCatalog::new());
    seed_catalog(&catalog, shard_dir.path(), num_shards, samples_per_shard);

    let app = build_app(
        Arc::new(MemoryStore::new()),
        catalog,
        None,
        cache_dir.path(),
    );
    let base = spawn_node(app.clone()).await;
    (app, base, vec![shard_dir, cache_dir])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_rank_no_shuffle_yields_everything_in_order() {
    let (_app, base, _dirs) = single_node(10, 10).await;
    let client = reqwest::Client::new();

    let iteration = create_iteration(
        &client,
        &base,
        serde_json::json!({"dataset_id": "ds-1", "batch_size": 0}),
    )
    .await;
    assert_eq!(iteration.total, 100);

    let delivered = drain_rank(
        &client,
        &base,
        &iteration.id,
        0,
        &DrainOptions {
            complete: true,
            ..Default::default()
        },
    )
    .await;

    assert_eq!(delivered.len(), 100);
    for (at, (seq, batch)) in delivered.iter().enumerate() {
        assert_eq!(*seq, at);
        assert_eq!(batch.get("id"), Some(&Value::Int(at as i64)));
        assert_eq!(batch.get(batch::CURRENT_KEY), Some(&Value::Int(at as i64)));
    }

    let progress = get_progress(&client, &base, &iteration.id).await;
    assert_eq!(progress.total, 100);
    assert_eq!(progress.completed, 100);
    assert_eq!(progress.filtered, 0);
    assert_eq!(progress.failed, 0);
    assert!(progress.inprogress.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shuffle_block_coverage() {
    let (_app, base, _dirs) = single_node(100, 100).await;
    let client = reqwest::Client::new();

    let config = serde_json::json!({
        "dataset_id": "ds-1",
        "batch_size": 100,
        "shuffle": true,
        "shuffle_seed": 42,
        "shuffle_block_size": 10,
        "num_workers": 2,
        "prefetch_factor": 2,
    });
    let iteration = create_iteration(&client, &base, config.clone()).await;
    assert_eq!(iteration.total, 10_000);

    let delivered = drain_rank(&client, &base, &iteration.id, 0, &DrainOptions::default()).await;
    let dispatched: Vec<i64> = delivered
        .iter()
        .flat_map(|(_, batch)| batch_ids(batch))
        .collect();

    // Exact coverage: every index exactly once.
    assert_eq!(dispatched.len(), 10_000);
    assert_eq!(
        dispatched.iter().copied().collect::<HashSet<i64>>(),
        (0..10_000).collect::<HashSet<i64>>()
    );
    // And not the identity order.
    assert_ne!(dispatched, (0..10_000).collect::<Vec<i64>>());

    // Every consecutive window mixes indices from across the whole
    // range: window means concentrate around the global midpoint. A
    // sequential pass would put the first window's mean at 499.5 and
    // the last at 9499.5, both far outside this band.
    let mid = 4999.5f64;
    for window in dispatched.chunks(1000) {
        let mean = window.iter().sum::<i64>() as f64 / window.len() as f64;
        assert!(
            (mean - mid).abs() < mid * 0.7,
            "window mean {mean} strays too far from {mid}"
        );
    }

    // The same configuration on a fresh deployment dispatches the
    // identical order.
    let (_app2, base2, _dirs2) = single_node(100, 100).await;
    let iteration2 = create_iteration(&client, &base2, config).await;
    let delivered2 =
        drain_rank(&client, &base2, &iteration2.id, 0, &DrainOptions::default()).await;
    let dispatched2: Vec<i64> = delivered2
        .iter()
        .flat_map(|(_, batch)| batch_ids(batch))
        .collect();
    assert_eq!(dispatched, dispatched2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replication_group_equivalence() {
    let (_app, base, _dirs) = single_node(10, 10).await;
    let client = reqwest::Client::new();

    let mut iteration_id = None;
    for rank in 0..4u32 {
        let iteration = create_iteration(
            &client,
            &base,
            serde_json::json!({
                "dataset_id": "ds-1",
                "batch_size": 0,
                "replication_pg": [[0, 1], [2, 3]],
                "rank": rank,
                "world_size": 4,
            }),
        )
        .await;
        // Identical fingerprints resolve to one iteration for all ranks.
        match &iteration_id {
            None => iteration_id = Some(iteration.id.clone()),
            Some(id) => assert_eq!(id, &iteration.id),
        }
    }
    let iteration_id = iteration_id.unwrap();

    let mut per_rank: Vec<Vec<i64>> = vec![Vec::new(); 4];
    let mut live: Vec<bool> = vec![true; 4];
    for _ in 0..40_000 {
        if live.iter().all(|l| !l) {
            break;
        }
        for rank in 0..4u32 {
            if !live[rank as usize] {
                continue;
            }
            match fetch_next(&client, &base, &iteration_id, rank).await {
                Next::Batch { batch, .. } => per_rank[rank as usize].extend(batch_ids(&batch)),
                Next::Pending => tokio::time::sleep(std::time::Duration::from_millis(2)).await,
                Next::Done => live[rank as usize] = false,
                Next::Failed { detail, .. } => panic!("unexpected failure: {detail}"),
            }
        }
    }
    assert!(live.iter().all(|l| !l), "some rank never finished");

    // Group members observe pointwise identical sequences.
    assert_eq!(per_rank[0], per_rank[1]);
    assert_eq!(per_rank[2], per_rank[3]);

    // Groups partition the full index range between them.
    let group_a: HashSet<i64> = per_rank[0].iter().copied().collect();
    let group_b: HashSet<i64> = per_rank[2].iter().copied().collect();
    assert!(group_a.is_disjoint(&group_b));
    assert_eq!(group_a.len() + group_b.len(), 100);
    assert_eq!(
        group_a.union(&group_b).copied().collect::<HashSet<i64>>(),
        (0..100).collect::<HashSet<i64>>()
    );
}

/// Fails on batches holding any even id.
struct FailEven;
impl Preprocessor for FailEven {
    fn name(&self) -> &str {
        "fail_even"
    }
    fn process(&self, batch: batch::Batch, _params: &Params) -> anyhow::Result<batch::Batch> {
        let even = match batch.get("id") {
            Some(Value::List(items)) => items.iter().any(|v| v.as_i64().unwrap_or(1) % 2 == 0),
            Some(Value::Int(id)) => id % 2 == 0,
            _ => false,
        };
        if even {
            anyhow::bail!("even ids are not welcome here");
        }
        Ok(batch)
    }
}

/// Fails on every first attempt for a given batch, passes on retry.
struct Flaky {
    attempts: AtomicUsize,
}
impl Preprocessor for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }
    fn process(&self, batch: batch::Batch, _params: &Params) -> anyhow::Result<batch::Batch> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            anyhow::bail!("transient failure");
        }
        Ok(batch)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_processing_error_surfaces_without_retries() {
    let (app, base, _dirs) = single_node(10, 10).await;
    app.registries
        .preprocessors
        .register("fail_even", Arc::new(FailEven));
    let client = reqwest::Client::new();

    let iteration = create_iteration(
        &client,
        &base,
        serde_json::json!({
            "dataset_id": "ds-1",
            "batch_size": 0,
            "preprocessors": [{"name": "fail_even"}],
            "max_retry_count": 0,
        }),
    )
    .await;

    // The first sample has id 0, which fails: the client observes a 500
    // with the processing-error marker headers.
    loop {
        match fetch_next(&client, &base, &iteration.id, 0).await {
            Next::Pending => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            Next::Failed { current, detail } => {
                assert_eq!(current, Some(0));
                assert!(detail.contains("even ids"));
                break;
            }
            other => panic!("expected a processing error, got {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retries_recover_alternating_failures() {
    let (app, base, _dirs) = single_node(10, 10).await;
    app.registries.preprocessors.register(
        "flaky",
        Arc::new(Flaky {
            attempts: AtomicUsize::new(0),
        }),
    );
    let client = reqwest::Client::new();

    let iteration = create_iteration(
        &client,
        &base,
        serde_json::json!({
            "dataset_id": "ds-1",
            "batch_size": 0,
            "preprocessors": [{"name": "flaky"}],
            "max_retry_count": 1,
        }),
    )
    .await;

    let delivered = drain_rank(&client, &base, &iteration.id, 0, &DrainOptions::default()).await;
    let mut ids: Vec<i64> = delivered.iter().flat_map(|(_, b)| batch_ids(b)).collect();
    ids.sort();
    assert_eq!(ids, (0..100).collect::<Vec<i64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_skip_on_failure_yields_only_odd_ids() {
    let (app, base, _dirs) = single_node(10, 10).await;
    app.registries
        .preprocessors
        .register("fail_even", Arc::new(FailEven));
    let client = reqwest::Client::new();

    let iteration = create_iteration(
        &client,
        &base,
        serde_json::json!({
            "dataset_id": "ds-1",
            "batch_size": 0,
            "preprocessors": [{"name": "fail_even"}],
        }),
    )
    .await;

    let delivered = drain_rank(
        &client,
        &base,
        &iteration.id,
        0,
        &DrainOptions {
            skip_on_failure: true,
            ..Default::default()
        },
    )
    .await;

    let mut ids: Vec<i64> = delivered.iter().flat_map(|(_, b)| batch_ids(b)).collect();
    assert_eq!(ids.len(), 50);
    assert!(ids.iter().all(|id| id % 2 == 1));
    ids.sort();
    assert_eq!(ids, (0..100).filter(|id| id % 2 == 1).collect::<Vec<i64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idempotent_create_and_validation() {
    let (_app, base, _dirs) = single_node(2, 5).await;
    let client = reqwest::Client::new();

    let config = serde_json::json!({
        "dataset_id": "ds-1",
        "batch_size": 2,
        "rank": 0,
        "world_size": 2,
    });
    let first = create_iteration(&client, &base, config.clone()).await;

    // Same fingerprint, different rank: joins the existing iteration.
    let mut second_config = config.clone();
    second_config["rank"] = serde_json::json!(1);
    let second = create_iteration(&client, &base, second_config).await;
    assert_eq!(first.id, second.id);

    // Same rank again: the restart rule forces a fresh iteration.
    let third = create_iteration(&client, &base, config.clone()).await;
    assert_ne!(first.id, third.id);

    // Unknown registry names are rejected up front.
    let response = client
        .post(format!("{base}/iterations"))
        .json(&serde_json::json!({
            "dataset_id": "ds-1",
            "filters": [{"name": "no_such_filter"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // Unknown datasets 404.
    let response = client
        .post(format!("{base}/iterations"))
        .json(&serde_json::json!({"dataset_id": "ds-404"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    // shuffle without a block size is invalid.
    let response = client
        .post(format!("{base}/iterations"))
        .json(&serde_json::json!({"dataset_id": "ds-1", "shuffle": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pushback_and_iteration_metadata() {
    let (_app, base, _dirs) = single_node(2, 5).await;
    let client = reqwest::Client::new();

    let iteration = create_iteration(
        &client,
        &base,
        serde_json::json!({"dataset_id": "ds-1", "batch_size": 0}),
    )
    .await;

    // Metadata is readable back.
    let fetched: models::Iteration = client
        .get(format!("{base}/iterations/{}", iteration.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched.id, iteration.id);
    assert_eq!(fetched.total, 10);

    // Consume a couple of samples without completing them, then push
    // the in-progress set back.
    let mut seen = 0;
    while seen < 3 {
        match fetch_next(&client, &base, &iteration.id, 0).await {
            Next::Batch { .. } => seen += 1,
            Next::Pending => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            other => panic!("unexpected {other:?}"),
        }
    }

    // Let the prefetcher settle at its quota; the submit loop then sits
    // blocked until the client fetches again.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let progress = get_progress(&client, &base, &iteration.id).await;
    assert!(!progress.inprogress.is_empty());

    let response = client
        .post(format!("{base}/iterations/{}/pushback", iteration.id))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let progress = get_progress(&client, &base, &iteration.id).await;
    assert!(progress.inprogress.is_empty());
}
