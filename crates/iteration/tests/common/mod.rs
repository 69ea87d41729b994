use std::sync::Arc;

use cache::{MemoryStore, Store};
use iteration::{IterationState, IterationStateOps};
use models::{Column, Dataset, Iteration, JoinMethod, Shard, Shardset};
use reader::{DiskCache, LocalStorage, SampleReader};
use registry::Registries;

/// A dataset of `num_shards` CSV shards with `samples_per_shard` rows
/// each, where both `uid` and `id` equal the global sample index, plus
/// everything needed to run iterations over it in memory.
pub struct Fixture {
    pub store: Arc<dyn Store>,
    pub dataset: Dataset,
    pub shardsets: Vec<Shardset>,
    pub reader: Arc<SampleReader>,
    pub registries: Arc<Registries>,
    // Keeps shard and cache files alive for the duration of the test.
    _dirs: Vec<tempfile::TempDir>,
}

pub fn fixture(num_shards: usize, samples_per_shard: usize) -> Fixture {
    let shard_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();

    let mut shards = Vec::new();
    for shard_index in 0..num_shards {
        let path = shard_dir.path().join(format!("shard-{shard_index:05}.csv"));
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

    let shardset = Shardset {
        id: "ss-main".to_string(),
        dataset_id: "ds-1".to_string(),
        location: format!("file://{}", shard_dir.path().display()),
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
    };

    let dataset = Dataset {
        id: "ds-1".to_string(),
        name: "test".to_string(),
        uid_column_name: "uid".to_string(),
    };

    let reader = Arc::new(SampleReader::new(
        Arc::new(LocalStorage),
        DiskCache::new(cache_dir.path(), 1 << 30).unwrap(),
    ));

    Fixture {
        store: Arc::new(MemoryStore::new()),
        dataset,
        shardsets: vec![shardset],
        reader,
        registries: Arc::new(Registries::with_builtins()),
        _dirs: vec![shard_dir, cache_dir],
    }
}

pub fn iteration_config(fixture: &Fixture, id: &str) -> Iteration {
    Iteration {
        id: id.to_string(),
        dataset_id: fixture.dataset.id.clone(),
        total: fixture.shardsets[0].total_samples(),
        shardset_ids: vec!["ss-main".to_string()],
        filters: vec![],
        categorizer: None,
        collater: None,
        preprocessors: vec![],
        shuffle: false,
        shuffle_seed: None,
        shuffle_block_size: None,
        batch_size: 0,
        replication_pg: None,
        join_method: JoinMethod::Left,
    }
}

pub async fn init_state(fixture: &Fixture, iteration: &Iteration) -> Arc<IterationState> {
    let state = Arc::new(IterationState::new(&iteration.id, fixture.store.clone()));
    state
        .init(iteration, &fixture.dataset, &fixture.shardsets)
        .await
        .unwrap();
    assert!(state.exists().await.unwrap());
    state
}
