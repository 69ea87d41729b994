use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cache::{Store, StoreExt};
use models::{
    replication_group_of, span, Dataset, GlobalSampleIndex, InProgressIndex, Iteration,
    JoinMethod, MainShardInfo, Progress, RegistryRef, ShardInfo, Shardset,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::de::DeserializeOwned;

use crate::process::ProcessNextSamplesParams;
use crate::{batch_cache_key, Error, Result};

mod cluster_ops;
pub use cluster_ops::ClusterStateOps;

/// How long a queue-refill critical section may run or be waited for.
const REFILL_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations on one iteration's shared state. Implemented locally over
/// the KV store, and by a proxy that forwards to the cluster head; the
/// prefetcher and the HTTP handlers depend only on this interface.
#[async_trait::async_trait]
pub trait IterationStateOps: Send + Sync {
    async fn exists(&self) -> Result<bool>;
    async fn pushback_inprogress(&self) -> Result<()>;
    async fn complete(&self, index: usize) -> Result<()>;
    async fn filtered(&self, index: usize) -> Result<()>;
    async fn failed(&self, index: usize) -> Result<()>;
    async fn next_item(&self, rank: u32) -> Result<GlobalSampleIndex>;
    async fn get_ranks(&self) -> Result<Vec<u32>>;
    async fn get_progress(&self) -> Result<Progress>;
    /// Reserve the next batch of indices for `rank`, returning the batch
    /// cache key and the parameters needed to prepare the batch.
    async fn get_next_samples(&self, rank: u32) -> Result<(String, ProcessNextSamplesParams)>;
}

/// The canonical iteration state, held entirely in the shared store so
/// that any process of the deployment observes the same queues and
/// counters.
pub struct IterationState {
    iteration_id: String,
    store: Arc<dyn Store>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Seed of the per-refill index permutation: a deterministic function of
/// the iteration seed and the refill's shard range endpoints, so a
/// replayed refill produces the identical order.
fn block_seed(seed: u64, endpoints: &[usize]) -> u64 {
    let mut acc = seed;
    for &endpoint in endpoints {
        acc = acc
            .rotate_left(5)
            .wrapping_add((endpoint as u64).wrapping_mul(0x9E3779B97F4A7C15));
    }
    acc
}

impl IterationState {
    pub fn new(iteration_id: &str, store: Arc<dyn Store>) -> Self {
        IterationState {
            iteration_id: iteration_id.to_string(),
            store,
        }
    }

    pub fn iteration_id(&self) -> &str {
        &self.iteration_id
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.iteration_id)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(&self.key(key)).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|err| Error::InvalidConfig(format!("bad '{key}' value: {err}"))),
        }
    }

    async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)
            .map_err(|err| Error::InvalidConfig(format!("cannot encode '{key}': {err}")))?;
        self.store.set(&self.key(key), &raw).await?;
        Ok(())
    }

    /// Initialize all iteration state: immutable config keys, per-shardset
    /// shard metadata, the main-shardset block queue, and zeroed counters.
    /// Runs once per iteration id, under the create lock.
    pub async fn init(
        &self,
        iteration: &Iteration,
        dataset: &Dataset,
        shardsets: &[Shardset],
    ) -> Result<()> {
        let shardsets: Vec<&Shardset> =
            shardsets.iter().filter(|s| !s.shards.is_empty()).collect();
        if shardsets.is_empty() {
            return Err(Error::InvalidConfig(
                "dataset needs at least one shardset with at least one shard".to_string(),
            ));
        }

        let uid_column_type = shardsets
            .iter()
            .flat_map(|s| s.columns.iter())
            .find(|c| c.name == dataset.uid_column_name)
            .map(|c| c.type_.clone())
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "uid column '{}' not found in dataset '{}'",
                    dataset.uid_column_name, dataset.id
                ))
            })?;

        let owned: Vec<Shardset> = shardsets.iter().map(|s| (*s).clone()).collect();
        let main = models::main_shardset(&owned)?;

        self.set_iteration_info(iteration, dataset, &uid_column_type)
            .await?;
        self.set_shardsets_info(&shardsets).await?;
        self.set_main_shardset_info(main, iteration.shuffle, iteration.shuffle_seed.unwrap_or(0))
            .await?;
        Ok(())
    }

    async fn set_iteration_info(
        &self,
        iteration: &Iteration,
        dataset: &Dataset,
        uid_column_type: &str,
    ) -> Result<()> {
        let store = &self.store;
        store
            .set_i64(&self.key("batch_size"), iteration.batch_size as i64)
            .await?;
        store.set_i64(&self.key("total"), iteration.total as i64).await?;
        store
            .set_string(&self.key("uid_column_name"), &dataset.uid_column_name)
            .await?;
        store
            .set_string(&self.key("uid_column_type"), uid_column_type)
            .await?;
        for counter in ["completed", "pushed", "filtered", "failed"] {
            store.set_i64(&self.key(counter), 0).await?;
        }
        if iteration.shuffle {
            store
                .set_i64(
                    &self.key("shuffle_seed"),
                    iteration.shuffle_seed.unwrap_or(0) as i64,
                )
                .await?;
            store
                .set_i64(
                    &self.key("shuffle_block_size"),
                    iteration.shuffle_block_size.unwrap_or(1) as i64,
                )
                .await?;
        }
        if let Some(pg) = &iteration.replication_pg {
            self.set_json("replication_pg", pg).await?;
        }
        self.set_json("join_method", &iteration.join_method).await?;
        self.set_json("filters", &iteration.filters).await?;
        if let Some(categorizer) = &iteration.categorizer {
            self.set_json("categorizer", categorizer).await?;
        }
        if let Some(collater) = &iteration.collater {
            self.set_json("collater", collater).await?;
        }
        self.set_json("preprocessors", &iteration.preprocessors)
            .await?;
        Ok(())
    }

    async fn set_shardsets_info(&self, shardsets: &[&Shardset]) -> Result<()> {
        let ids: Vec<Vec<u8>> = shardsets
            .iter()
            .map(|s| s.id.as_bytes().to_vec())
            .collect();
        self.store.rpush(&self.key("shardsets"), &ids).await?;

        for shardset in shardsets {
            let mut shards = shardset.shards.clone();
            shards.sort_by_key(|s| s.index);

            self.set_json(&format!("shardsets:{}:columns", shardset.id), &shardset.column_types())
                .await?;

            let fields: [(&str, Vec<Vec<u8>>); 4] = [
                (
                    "samples",
                    shards.iter().map(|s| s.samples.to_string().into_bytes()).collect(),
                ),
                (
                    "location",
                    shards.iter().map(|s| s.location.as_bytes().to_vec()).collect(),
                ),
                (
                    "format",
                    shards.iter().map(|s| s.format.as_bytes().to_vec()).collect(),
                ),
                (
                    "filesize",
                    shards.iter().map(|s| s.filesize.to_string().into_bytes()).collect(),
                ),
            ];
            for (field, values) in fields {
                self.store
                    .rpush(&self.key(&format!("shardsets:{}:{field}", shardset.id)), &values)
                    .await?;
            }
        }
        Ok(())
    }

    /// Build the block queue: one [start, end] range per non-empty shard
    /// of the main shardset, with offsets in natural shard order. When
    /// shuffling, the queue order of the ranges is permuted by the seed;
    /// the offset assignment itself never changes, so span() stays
    /// consistent with feature-shard lookup.
    async fn set_main_shardset_info(
        &self,
        main: &Shardset,
        shuffle: bool,
        shuffle_seed: u64,
    ) -> Result<()> {
        self.store
            .set_string(&self.key("main_shardset"), &main.id)
            .await?;

        let mut shards = main.shards.clone();
        shards.sort_by_key(|s| s.index);

        let mut ranges = Vec::new();
        let mut last_end = 0usize;
        for shard in &shards {
            if shard.samples > 0 {
                ranges.push([last_end, last_end + shard.samples - 1]);
            }
            last_end += shard.samples;
        }

        if shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(shuffle_seed);
            ranges.shuffle(&mut rng);
        }

        let flat: Vec<Vec<u8>> = ranges
            .iter()
            .flat_map(|[start, end]| {
                [
                    start.to_string().into_bytes(),
                    end.to_string().into_bytes(),
                ]
            })
            .collect();
        self.store.rpush(&self.key("shard_samples"), &flat).await?;
        Ok(())
    }

    /// Record that `rank` joined this iteration. Consulted by the
    /// create-iteration restart rules.
    pub async fn register_rank(&self, rank: u32) -> Result<()> {
        let ranks = self.get_ranks_inner().await?;
        if !ranks.contains(&rank) {
            self.store
                .rpush(&self.key("ranks"), &[rank.to_string().into_bytes()])
                .await?;
        }
        Ok(())
    }

    async fn get_ranks_inner(&self) -> Result<Vec<u32>> {
        let mut ranks: Vec<u32> = self
            .store
            .lrange(&self.key("ranks"), 0, -1)
            .await?
            .iter()
            .filter_map(|v| String::from_utf8_lossy(v).parse().ok())
            .collect();
        ranks.sort();
        Ok(ranks)
    }

    /// Refill `rank`'s index queue with the next block of shard ranges.
    /// Caller must hold the per-iteration refill lock.
    pub async fn push_indices(&self, rank: u32) -> Result<()> {
        let shuffle_seed = self.store.get_i64(&self.key("shuffle_seed")).await?;
        let block_size = match shuffle_seed {
            Some(_) => self
                .store
                .get_i64(&self.key("shuffle_block_size"))
                .await?
                .unwrap_or(1)
                .max(1) as usize,
            None => 1,
        };

        let mut indices: Vec<usize> = Vec::new();
        let mut endpoints: Vec<usize> = Vec::new();
        for _ in 0..block_size {
            let range = self.store.lpop(&self.key("shard_samples"), 2).await?;
            if range.len() < 2 {
                break;
            }
            let start: usize = String::from_utf8_lossy(&range[0])
                .parse()
                .map_err(|_| Error::InvalidConfig("bad shard_samples entry".to_string()))?;
            let end: usize = String::from_utf8_lossy(&range[1])
                .parse()
                .map_err(|_| Error::InvalidConfig("bad shard_samples entry".to_string()))?;
            endpoints.push(start);
            endpoints.push(end);
            indices.extend(start..=end);
        }

        if indices.is_empty() {
            return Ok(());
        }

        if let Some(seed) = shuffle_seed {
            let mut rng =
                rand::rngs::StdRng::seed_from_u64(block_seed(seed as u64, &endpoints));
            indices.shuffle(&mut rng);
        }

        let encoded: Vec<Vec<u8>> = indices
            .iter()
            .map(|i| i.to_string().into_bytes())
            .collect();

        let replication_pg: Option<Vec<Vec<u32>>> = self.get_json("replication_pg").await?;
        match &replication_pg {
            Some(pg) => {
                let group = replication_group_of(pg, rank)
                    .ok_or(Error::RankNotInReplicationGroup { rank })?;
                // Every member of the group receives the identical
                // ordered block.
                for member in group {
                    self.store
                        .rpush(&self.key(&format!("indices:{member}")), &encoded)
                        .await?;
                }
            }
            None => {
                self.store
                    .rpush(&self.key(&format!("indices:{rank}")), &encoded)
                    .await?;
            }
        }

        self.store
            .incr_by(&self.key("pushed"), indices.len() as i64)
            .await?;
        Ok(())
    }

    /// Pop the next index for `rank`, refilling under the iteration lock
    /// when the queue runs dry, and record it in-progress.
    async fn pop_index(&self, rank: u32) -> Result<usize> {
        let queue = self.key(&format!("indices:{rank}"));

        let mut popped = self.store.lpop(&queue, 1).await?;
        if popped.is_empty() {
            let guard = cache::lock(
                self.store.clone(),
                &format!("iteration:{}", self.iteration_id),
                REFILL_LOCK_TIMEOUT,
                REFILL_LOCK_TIMEOUT,
            )
            .await?;
            self.push_indices(rank).await?;
            guard.release().await?;
            popped = self.store.lpop(&queue, 1).await?;
        }

        let raw = popped.into_iter().next().ok_or(Error::NoMoreIndices)?;
        let index: usize = String::from_utf8_lossy(&raw)
            .parse()
            .map_err(|_| Error::InvalidConfig("bad queue entry".to_string()))?;

        self.store
            .hset(
                &self.key("inprogress"),
                &index.to_string(),
                format!("{rank}:{}", now_secs()).as_bytes(),
            )
            .await?;
        Ok(index)
    }

    async fn shard_info(&self, shardset_id: &str, shard_index: usize) -> Result<Option<ShardInfo>> {
        let field = |name: &str| self.key(&format!("shardsets:{shardset_id}:{name}"));

        let samples = self.store.lindex(&field("samples"), shard_index as i64).await?;
        let location = self.store.lindex(&field("location"), shard_index as i64).await?;
        let format = self.store.lindex(&field("format"), shard_index as i64).await?;
        let filesize = self.store.lindex(&field("filesize"), shard_index as i64).await?;
        let (Some(samples), Some(location), Some(format), Some(filesize)) =
            (samples, location, format, filesize)
        else {
            return Ok(None);
        };

        let columns: Option<std::collections::BTreeMap<String, String>> = self
            .get_json(&format!("shardsets:{shardset_id}:columns"))
            .await?;

        Ok(Some(ShardInfo {
            shardset_id: shardset_id.to_string(),
            index: shard_index,
            samples: String::from_utf8_lossy(&samples).parse().unwrap_or(0),
            location: String::from_utf8_lossy(&location).into_owned(),
            format: String::from_utf8_lossy(&format).into_owned(),
            filesize: String::from_utf8_lossy(&filesize).parse().unwrap_or(0),
            columns: columns.unwrap_or_default(),
        }))
    }

    /// Resolve a global index to its main shard (with in-shard offset)
    /// and the feature shards at the same shard index.
    pub async fn shards_from_index(
        &self,
        index: usize,
    ) -> Result<(MainShardInfo, Vec<ShardInfo>)> {
        let main_shardset_id = self
            .store
            .get_string(&self.key("main_shardset"))
            .await?
            .ok_or(Error::NotInitialized)?;

        let samples: Vec<usize> = self
            .store
            .lrange(&self.key(&format!("shardsets:{main_shardset_id}:samples")), 0, -1)
            .await?
            .iter()
            .filter_map(|v| String::from_utf8_lossy(v).parse().ok())
            .collect();

        let (shard_index, sample_index) = span(index, &samples).ok_or_else(|| {
            Error::InvalidConfig(format!("index {index} is out of range of the main shardset"))
        })?;

        let main = self
            .shard_info(&main_shardset_id, shard_index)
            .await?
            .ok_or(Error::NotInitialized)?;

        let shardset_ids: Vec<String> = self
            .store
            .lrange(&self.key("shardsets"), 0, -1)
            .await?
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect();

        let mut feature_shards = Vec::new();
        for shardset_id in shardset_ids {
            if shardset_id == main_shardset_id {
                continue;
            }
            // A feature shardset with fewer shards simply contributes
            // nothing at this shard index.
            if let Some(info) = self.shard_info(&shardset_id, shard_index).await? {
                feature_shards.push(info);
            }
        }

        Ok((
            MainShardInfo {
                shard: main,
                sample_index,
            },
            feature_shards,
        ))
    }

    pub async fn get_batch_size(&self) -> Result<usize> {
        Ok(self
            .store
            .get_i64(&self.key("batch_size"))
            .await?
            .unwrap_or(0)
            .max(0) as usize)
    }

    async fn get_inprogress(&self) -> Result<Vec<InProgressIndex>> {
        let mut entries = Vec::new();
        for (field, value) in self.store.hgetall(&self.key("inprogress")).await? {
            let value = String::from_utf8_lossy(&value).into_owned();
            let (rank, started_at) = value.split_once(':').unwrap_or(("0", "0"));
            entries.push(InProgressIndex {
                index: field.parse().unwrap_or(0),
                rank: rank.parse().unwrap_or(0),
                started_at: started_at.parse().unwrap_or(0.0),
            });
        }
        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }

    async fn resolve_index(&self, index: usize) -> Result<GlobalSampleIndex> {
        let uid_column_name = self
            .store
            .get_string(&self.key("uid_column_name"))
            .await?
            .ok_or(Error::NotInitialized)?;
        let uid_column_type = self
            .store
            .get_string(&self.key("uid_column_type"))
            .await?
            .ok_or(Error::NotInitialized)?;
        let (main_shard, feature_shards) = self.shards_from_index(index).await?;
        Ok(GlobalSampleIndex {
            index,
            uid_column_name,
            uid_column_type,
            main_shard,
            feature_shards,
        })
    }

    async fn settle(&self, index: usize, counter: &str) -> Result<()> {
        let removed = self
            .store
            .hdel(&self.key("inprogress"), &index.to_string())
            .await?;
        // Double reports are no-ops.
        if !removed {
            return Ok(());
        }
        self.store.incr_by(&self.key(counter), 1).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl IterationStateOps for IterationState {
    async fn exists(&self) -> Result<bool> {
        Ok(self.store.exists(&self.key("total")).await?)
    }

    async fn pushback_inprogress(&self) -> Result<()> {
        for entry in self.get_inprogress().await? {
            self.store
                .lpush(
                    &self.key(&format!("indices:{}", entry.rank)),
                    &[entry.index.to_string().into_bytes()],
                )
                .await?;
        }
        self.store.delete(&self.key("inprogress")).await?;
        Ok(())
    }

    async fn complete(&self, index: usize) -> Result<()> {
        self.settle(index, "completed").await
    }

    async fn filtered(&self, index: usize) -> Result<()> {
        self.settle(index, "filtered").await
    }

    async fn failed(&self, index: usize) -> Result<()> {
        self.settle(index, "failed").await
    }

    async fn next_item(&self, rank: u32) -> Result<GlobalSampleIndex> {
        let index = self.pop_index(rank).await?;
        self.resolve_index(index).await
    }

    async fn get_ranks(&self) -> Result<Vec<u32>> {
        self.get_ranks_inner().await
    }

    async fn get_progress(&self) -> Result<Progress> {
        let pushed = self.store.incr_by(&self.key("pushed"), 0).await?;

        let replication_pg: Option<Vec<Vec<u32>>> = self.get_json("replication_pg").await?;
        let mut inqueue = 0usize;
        match &replication_pg {
            Some(pg) => {
                // Group members hold identical mirrors; count one queue
                // per group.
                for group in pg {
                    if let Some(first) = group.first() {
                        inqueue += self
                            .store
                            .llen(&self.key(&format!("indices:{first}")))
                            .await?;
                    }
                }
            }
            None => {
                for key in self.store.keys(&self.key("indices:*")).await? {
                    inqueue += self.store.llen(&key).await?;
                }
            }
        }

        Ok(Progress {
            total: self.store.get_i64(&self.key("total")).await?.unwrap_or(0) as usize,
            current: pushed - inqueue as i64,
            inprogress: self.get_inprogress().await?,
            completed: self.store.incr_by(&self.key("completed"), 0).await?,
            filtered: self.store.incr_by(&self.key("filtered"), 0).await?,
            failed: self.store.incr_by(&self.key("failed"), 0).await?,
        })
    }

    async fn get_next_samples(&self, rank: u32) -> Result<(String, ProcessNextSamplesParams)> {
        let batch_size = self.get_batch_size().await?;

        let mut global_sample_indices = Vec::new();
        for _ in 0..batch_size.max(1) {
            match self.next_item(rank).await {
                Ok(item) => global_sample_indices.push(item),
                Err(Error::NoMoreIndices) => break,
                Err(err) => return Err(err),
            }
        }
        if global_sample_indices.is_empty() {
            return Err(Error::NoMoreIndices);
        }

        let current =
            (self.store.incr_by(&self.key(&format!("current:{rank}")), 1).await? - 1) as usize;
        let cache_key = batch_cache_key(&self.iteration_id, rank, current);

        let filters: Vec<RegistryRef> = self.get_json("filters").await?.unwrap_or_default();
        let collater: Option<RegistryRef> = self.get_json("collater").await?;
        let preprocessors: Vec<RegistryRef> =
            self.get_json("preprocessors").await?.unwrap_or_default();
        let join_method: JoinMethod = self.get_json("join_method").await?.unwrap_or_default();

        Ok((
            cache_key,
            ProcessNextSamplesParams {
                current,
                global_sample_indices,
                samples: None,
                filters,
                collater,
                preprocessors,
                batch_size,
                join_method,
            },
        ))
    }
}
