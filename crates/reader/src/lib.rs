use std::sync::Arc;

use batch::{Sample, Value};
use models::{GlobalSampleIndex, JoinMethod, ShardInfo};

mod disk_cache;
pub use disk_cache::DiskCache;

mod shard;
pub use shard::{open_shard, CsvShardReader, ShardReader};

mod storage;
pub use storage::{LocalStorage, Storage};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An inner join found no feature record for the sample's uid. The
    /// caller drops the sample and moves on.
    #[error("sample uid '{uid}' missing in feature shardset '{shardset_id}'")]
    InsufficientSample { uid: String, shardset_id: String },
    #[error("shard {location} has no sample at offset {offset}")]
    SampleOutOfRange { location: String, offset: usize },
    #[error("uid column '{0}' missing from main shard record")]
    MissingUidColumn(String),
    #[error("unsupported shard format '{0}'")]
    UnsupportedFormat(String),
    #[error("unsupported storage scheme for location '{0}'")]
    UnsupportedScheme(String),
    #[error("failed to decode shard {location}: {reason}")]
    Decode { location: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reads fully joined samples by global sample index. Shard files are
/// fetched through `Storage` into a byte-bounded disk cache and decoded
/// shards are held in a small in-memory LRU.
pub struct SampleReader {
    storage: Arc<dyn Storage>,
    cache: DiskCache,
    shards: tokio::sync::Mutex<lru::LruCache<String, Arc<dyn ShardReader>>>,
}

/// Decoded shards kept in memory per reader.
const SHARD_LRU_CAPACITY: usize = 64;

impl SampleReader {
    pub fn new(storage: Arc<dyn Storage>, cache: DiskCache) -> Self {
        SampleReader {
            storage,
            cache,
            shards: tokio::sync::Mutex::new(lru::LruCache::new(
                std::num::NonZeroUsize::new(SHARD_LRU_CAPACITY).unwrap(),
            )),
        }
    }

    async fn shard(
        &self,
        info: &ShardInfo,
        uid_column_name: &str,
        uid_column_type: &str,
    ) -> Result<Arc<dyn ShardReader>> {
        if let Some(reader) = self.shards.lock().await.get(&info.location) {
            return Ok(reader.clone());
        }

        let path = self.cache.fetch(&*self.storage, &info.location).await?;
        let reader = open_shard(info, &path, uid_column_name, uid_column_type)?;
        self.shards
            .lock()
            .await
            .put(info.location.clone(), reader.clone());
        Ok(reader)
    }

    /// Read the sample at `index`: the main shard record at the in-shard
    /// offset, joined with each feature shard by uid. `Left` fills
    /// missing feature columns with the column type's null; `Inner`
    /// fails with `InsufficientSample` so the caller can skip.
    pub async fn get_sample(
        &self,
        index: &GlobalSampleIndex,
        join_method: JoinMethod,
    ) -> Result<Sample> {
        let main = self
            .shard(
                &index.main_shard.shard,
                &index.uid_column_name,
                &index.uid_column_type,
            )
            .await?;
        let mut sample = main.sample_at(index.main_shard.sample_index)?;

        let uid = sample
            .get(&index.uid_column_name)
            .cloned()
            .ok_or_else(|| Error::MissingUidColumn(index.uid_column_name.clone()))?;

        for info in &index.feature_shards {
            let feature = self
                .shard(info, &index.uid_column_name, &index.uid_column_type)
                .await?;
            match feature.sample_by_uid(&uid)? {
                Some(record) => {
                    for (column, value) in record {
                        sample.entry(column).or_insert(value);
                    }
                }
                None => match join_method {
                    JoinMethod::Inner => {
                        return Err(Error::InsufficientSample {
                            uid: uid.uid_key(),
                            shardset_id: info.shardset_id.clone(),
                        });
                    }
                    JoinMethod::Left => {
                        for (column, type_) in &info.columns {
                            sample
                                .entry(column.clone())
                                .or_insert_with(|| Value::null_for_type(type_));
                        }
                    }
                },
            }
        }

        Ok(sample)
    }
}
