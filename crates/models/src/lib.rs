use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod fingerprint;
pub use fingerprint::iteration_fingerprint;

mod span;
pub use span::span;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("uid column '{uid_column}' not found in shardset '{shardset_id}'")]
    MissingUidColumn {
        uid_column: String,
        shardset_id: String,
    },
    #[error("dataset has no shardsets with shards")]
    NoShardsets,
}

/// A column of a shardset's schema. Types are the textual names shared
/// with shard files and clients: "int", "float", "string", "bool",
/// "bytes", "list", "map".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
}

/// A shard: one immutable file holding a contiguous run of samples for
/// the columns of its shardset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    pub shardset_id: String,
    /// Position within the shardset; dense 0..N-1.
    pub index: usize,
    pub location: String,
    pub format: String,
    pub filesize: u64,
    pub samples: usize,
}

/// An ordered collection of shards sharing one column schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shardset {
    pub id: String,
    pub dataset_id: String,
    pub location: String,
    pub columns: Vec<Column>,
    pub shards: Vec<Shard>,
}

impl Shardset {
    pub fn total_samples(&self) -> usize {
        self.shards.iter().map(|s| s.samples).sum()
    }

    pub fn column_types(&self) -> BTreeMap<String, String> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.type_.clone()))
            .collect()
    }
}

/// A named collection of shardsets joined by one uid column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub uid_column_name: String,
}

/// A named registry item reference with its per-iteration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRef {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RegistryRef {
    pub fn new(name: &str) -> Self {
        RegistryRef {
            name: name.to_string(),
            params: serde_json::Value::Null,
        }
    }
}

/// How feature shardsets are joined onto the main shardset's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMethod {
    #[default]
    Left,
    Inner,
}

/// An iteration: one traversal of a dataset under a fixed configuration.
/// Immutable once created; identified by the fingerprint of its config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub dataset_id: String,
    /// Total samples of the main shardset, which drives iteration length.
    pub total: usize,
    pub shardset_ids: Vec<String>,
    #[serde(default)]
    pub filters: Vec<RegistryRef>,
    #[serde(default)]
    pub categorizer: Option<RegistryRef>,
    #[serde(default)]
    pub collater: Option<RegistryRef>,
    #[serde(default)]
    pub preprocessors: Vec<RegistryRef>,
    pub shuffle: bool,
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
    #[serde(default)]
    pub shuffle_block_size: Option<usize>,
    /// 0 requests single decollated samples rather than stacked batches.
    pub batch_size: usize,
    #[serde(default)]
    pub replication_pg: Option<Vec<Vec<u32>>>,
    #[serde(default)]
    pub join_method: JoinMethod,
}

/// Locate the replication group containing `rank`, if groups are configured.
pub fn replication_group_of(pg: &[Vec<u32>], rank: u32) -> Option<&Vec<u32>> {
    pg.iter().find(|group| group.contains(&rank))
}

/// The shardset whose total drives iteration length: the smallest among
/// those included, so that iteration covers samples present in all.
pub fn main_shardset(shardsets: &[Shardset]) -> Result<&Shardset, Error> {
    shardsets
        .iter()
        .filter(|s| !s.shards.is_empty())
        .min_by_key(|s| s.total_samples())
        .ok_or(Error::NoShardsets)
}

/// A shard as materialized for the read path: everything a reader needs
/// to fetch and decode the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shardset_id: String,
    pub index: usize,
    pub samples: usize,
    pub location: String,
    pub format: String,
    pub filesize: u64,
    pub columns: BTreeMap<String, String>,
}

/// The main shard of a global sample index, plus the in-shard offset of
/// the sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainShardInfo {
    #[serde(flatten)]
    pub shard: ShardInfo,
    pub sample_index: usize,
}

/// A fully resolved coordinate of one sample: its global index, the uid
/// column used to join shardsets, the main shard (with offset) and the
/// feature shards at the same shard index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSampleIndex {
    pub index: usize,
    pub uid_column_name: String,
    pub uid_column_type: String,
    pub main_shard: MainShardInfo,
    pub feature_shards: Vec<ShardInfo>,
}

/// An index that has been dispensed to a rank but not yet reported back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgressIndex {
    pub index: usize,
    pub rank: u32,
    pub started_at: f64,
}

/// Snapshot of iteration progress. `current` is advisory: it is computed
/// as pushed minus queued and may momentarily lag ongoing refills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub current: i64,
    pub inprogress: Vec<InProgressIndex>,
    pub completed: i64,
    pub filtered: i64,
    pub failed: i64,
}

/// Liveness of one cluster node as seen by the head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_url: String,
    pub last_heartbeat: Option<f64>,
    pub is_head: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shardset(id: &str, shard_samples: &[usize]) -> Shardset {
        Shardset {
            id: id.to_string(),
            dataset_id: "ds-1".to_string(),
            location: format!("file:///tmp/{id}"),
            columns: vec![
                Column {
                    name: "uid".to_string(),
                    type_: "int".to_string(),
                },
                Column {
                    name: "text".to_string(),
                    type_: "string".to_string(),
                },
            ],
            shards: shard_samples
                .iter()
                .enumerate()
                .map(|(index, &samples)| Shard {
                    id: format!("{id}-{index}"),
                    shardset_id: id.to_string(),
                    index,
                    location: format!("file:///tmp/{id}/{index}.csv"),
                    format: "csv".to_string(),
                    filesize: 1000,
                    samples,
                })
                .collect(),
        }
    }

    #[test]
    fn test_main_shardset_is_smallest() {
        let sets = vec![
            shardset("ss-1", &[10, 10, 10]),
            shardset("ss-2", &[10, 10]),
            shardset("ss-3", &[100]),
        ];
        assert_eq!(main_shardset(&sets).unwrap().id, "ss-2");

        // Shardsets with no shards are not eligible.
        let sets = vec![shardset("ss-empty", &[]), shardset("ss-1", &[5])];
        assert_eq!(main_shardset(&sets).unwrap().id, "ss-1");

        assert!(matches!(
            main_shardset(&[shardset("ss-empty", &[])]),
            Err(Error::NoShardsets)
        ));
    }

    #[test]
    fn test_replication_group_lookup() {
        let pg = vec![vec![0, 1], vec![2, 3]];
        assert_eq!(replication_group_of(&pg, 1), Some(&vec![0, 1]));
        assert_eq!(replication_group_of(&pg, 3), Some(&vec![2, 3]));
        assert_eq!(replication_group_of(&pg, 4), None);
    }

    #[test]
    fn test_iteration_round_trips_json() {
        let iteration = Iteration {
            id: "it-1".to_string(),
            dataset_id: "ds-1".to_string(),
            total: 100,
            shardset_ids: vec!["ss-1".to_string()],
            filters: vec![RegistryRef::new("mod")],
            categorizer: None,
            collater: Some(RegistryRef::new("default")),
            preprocessors: vec![],
            shuffle: true,
            shuffle_seed: Some(42),
            shuffle_block_size: Some(10),
            batch_size: 8,
            replication_pg: Some(vec![vec![0, 1]]),
            join_method: JoinMethod::Inner,
        };
        let json = serde_json::to_string(&iteration).unwrap();
        let parsed: Iteration = serde_json::from_str(&json).unwrap();
        assert_eq!(iteration, parsed);
    }
}
