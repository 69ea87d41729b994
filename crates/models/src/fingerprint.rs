use sha2::{Digest, Sha256};

use crate::Iteration;

/// Deterministic fingerprint of an iteration configuration, used to
/// deduplicate concurrent create requests. Two configurations that
/// differ only in shardset order produce the same fingerprint; the
/// iteration id itself is excluded.
pub fn iteration_fingerprint(iteration: &Iteration) -> String {
    let mut shardset_ids = iteration.shardset_ids.clone();
    shardset_ids.sort();

    // serde_json serializes struct fields in declaration order, which
    // makes this encoding canonical for a fixed schema.
    let normalized = serde_json::json!({
        "dataset_id": iteration.dataset_id,
        "shardset_ids": shardset_ids,
        "filters": iteration.filters,
        "categorizer": iteration.categorizer,
        "collater": iteration.collater,
        "preprocessors": iteration.preprocessors,
        "shuffle": iteration.shuffle,
        "shuffle_seed": iteration.shuffle_seed,
        "shuffle_block_size": iteration.shuffle_block_size,
        "batch_size": iteration.batch_size,
        "replication_pg": iteration.replication_pg,
        "join_method": iteration.join_method,
    });

    let mut hasher = Sha256::new();
    hasher.update(normalized.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
