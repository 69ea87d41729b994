use std::sync::Arc;
use std::time::Duration;

use cache::{Store, StoreExt};
use sha2::{Digest, Sha256};

/// Cache key of a prepared batch. Deterministic in (iteration, rank,
/// sequence) so that a restarted submit loop lands on the same entries.
pub fn batch_cache_key(iteration_id: &str, rank: u32, seq: usize) -> String {
    let digest = Sha256::digest(format!("{iteration_id}:{rank}:{seq}").as_bytes());
    format!("batch:{}", hex::encode(digest))
}

fn fingerprint_key(fingerprint: &str) -> String {
    format!("iteration_fingerprint:{fingerprint}")
}

/// Record the fingerprint→id mapping used to deduplicate concurrent
/// create-iteration calls. The TTL is the participant wait threshold:
/// after it lapses, an identical create starts a fresh iteration.
pub async fn set_iteration_id_for_fingerprint(
    store: &Arc<dyn Store>,
    fingerprint: &str,
    iteration_id: &str,
    ttl: Duration,
) -> cache::Result<()> {
    store
        .set_ex(&fingerprint_key(fingerprint), iteration_id.as_bytes(), ttl)
        .await
}

pub async fn iteration_id_for_fingerprint(
    store: &Arc<dyn Store>,
    fingerprint: &str,
) -> cache::Result<Option<String>> {
    store.get_string(&fingerprint_key(fingerprint)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::MemoryStore;

    #[test]
    fn test_batch_cache_key_is_stable_and_distinct() {
        let a = batch_cache_key("it-1", 0, 0);
        assert_eq!(a, batch_cache_key("it-1", 0, 0));
        assert_ne!(a, batch_cache_key("it-1", 0, 1));
        assert_ne!(a, batch_cache_key("it-1", 1, 0));
        assert_ne!(a, batch_cache_key("it-2", 0, 0));
    }

    #[tokio::test]
    async fn test_fingerprint_mapping_expires() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        set_iteration_id_for_fingerprint(&store, "abc", "it-1", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(
            iteration_id_for_fingerprint(&store, "abc").await.unwrap(),
            Some("it-1".to_string())
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(iteration_id_for_fingerprint(&store, "abc").await.unwrap(), None);
    }
}
