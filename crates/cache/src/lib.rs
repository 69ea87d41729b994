use std::sync::Arc;
use std::time::Duration;

mod memory;
pub use memory::MemoryStore;

mod redis_store;
pub use redis_store::RedisStore;

mod lock;
pub use lock::{lock, LockGuard};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("value at '{key}' is not an integer")]
    NotAnInteger { key: String },
    #[error("timed out acquiring lock '{0}'")]
    LockTimeout(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Store is the shared key/value client through which all cross-process
/// iteration state flows: plain values with TTL, lists with atomic pops,
/// hashes, monotonic counters, and named locks.
///
/// Implementations must make every method atomic with respect to
/// concurrent callers. Multi-step sequences (such as a queue refill)
/// are serialized by the caller through `lock()`.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Set `key` with an expiration.
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    /// Set `key` only if it does not exist, with an expiration.
    /// Returns false if the key was already present.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    /// List keys matching a glob pattern (`*` wildcards only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Atomically add `delta` to the integer at `key`, initializing a
    /// missing key to zero. Returns the value after the increment.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<()>;
    async fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<()>;
    /// Atomically pop up to `count` values from the head of the list.
    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>>;
    /// Inclusive range in redis semantics: `lrange(key, 0, -1)` is the
    /// entire list.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;
    async fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>>;
    async fn llen(&self, key: &str) -> Result<usize>;
    /// Remove all occurrences of `value` from the list. Returns the
    /// number removed.
    async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    /// Returns true if the field existed and was removed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Typed conveniences over the raw byte-oriented Store.
#[async_trait::async_trait]
pub trait StoreExt: Store {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get(key)
            .await?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.get_string(key).await? {
            None => Ok(None),
            Some(s) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::NotAnInteger {
                    key: key.to_string(),
                }),
        }
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.set(key, value.as_bytes()).await
    }

    async fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, value.to_string().as_bytes()).await
    }
}

impl<T: Store + ?Sized> StoreExt for T {}

/// Match `value` against a redis-style glob containing `*` wildcards.
pub(crate) fn glob_match(pattern: &str, value: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == value;
    }

    let mut rest = value;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
    }
    // Pattern ends with '*': any remainder matches.
    segments.last().map(|s| s.is_empty()).unwrap_or(false) || rest.is_empty()
}

/// Resolve a store from an optional redis URL: a configured URL yields a
/// RedisStore, while None falls back to the in-process MemoryStore which
/// is suitable for single-node deployments and tests.
pub async fn connect(redis_url: Option<&str>) -> Result<Arc<dyn Store>> {
    match redis_url {
        Some(url) => Ok(Arc::new(RedisStore::connect(url).await?)),
        None => {
            tracing::warn!("redis URL is not configured, using in-process memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("it-1:indices:*", "it-1:indices:0"));
        assert!(glob_match("it-1:indices:*", "it-1:indices:12"));
        assert!(!glob_match("it-1:indices:*", "it-2:indices:0"));
        assert!(glob_match("*:heartbeat:*", "cluster:heartbeat:http://a"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }
}
