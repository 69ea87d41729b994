use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::{Result, Storage};

/// Stable file name for a shard location within the cache directory.
fn cache_file_name(location: &str) -> String {
    // FNV-1a over the full location, suffixed with the base name for
    // debuggability of the cache directory.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in location.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let base = location.rsplit('/').next().unwrap_or("shard");
    format!("{hash:016x}-{base}")
}

struct Index {
    // Most-recently used ordering with per-entry byte sizes.
    entries: lru::LruCache<String, u64>,
    total_bytes: u64,
}

/// Byte-bounded LRU cache of downloaded shard files. Concurrent requests
/// for the same location coalesce onto a single download; distinct
/// locations download in parallel.
pub struct DiskCache {
    dir: PathBuf,
    limit_bytes: u64,
    index: Mutex<Index>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, limit_bytes: u64) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(DiskCache {
            dir,
            limit_bytes,
            index: Mutex::new(Index {
                entries: lru::LruCache::unbounded(),
                total_bytes: 0,
            }),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Return the local path of `location`, downloading through `storage`
    /// if it is not cached.
    pub async fn fetch(&self, storage: &dyn Storage, location: &str) -> Result<PathBuf> {
        let name = cache_file_name(location);
        let path = self.dir.join(&name);

        if self.touch(&name) {
            return Ok(path);
        }

        // Writers are singleton per location; waiters block here and
        // then observe the cached file.
        let gate = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight
                .entry(location.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        if self.touch(&name) {
            return Ok(path);
        }

        let partial = self.dir.join(format!("{name}.partial"));
        let size = storage.fetch(location, &partial).await?;
        tokio::fs::rename(&partial, &path).await?;
        tracing::debug!(location, size, "downloaded shard");

        self.insert(&name, size);
        self.evict();

        self.inflight.lock().unwrap().remove(location);
        Ok(path)
    }

    fn touch(&self, name: &str) -> bool {
        self.index.lock().unwrap().entries.get(name).is_some()
    }

    fn insert(&self, name: &str, size: u64) {
        let mut index = self.index.lock().unwrap();
        if index.entries.put(name.to_string(), size).is_none() {
            index.total_bytes += size;
        }
    }

    fn evict(&self) {
        let mut removed = Vec::new();
        {
            let mut index = self.index.lock().unwrap();
            while index.total_bytes > self.limit_bytes && index.entries.len() > 1 {
                if let Some((name, size)) = index.entries.pop_lru() {
                    index.total_bytes -= size;
                    removed.push(name);
                } else {
                    break;
                }
            }
        }
        for name in removed {
            let path = self.dir.join(&name);
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %err, "failed to evict shard file");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_bytes(&self) -> u64 {
        self.index.lock().unwrap().total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalStorage;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStorage {
        inner: LocalStorage,
        fetches: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Storage for CountingStorage {
        async fn fetch(&self, location: &str, dest: &Path) -> Result<u64> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            // Make concurrent duplicate requests overlap if they are not
            // properly coalesced.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.inner.fetch(location, dest).await
        }
    }

    fn write_source(dir: &Path, name: &str, content: &[u8]) -> String {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        format!("file://{}", path.display())
    }

    #[tokio::test]
    async fn test_coalesces_concurrent_fetches() {
        let source_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let location = write_source(source_dir.path(), "a.csv", b"uid\n1\n");

        let cache = Arc::new(DiskCache::new(cache_dir.path(), 1 << 20).unwrap());
        let storage = Arc::new(CountingStorage {
            inner: LocalStorage,
            fetches: AtomicUsize::new(0),
        });

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let storage = storage.clone();
            let location = location.clone();
            tasks.push(tokio::spawn(async move {
                cache.fetch(&*storage, &location).await.unwrap()
            }));
        }
        let paths: Vec<PathBuf> = futures::future::try_join_all(tasks).await.unwrap();

        assert_eq!(storage.fetches.load(Ordering::SeqCst), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert!(paths[0].exists());
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let source_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(cache_dir.path(), 25).unwrap();
        let storage = LocalStorage;

        let a = write_source(source_dir.path(), "a.csv", &[b'a'; 10]);
        let b = write_source(source_dir.path(), "b.csv", &[b'b'; 10]);
        let c = write_source(source_dir.path(), "c.csv", &[b'c'; 10]);

        let path_a = cache.fetch(&storage, &a).await.unwrap();
        cache.fetch(&storage, &b).await.unwrap();
        assert_eq!(cache.cached_bytes(), 20);

        // Third entry exceeds the 25-byte budget: 'a' is the LRU victim.
        cache.fetch(&storage, &c).await.unwrap();
        assert_eq!(cache.cached_bytes(), 20);
        assert!(!path_a.exists());

        // Re-fetching 'a' downloads again.
        let path_a = cache.fetch(&storage, &a).await.unwrap();
        assert!(path_a.exists());
    }
}
