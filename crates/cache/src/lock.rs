use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::{Error, Result, Store};

/// Guard for a named distributed lock. The lock is released on drop;
/// hold it only for the duration of the critical section.
pub struct LockGuard {
    store: Arc<dyn Store>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Explicitly release the lock. Preferable to relying on drop, since
    /// drop-time release is best-effort.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_inner(&*self.store, &self.key, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = release_inner(&*store, &key, &token).await {
                    tracing::warn!(%key, %err, "failed to release lock");
                }
            });
        }
    }
}

async fn release_inner(store: &dyn Store, key: &str, token: &str) -> Result<()> {
    // Only release a lock we still own: the entry may have expired and
    // been re-acquired by another holder.
    match store.get(key).await? {
        Some(current) if current == token.as_bytes() => store.delete(key).await,
        _ => Ok(()),
    }
}

/// Acquire the named lock, polling with jittered backoff until `timeout`
/// elapses. The lock auto-expires after `ttl` as protection against a
/// holder that dies without releasing.
pub async fn lock(
    store: Arc<dyn Store>,
    name: &str,
    timeout: Duration,
    ttl: Duration,
) -> Result<LockGuard> {
    let key = format!("lock:{name}");
    let token = format!("{:016x}", rand::thread_rng().gen::<u64>());

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if store.set_nx_ex(&key, token.as_bytes(), ttl).await? {
            return Ok(LockGuard {
                store,
                key,
                token,
                released: false,
            });
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::LockTimeout(name.to_string()));
        }
        let jitter = rand::thread_rng().gen_range(0..10);
        tokio::time::sleep(Duration::from_millis(10 + jitter)).await;
    }
}
