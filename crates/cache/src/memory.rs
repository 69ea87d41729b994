use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::{glob_match, Error, Result};

enum Value {
    Plain(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(BTreeMap<String, Vec<u8>>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn plain(value: Vec<u8>) -> Self {
        Entry {
            value: Value::Plain(value),
            expires_at: None,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-process Store with redis-equivalent semantics, used for single-node
/// deployments and throughout the test suites. All operations run under a
/// single async mutex, which makes each of them atomic exactly like their
/// redis counterparts.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

fn live<'m>(
    entries: &'m mut HashMap<String, Entry>,
    key: &str,
) -> Option<&'m mut Entry> {
    purge_expired(entries, key);
    entries.get_mut(key)
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    let now = Instant::now();
    if entries.get(key).map(|e| e.expired(now)).unwrap_or(false) {
        entries.remove(key);
    }
}

fn as_list<'m>(
    entries: &'m mut HashMap<String, Entry>,
    key: &str,
) -> &'m mut VecDeque<Vec<u8>> {
    purge_expired(entries, key);
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::List(VecDeque::new()),
        expires_at: None,
    });
    if !matches!(entry.value, Value::List(_)) {
        entry.value = Value::List(VecDeque::new());
    }
    match &mut entry.value {
        Value::List(list) => list,
        _ => unreachable!(),
    }
}

fn as_hash<'m>(
    entries: &'m mut HashMap<String, Entry>,
    key: &str,
) -> &'m mut BTreeMap<String, Vec<u8>> {
    purge_expired(entries, key);
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Hash(BTreeMap::new()),
        expires_at: None,
    });
    if !matches!(entry.value, Value::Hash(_)) {
        entry.value = Value::Hash(BTreeMap::new());
    }
    match &mut entry.value {
        Value::Hash(hash) => hash,
        _ => unreachable!(),
    }
}

#[async_trait::async_trait]
impl crate::Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        Ok(match live(&mut entries, key) {
            Some(Entry {
                value: Value::Plain(v),
                ..
            }) => Some(v.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Entry::plain(value.to_vec()));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Plain(value.to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Plain(value.to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live(&mut entries, key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, e| !e.expired(now));
        Ok(entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let current = match live(&mut entries, key) {
            Some(Entry {
                value: Value::Plain(v),
                ..
            }) => String::from_utf8_lossy(v)
                .trim()
                .parse::<i64>()
                .map_err(|_| Error::NotAnInteger {
                    key: key.to_string(),
                })?,
            _ => 0,
        };
        let next = current + delta;
        entries.insert(key.to_string(), Entry::plain(next.to_string().into_bytes()));
        Ok(next)
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let list = as_list(&mut entries, key);
        for value in values {
            list.push_back(value.clone());
        }
        Ok(())
    }

    async fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let list = as_list(&mut entries, key);
        for value in values {
            list.push_front(value.clone());
        }
        Ok(())
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        let list = as_list(&mut entries, key);
        let n = count.min(list.len());
        Ok(list.drain(..n).collect())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        let list = as_list(&mut entries, key);
        let len = list.len() as i64;
        let resolve = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let (start, stop) = (resolve(start), resolve(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        let list = as_list(&mut entries, key);
        let len = list.len() as i64;
        let at = if index < 0 { len + index } else { index };
        if at < 0 || at >= len {
            return Ok(None);
        }
        Ok(list.get(at as usize).cloned())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        Ok(as_list(&mut entries, key).len())
    }

    async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let list = as_list(&mut entries, key);
        let before = list.len();
        list.retain(|v| v != value);
        Ok(before - list.len())
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        as_hash(&mut entries, key).insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        Ok(as_hash(&mut entries, key).get(field).cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(as_hash(&mut entries, key).remove(field).is_some())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = self.entries.lock().await;
        Ok(as_hash(&mut entries, key)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Store, StoreExt};

    #[tokio::test]
    async fn test_counters_and_strings() {
        let store = MemoryStore::new();

        assert_eq!(store.incr_by("n", 1).await.unwrap(), 1);
        assert_eq!(store.incr_by("n", 2).await.unwrap(), 3);
        assert_eq!(store.incr_by("n", 0).await.unwrap(), 3);
        assert_eq!(store.get_i64("n").await.unwrap(), Some(3));

        store.set_string("s", "hello").await.unwrap();
        assert_eq!(store.get_string("s").await.unwrap().as_deref(), Some("hello"));
        assert!(store.get_i64("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_ops() {
        let store = MemoryStore::new();

        let values: Vec<Vec<u8>> = (0..5).map(|i: i32| i.to_string().into_bytes()).collect();
        store.rpush("l", &values).await.unwrap();
        assert_eq!(store.llen("l").await.unwrap(), 5);

        let popped = store.lpop("l", 2).await.unwrap();
        assert_eq!(popped, vec![b"0".to_vec(), b"1".to_vec()]);

        store.lpush("l", &[b"x".to_vec()]).await.unwrap();
        assert_eq!(store.lindex("l", 0).await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(store.lindex("l", -1).await.unwrap(), Some(b"4".to_vec()));

        let all = store.lrange("l", 0, -1).await.unwrap();
        assert_eq!(all.len(), 4);

        assert_eq!(store.lrem("l", b"x").await.unwrap(), 1);
        assert_eq!(store.llen("l").await.unwrap(), 3);

        // Popping more than the list holds drains it without error.
        let rest = store.lpop("l", 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(store.lpop("l", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = MemoryStore::new();

        store.hset("h", "1", b"0:123.0").await.unwrap();
        store.hset("h", "2", b"1:124.0").await.unwrap();
        assert_eq!(store.hget("h", "1").await.unwrap(), Some(b"0:123.0".to_vec()));

        assert!(store.hdel("h", "1").await.unwrap());
        assert!(!store.hdel("h", "1").await.unwrap());

        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all, vec![("2".to_string(), b"1:124.0".to_vec())]);
    }

    #[tokio::test]
    async fn test_expiration() {
        let store = MemoryStore::new();

        store
            .set_ex("k", b"v", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());

        assert!(store
            .set_nx_ex("k", b"v1", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .set_nx_ex("k", b"v2", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let store = MemoryStore::new();

        store.rpush("it-1:indices:0", &[b"1".to_vec()]).await.unwrap();
        store.rpush("it-1:indices:3", &[b"2".to_vec()]).await.unwrap();
        store.set("it-1:total", b"100").await.unwrap();

        let mut keys = store.keys("it-1:indices:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["it-1:indices:0", "it-1:indices:3"]);
    }
}
