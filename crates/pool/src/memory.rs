use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

/// Keyed in-memory byte buffers shared between the pool's submitters and
/// request handlers, for payloads that should not round-trip through the
/// KV store (previews, inspection results).
#[derive(Default)]
pub struct SharedBuffers {
    buffers: Mutex<HashMap<String, Bytes>>,
}

impl SharedBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, value: Bytes) {
        self.buffers.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.buffers.lock().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.buffers.lock().unwrap().remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let buffers = SharedBuffers::new();
        assert!(buffers.get("preview:it-1").is_none());

        buffers.put("preview:it-1", Bytes::from_static(b"payload"));
        assert_eq!(
            buffers.get("preview:it-1"),
            Some(Bytes::from_static(b"payload"))
        );

        assert!(buffers.remove("preview:it-1").is_some());
        assert!(buffers.get("preview:it-1").is_none());
    }
}
