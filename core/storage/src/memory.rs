//! In-memory durable store for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use ferry_common::{Error, Result};

use crate::store::{validate_key, DurableStore};

/// In-memory store.
///
/// Useful for testing and development. All data is stored in memory and
/// lost on drop; clones share the same map, which lets a test "reopen" a
/// queue or cache over the same contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    storage: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    read_only: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` and `delete` fail with a storage error.
    ///
    /// Simulates a full disk or a revoked write permission.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.storage.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Check if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::Storage("Memory store is read-only".to_string()));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("Memory store lock poisoned".to_string())
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let storage = self.storage.read().map_err(poisoned)?;
        Ok(storage.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.check_writable()?;
        self.storage
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.check_writable()?;
        self.storage.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let storage = self.storage.read().map_err(poisoned)?;
        Ok(storage
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        store.set("cache/profile", b"Alice".to_vec()).await.unwrap();

        let value = store.get("cache/profile").await.unwrap();
        assert_eq!(value, Some(b"Alice".to_vec()));
    }

    #[tokio::test]
    async fn test_overwrite() {
        let store = MemoryStore::new();
        store.set("k", b"one".to_vec()).await.unwrap();
        store.set("k", b"two".to_vec()).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        store.delete("nothing-here").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_keys_with_prefix() {
        let store = MemoryStore::new();
        store.set("queue/pending/b", vec![]).await.unwrap();
        store.set("queue/pending/a", vec![]).await.unwrap();
        store.set("queue/dead/c", vec![]).await.unwrap();
        store.set("cache/x", vec![]).await.unwrap();

        let keys = store.list_keys_with_prefix("queue/pending/").await.unwrap();
        assert_eq!(keys, vec!["queue/pending/a", "queue/pending/b"]);

        let all_queue = store.list_keys_with_prefix("queue/").await.unwrap();
        assert_eq!(all_queue.len(), 3);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec()).await.unwrap();
        store.set_read_only(true);

        assert!(matches!(store.set("k", vec![]).await, Err(Error::Storage(_))));
        assert!(store.delete("k").await.is_err());
        // Reads keep working.
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        store.set_read_only(false);
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_contents() {
        let store = MemoryStore::new();
        let reopened = store.clone();
        store.set("shared", b"1".to_vec()).await.unwrap();
        assert_eq!(reopened.get("shared").await.unwrap(), Some(b"1".to_vec()));
    }
}
