//! Durable store trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use ferry_common::{Error, Result};

/// Persistent key-value store backing the cache and the mutation queue.
///
/// Keys are non-empty UTF-8 strings; `/` is conventionally used to build
/// namespaces (`cache/…`, `queue/pending/…`) that `list_keys_with_prefix`
/// enumerates. Implementations must make a successful `set` or `delete`
/// durable before returning.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Get the store name (e.g., "memory", "local", "sqlite").
    fn name(&self) -> &str;

    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Postconditions
    /// - A subsequent `get(key)` returns `value`, also after reopening the store
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys starting with `prefix`, in ascending order.
    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read and deserialize a JSON value from `store`.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize `value` as JSON and store it under `key`.
pub async fn set_json<T: Serialize + Sync + ?Sized>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes).await
}

/// Reject keys no store can hold.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput("Store key cannot be empty".to_string()));
    }
    Ok(())
}
