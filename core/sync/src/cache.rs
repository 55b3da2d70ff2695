//! Read-through, write-through cache over a durable store.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use ferry_common::types::base64_bytes;
use ferry_common::{Error, Result};
use ferry_storage::{get_json, set_json, DurableStore};

use crate::connectivity::ConnectivityMonitor;

/// Store namespace of cache entries.
pub const CACHE_PREFIX: &str = "cache/";

/// Last successful payload fetched for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// Options for a cached read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Fall back to the stored snapshot when offline or when the fetch fails.
    pub use_cache: bool,
}

impl ReadOptions {
    /// Always go to the network and never serve a snapshot.
    pub fn network_only() -> Self {
        Self { use_cache: false }
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

/// Serves fresh data when online and the last durable snapshot otherwise.
pub struct ReadThroughCache {
    store: Arc<dyn DurableStore>,
    connectivity: ConnectivityMonitor,
}

impl ReadThroughCache {
    pub fn new(store: Arc<dyn DurableStore>, connectivity: ConnectivityMonitor) -> Self {
        Self {
            store,
            connectivity,
        }
    }

    /// Read `key`, fetching when online and falling back to the snapshot.
    ///
    /// Online, a successful fetch always refreshes the snapshot. A failed
    /// fetch returns the snapshot if `use_cache` is set and one exists,
    /// otherwise the fetch error. Offline, `fetch` is never called.
    ///
    /// # Errors
    /// - `NoCachedData` when offline without a snapshot
    /// - The fetch error when online without a usable snapshot
    pub async fn read<F, Fut>(&self, key: &str, fetch: F, options: ReadOptions) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        validate_cache_key(key)?;

        if !self.connectivity.is_online() {
            if options.use_cache {
                if let Some(entry) = self.load(key).await? {
                    debug!("Offline, serving cached {}", key);
                    return Ok(entry.payload);
                }
            }
            return Err(Error::NoCachedData(key.to_string()));
        }

        match fetch().await {
            Ok(payload) => {
                if let Err(e) = self.put(key, payload.clone()).await {
                    warn!("Failed to refresh cache entry {}: {}", key, e);
                }
                Ok(payload)
            }
            Err(err) => {
                if options.use_cache {
                    match self.load(key).await {
                        Ok(Some(entry)) => {
                            warn!("Fetch for {} failed ({}), serving cached copy", key, err);
                            return Ok(entry.payload);
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Cache lookup for {} failed: {}", key, e),
                    }
                }
                Err(err)
            }
        }
    }

    /// Typed variant of [`read`](Self::read) storing the value as JSON.
    pub async fn read_json<T, F, Fut>(&self, key: &str, fetch: F, options: ReadOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let payload = self
            .read(
                key,
                || async move {
                    let value = fetch().await?;
                    Ok::<_, Error>(serde_json::to_vec(&value)?)
                },
                options,
            )
            .await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Get the stored entry for `key` without touching the network.
    pub async fn peek(&self, key: &str) -> Result<Option<CacheEntry>> {
        validate_cache_key(key)?;
        get_json(self.store.as_ref(), &entry_key(key)).await
    }

    /// Store `payload` as the snapshot for `key`, replacing any previous one.
    pub async fn put(&self, key: &str, payload: Vec<u8>) -> Result<CacheEntry> {
        validate_cache_key(key)?;
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            stored_at: Utc::now(),
        };
        set_json(self.store.as_ref(), &entry_key(key), &entry).await?;
        Ok(entry)
    }

    /// Drop the snapshot for `key` so the next read has to fetch.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        validate_cache_key(key)?;
        debug!("Invalidating cache entry {}", key);
        self.store.delete(&entry_key(key)).await
    }

    /// Drop every snapshot in `keys`, stopping at the first store failure.
    pub async fn invalidate_all<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            self.invalidate(key.as_ref()).await?;
        }
        Ok(())
    }

    /// Keys that currently have a snapshot.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let keys = self.store.list_keys_with_prefix(CACHE_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(CACHE_PREFIX).map(str::to_string))
            .collect())
    }

    /// Snapshot lookup used by the fallback paths. An undecodable entry is
    /// treated as missing.
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.peek(key).await {
            Err(Error::Serialization(e)) => {
                warn!("Ignoring corrupt cache entry {}: {}", key, e);
                Ok(None)
            }
            other => other,
        }
    }
}

fn entry_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}

fn validate_cache_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput("Cache key cannot be empty".to_string()));
    }
    Ok(())
}
