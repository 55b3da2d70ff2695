//! Local filesystem durable store.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use ferry_common::{Error, Result};

use crate::store::{validate_key, DurableStore};

/// Characters left readable in file names. `.` is always encoded so that an
/// encoded key can never be `..` or collide with a temp file suffix.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Suffix of files being written.
const TEMP_SUFFIX: &str = ".tmp";

/// Local filesystem store.
///
/// Stores one file per key in a flat directory. Keys are percent-encoded
/// into file names; writes go to a temp file that is flushed to disk and
/// renamed over the target so a crash never leaves a half-written value
/// behind. The directory is synced after every rename or removal.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        let file_name: String = utf8_percent_encode(key, KEY_ENCODE_SET).collect();
        self.root.join(file_name)
    }

    /// Flush directory entries so a completed rename or removal survives a crash.
    async fn sync_root(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        fs::File::open(&self.root).await?.sync_all().await?;
        Ok(())
    }

    fn file_name_to_key(name: &str) -> Option<String> {
        if name.ends_with(TEMP_SUFFIX) {
            return None;
        }
        percent_decode_str(name)
            .decode_utf8()
            .ok()
            .map(|k| k.into_owned())
    }
}

#[async_trait]
impl DurableStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.key_to_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read {}: {}", key, e))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let target = self.key_to_path(key);
        let mut temp = target.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        let write = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&value).await?;
            file.sync_all().await
        };
        write
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", key, e)))?;

        fs::rename(&temp, &target)
            .await
            .map_err(|e| Error::Storage(format!("Failed to commit {}: {}", key, e)))?;
        self.sync_root()
            .await
            .map_err(|e| Error::Storage(format!("Failed to sync {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match fs::remove_file(self.key_to_path(key)).await {
            Ok(()) => self
                .sync_root()
                .await
                .map_err(|e| Error::Storage(format!("Failed to sync {}: {}", key, e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete {}: {}", key, e))),
        }
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::Storage(format!("Failed to list store: {}", e)))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("Skipping non UTF-8 file in store: {:?}", name);
                continue;
            };
            if let Some(key) = Self::file_name_to_key(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
