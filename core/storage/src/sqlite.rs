//! SQLite-backed durable store.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use ferry_common::{Error, Result};

use crate::store::{validate_key, DurableStore};

/// Durable store keeping every key in a single `kv` table.
///
/// Calls run on the blocking thread pool so a slow disk never stalls the
/// async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sqlite_error)?;

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )
        .map_err(sqlite_error)?;

        info!("SQLite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))?;
            f(&conn).map_err(sqlite_error)
        })
        .await
        .map_err(|e| Error::Storage(format!("SQLite task failed: {}", e)))?
    }
}

fn sqlite_error(e: rusqlite::Error) -> Error {
    Error::Storage(format!("SQLite error: {}", e))
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| conn.execute("DELETE FROM kv WHERE key = ?1", [key]).map(|_| ()))
            .await
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let keys = stmt
                .query_map([prefix], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
        .await
    }
}
