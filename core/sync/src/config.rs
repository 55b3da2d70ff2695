//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use ferry_common::{Error, Result};

use crate::backoff::BackoffConfig;

/// Configuration for the sync engine.
///
/// Every field has a default, so a config file only needs to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts allowed per queued operation unless its draft says otherwise.
    pub max_retries: u32,
    /// How long a raw connectivity change must persist before it is published.
    pub connectivity_guard_ms: u64,
    /// Delay between automatic drain passes.
    pub backoff: BackoffConfig,
    /// Keep terminally failed operations for inspection.
    pub retain_dead_letters: bool,
    /// Header carrying the operation id on replayed requests; `None` disables it.
    pub idempotency_header: Option<String>,
    /// Per-request timeout of the HTTP transport.
    pub request_timeout_ms: u64,
}

impl EngineConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - File is not valid JSON for this structure
    /// - Values fail validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::Serialization(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidInput("max_retries must be at least 1".to_string()));
        }
        if self.backoff.base_ms == 0 || self.backoff.cap_ms < self.backoff.base_ms {
            return Err(Error::InvalidInput(
                "backoff requires 0 < base_ms <= cap_ms".to_string(),
            ));
        }
        if let Some(header) = &self.idempotency_header {
            if header.trim().is_empty() {
                return Err(Error::InvalidInput(
                    "idempotency_header cannot be blank".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Set the default retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the connectivity debounce interval.
    pub fn with_connectivity_guard(mut self, guard: Duration) -> Self {
        self.connectivity_guard_ms = guard.as_millis() as u64;
        self
    }

    /// Set the inter-pass backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn connectivity_guard(&self) -> Duration {
        Duration::from_millis(self.connectivity_guard_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connectivity_guard_ms: 1_500,
            backoff: BackoffConfig::default(),
            retain_dead_letters: true,
            idempotency_header: Some("Idempotency-Key".to_string()),
            request_timeout_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff.base_ms, 2_000);
        assert_eq!(config.backoff.cap_ms, 60_000);
    }

    #[test]
    fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ferry.json");
        std::fs::write(
            &path,
            r#"{ "max_retries": 5, "backoff": { "cap_ms": 10000 }, "idempotency_header": null }"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff.cap_ms, 10_000);
        assert_eq!(config.backoff.base_ms, 2_000);
        assert_eq!(config.idempotency_header, None);
        assert_eq!(config.connectivity_guard(), Duration::from_millis(1_500));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ferry.json");
        std::fs::write(&path, r#"{ "max_retries": 0 }"#).unwrap();

        assert!(matches!(EngineConfig::load(&path), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ferry.json");
        std::fs::write(&path, "{ max_retries").unwrap();

        assert!(matches!(EngineConfig::load(&path), Err(Error::Serialization(_))));
    }
}
