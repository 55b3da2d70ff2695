//! Store registry for resolving a durable store from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use ferry_common::{Error, Result};

use crate::store::DurableStore;

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn DurableStore>> + Send + Sync>;

/// Registry for durable store factories.
///
/// Lets the host application pick the persistence technology by name and
/// JSON configuration.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - Store not registered
    /// - Configuration invalid for the store
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn DurableStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Store '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered store names, sorted.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a store is registered.
    pub fn has_store(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str<'a>(config: &'a Value, store: &str, field: &str) -> Result<&'a str> {
    config.get(field).and_then(|v| v.as_str()).ok_or_else(|| {
        Error::InvalidInput(format!("{} store requires '{}'", store, field))
    })
}

/// Create a registry with the built-in stores: `memory`, `local` (`root`)
/// and `sqlite` (`path`).
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    );

    registry.factories.insert(
        "local".to_string(),
        Box::new(|config| {
            let root = required_str(&config, "local", "root")?;
            Ok(Arc::new(crate::local::LocalStore::new(root)?))
        }),
    );

    registry.factories.insert(
        "sqlite".to_string(),
        Box::new(|config| {
            let path = required_str(&config, "sqlite", "path")?;
            Ok(Arc::new(crate::sqlite::SqliteStore::open(path)?))
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StoreRegistry::new();

        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))))
            .unwrap();

        let store = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = StoreRegistry::new();

        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))))
            .unwrap();

        let result = registry.register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = StoreRegistry::new();
        let result = registry.resolve("unknown", Value::Null);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry();
        assert_eq!(registry.stores(), vec!["local", "memory", "sqlite"]);

        let temp = TempDir::new().unwrap();
        let local = registry
            .resolve("local", json!({ "root": temp.path().join("kv") }))
            .unwrap();
        assert_eq!(local.name(), "local");

        let sqlite = registry
            .resolve("sqlite", json!({ "path": temp.path().join("ferry.db") }))
            .unwrap();
        assert_eq!(sqlite.name(), "sqlite");
    }

    #[test]
    fn test_missing_config_field() {
        let registry = create_default_registry();
        let result = registry.resolve("local", json!({}));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
