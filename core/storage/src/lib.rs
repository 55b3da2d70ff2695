//! Durable store abstraction for Ferry.
//!
//! This module provides the minimal persistent key-value interface that the
//! read-through cache and the mutation queue persist through, plus the
//! built-in backends and a registry for picking one by name.
//!
//! # Design Principles
//! - Store isolation: no backend-specific logic in the cache or queue
//! - Async operations: all I/O operations are async
//! - Durable on return: a completed `set`/`delete` survives a restart

pub mod local;
pub mod memory;
pub mod registry;
pub mod sqlite;
pub mod store;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
pub use store::{get_json, set_json, DurableStore};
