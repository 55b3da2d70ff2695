//! Common utilities and types shared across Ferry crates.
//!
//! This module provides the error taxonomy used by the store, cache, queue
//! and coordinator, plus the small value types they exchange.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Method, OperationId, Priority};
