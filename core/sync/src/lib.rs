//! Ferry sync engine
//!
//! Offline-first access to a remote backend:
//! - Connectivity monitoring with debounced transitions
//! - Read-through cache that serves the last snapshot when offline
//! - Durable mutation queue ordered by priority, then age
//! - Background coordinator draining the queue with retries and backoff
//! - Optimistic apply with rollback on failure

pub mod backoff;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod operation;
pub mod queue;
pub mod transport;
pub mod write;

// Re-export main types
pub use backoff::BackoffConfig;
pub use cache::{CacheEntry, ReadOptions, ReadThroughCache};
pub use config::EngineConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use coordinator::{CoordinatorState, InvalidationMap, SyncCompleteHandler, SyncCoordinator, SyncResult};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use operation::{OperationDraft, OperationStatus, QueuedOperation};
pub use queue::{FailureDisposition, MutationQueue, QueueOptions};
pub use transport::{
    HttpTransport, ScriptedReply, ScriptedTransport, Transport, TransportRequest, TransportResponse,
};
pub use write::{WriteOptions, WriteOutcome};
