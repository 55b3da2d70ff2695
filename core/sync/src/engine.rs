//! Sync engine: the public face tying cache, queue and coordinator together.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use ferry_common::{OperationId, Result};
use ferry_storage::DurableStore;

use crate::cache::{ReadOptions, ReadThroughCache};
use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::coordinator::{CoordinatorState, Drainer, InvalidationMap, SyncCoordinator, SyncResult};
use crate::operation::{OperationDraft, QueuedOperation};
use crate::queue::{MutationQueue, QueueOptions};
use crate::transport::{Transport, TransportRequest, TransportResponse};
use crate::write::{WriteOptions, WriteOutcome};

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    invalidation: Option<Arc<dyn InvalidationMap>>,
    initial_state: ConnectivityState,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Extra cache keys to drop whenever an operation is delivered.
    pub fn invalidation_map<M>(mut self, map: M) -> Self
    where
        M: InvalidationMap + 'static,
    {
        self.invalidation = Some(Arc::new(map));
        self
    }

    /// Connectivity assumed until the platform reports otherwise.
    pub fn initial_state(mut self, state: ConnectivityState) -> Self {
        self.initial_state = state;
        self
    }

    /// Open the queue and start the coordinator.
    ///
    /// Nothing is drained on start; call [`SyncEngine::sync_now`] to flush
    /// work left over from a previous run.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration fails validation
    /// - `QueuePersistence` if the persisted queue cannot be loaded
    pub async fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;

        let connectivity = ConnectivityMonitor::new(self.initial_state, self.config.connectivity_guard());
        let queue = Arc::new(
            MutationQueue::open(
                self.store.clone(),
                QueueOptions {
                    default_max_retries: self.config.max_retries,
                    retain_dead_letters: self.config.retain_dead_letters,
                },
            )
            .await?,
        );
        let cache = Arc::new(ReadThroughCache::new(self.store.clone(), connectivity.clone()));

        let drainer = Drainer {
            queue: queue.clone(),
            cache: cache.clone(),
            transport: self.transport.clone(),
            connectivity: connectivity.clone(),
            invalidation: self.invalidation,
            idempotency_header: self.config.idempotency_header.clone(),
        };
        let coordinator = SyncCoordinator::spawn(drainer, self.config.backoff.clone());

        info!(
            "Sync engine ready: store={}, transport={}, {}",
            self.store.name(),
            self.transport.name(),
            connectivity.state()
        );

        Ok(SyncEngine {
            config: self.config,
            transport: self.transport,
            connectivity,
            cache,
            queue,
            coordinator,
        })
    }
}

/// Offline-first access to a backend.
///
/// Reads go through the read-through cache; writes are applied directly when
/// online and durably queued otherwise. Queued writes are delivered by a
/// background coordinator when connectivity returns, on [`sync_now`], and
/// on a backoff schedule while retryable work is left.
///
/// [`sync_now`]: Self::sync_now
pub struct SyncEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    connectivity: ConnectivityMonitor,
    cache: Arc<ReadThroughCache>,
    queue: Arc<MutationQueue>,
    coordinator: SyncCoordinator,
}

impl SyncEngine {
    /// Start building an engine over `store` and `transport`.
    ///
    /// Defaults: [`EngineConfig::default`], no invalidation map, offline
    /// until the platform reports connectivity.
    pub fn builder(store: Arc<dyn DurableStore>, transport: Arc<dyn Transport>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            transport,
            config: EngineConfig::default(),
            invalidation: None,
            initial_state: ConnectivityState::Offline,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read `key` through the cache. See [`ReadThroughCache::read`].
    pub async fn cached_read<F, Fut>(&self, key: &str, fetch: F, options: ReadOptions) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        self.cache.read(key, fetch, options).await
    }

    /// Typed variant of [`cached_read`](Self::cached_read).
    pub async fn cached_read_json<T, F, Fut>(&self, key: &str, fetch: F, options: ReadOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.cache.read_json(key, fetch, options).await
    }

    /// Durably queue `draft` for the next drain pass.
    ///
    /// Returns once the operation is persisted; never waits for the network.
    /// While online, the coordinator is nudged to deliver it, unless a
    /// backoff retry is already scheduled.
    ///
    /// # Errors
    /// - `QueuePersistence` if the store write fails
    pub async fn enqueue(&self, draft: OperationDraft) -> Result<OperationId> {
        let op = self.queue.enqueue(draft).await?;
        if self.connectivity.is_online() {
            self.coordinator.nudge();
        }
        Ok(op.id)
    }

    /// Apply a write directly when online, queue it when offline.
    ///
    /// `on_optimistic_apply` runs before anything else. Offline, the draft is
    /// queued and `direct` is never called. Online, `direct` runs; a
    /// retryable failure is queued when `queue_on_failure` is set and
    /// returned otherwise. `on_rollback` runs only when this returns `Err`.
    ///
    /// # Errors
    /// - The error from `direct` when it is not queued
    /// - `QueuePersistence` if queuing was needed and failed
    pub async fn queued_write<T, F, Fut>(
        &self,
        draft: OperationDraft,
        direct: F,
        options: WriteOptions,
    ) -> Result<WriteOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let WriteOptions {
            queue_on_failure,
            on_optimistic_apply,
            on_rollback,
        } = options;

        if let Some(apply) = on_optimistic_apply {
            apply();
        }

        let outcome = self.apply_or_queue(draft, direct, queue_on_failure).await;

        if let (Err(e), Some(rollback)) = (&outcome, on_rollback) {
            debug!("Rolling back optimistic write: {}", e);
            rollback(e);
        }
        outcome
    }

    /// [`queued_write`](Self::queued_write) that sends the draft itself
    /// through the engine's transport when online.
    pub async fn write(
        &self,
        draft: OperationDraft,
        options: WriteOptions,
    ) -> Result<WriteOutcome<TransportResponse>> {
        let request = TransportRequest {
            method: draft.method,
            target: draft.target.clone(),
            body: draft.body.clone().into(),
            headers: draft.headers.clone(),
        };
        let transport = self.transport.clone();
        self.queued_write(
            draft,
            || async move {
                transport
                    .execute(&request)
                    .await
                    .and_then(TransportResponse::into_result)
            },
            options,
        )
        .await
    }

    async fn apply_or_queue<T, F, Fut>(
        &self,
        draft: OperationDraft,
        direct: F,
        queue_on_failure: bool,
    ) -> Result<WriteOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.connectivity.is_online() {
            let id = self.enqueue(draft).await?;
            debug!("Offline, queued write {}", id);
            return Ok(WriteOutcome::Queued(id));
        }

        match direct().await {
            Ok(value) => Ok(WriteOutcome::Applied(value)),
            Err(e) if queue_on_failure && e.is_retryable() => {
                warn!("Direct write failed ({}), queuing for retry", e);
                let id = self.enqueue(draft).await?;
                Ok(WriteOutcome::Queued(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Run a drain pass now and return its result.
    ///
    /// Offline, the pass attempts nothing and reports what is still queued.
    pub async fn sync_now(&self) -> Result<SyncResult> {
        self.coordinator.sync_now().await
    }

    /// Register a handler called after every drain pass.
    pub fn on_sync_complete<F>(&self, handler: F)
    where
        F: Fn(&SyncResult) + Send + Sync + 'static,
    {
        self.coordinator.on_sync_complete(handler);
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.pending_count().await
    }

    /// Queued operations in drain order.
    pub async fn pending(&self) -> Vec<QueuedOperation> {
        self.queue.list_pending().await
    }

    pub async fn dead_letters(&self) -> Vec<QueuedOperation> {
        self.queue.dead_letters().await
    }

    /// Give a dead letter a fresh retry budget and queue it again.
    pub async fn requeue_dead_letter(&self, id: &OperationId) -> Result<()> {
        self.queue.requeue_dead_letter(id).await?;
        if self.connectivity.is_online() {
            self.coordinator.nudge();
        }
        Ok(())
    }

    pub async fn discard_dead_letter(&self, id: &OperationId) -> Result<()> {
        self.queue.discard_dead_letter(id).await
    }

    /// Stop the drain pass in progress, if any.
    pub fn cancel_sync(&self) {
        self.coordinator.cancel_sync();
    }

    /// The connectivity monitor; the platform reports reachability here.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn coordinator_state(&self) -> CoordinatorState {
        self.coordinator.state()
    }

    pub fn subscribe_coordinator_state(&self) -> tokio::sync::watch::Receiver<CoordinatorState> {
        self.coordinator.subscribe_state()
    }

    pub fn cache(&self) -> &ReadThroughCache {
        &self.cache
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Stop the coordinator. Queued work stays in the store.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        info!("Sync engine shut down");
    }
}
