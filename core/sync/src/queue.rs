//! Durable FIFO-within-priority queue of write intents.
//!
//! Every queued operation lives in the store under `queue/pending/<id>` until
//! it succeeds or fails terminally; terminal failures move to
//! `queue/dead/<id>` when dead letters are retained. A mutation is written to
//! the store before the in-memory view changes, so a crash at any point
//! leaves either the old or the new record on disk and never neither.
//!
//! The `in_flight` status is kept in memory only. The persisted record stays
//! `pending` with its previous attempt count until the outcome of the send is
//! known, which makes interrupted sends replay on the next pass.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use ferry_common::{Error, OperationId, Result};
use ferry_storage::{get_json, set_json, DurableStore};

use crate::operation::{OperationDraft, OperationStatus, QueuedOperation};

/// Store namespace of active operations.
pub const PENDING_PREFIX: &str = "queue/pending/";
/// Store namespace of dead letters.
pub const DEAD_PREFIX: &str = "queue/dead/";

/// Queue behavior knobs taken from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Retry budget for drafts that do not set one.
    pub default_max_retries: u32,
    /// Keep terminal failures under `queue/dead/`.
    pub retain_dead_letters: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retain_dead_letters: true,
        }
    }
}

/// What happened to an operation after a failed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to pending for a later pass.
    Retrying { attempt: u32 },
    /// Removed from the active queue.
    DeadLettered { reason: String },
}

struct QueueState {
    active: HashMap<OperationId, QueuedOperation>,
    dead: HashMap<OperationId, QueuedOperation>,
    next_sequence: u64,
}

/// Persistent mutation queue shared by the engine and the coordinator.
pub struct MutationQueue {
    store: Arc<dyn DurableStore>,
    state: RwLock<QueueState>,
    options: QueueOptions,
}

impl MutationQueue {
    /// Open the queue, loading every persisted record from `store`.
    ///
    /// Records that fail to decode are skipped with a warning. Operations
    /// that were in flight when the process stopped come back as pending.
    ///
    /// # Errors
    /// - `QueuePersistence` if the store cannot be listed or read
    pub async fn open(store: Arc<dyn DurableStore>, options: QueueOptions) -> Result<Self> {
        let mut dead = HashMap::new();
        for op in load_prefix(store.as_ref(), DEAD_PREFIX).await? {
            dead.insert(op.id, op);
        }

        let mut active = HashMap::new();
        for mut op in load_prefix(store.as_ref(), PENDING_PREFIX).await? {
            if dead.contains_key(&op.id) {
                // A crash between writing the dead letter and removing the
                // pending record leaves both; the dead letter wins.
                store
                    .delete(&pending_key(&op.id))
                    .await
                    .map_err(Error::into_queue_persistence)?;
                continue;
            }
            if !op.is_active() {
                // Terminal records do not belong under the pending prefix.
                warn!("Found {:?} operation {} among pending records", op.status, op.id);
                let keep = op.status == OperationStatus::Failed && options.retain_dead_letters;
                if keep {
                    set_json(store.as_ref(), &dead_key(&op.id), &op)
                        .await
                        .map_err(Error::into_queue_persistence)?;
                }
                store
                    .delete(&pending_key(&op.id))
                    .await
                    .map_err(Error::into_queue_persistence)?;
                if keep {
                    dead.insert(op.id, op);
                }
                continue;
            }
            op.status = OperationStatus::Pending;
            active.insert(op.id, op);
        }

        let next_sequence = active
            .values()
            .chain(dead.values())
            .map(|op| op.sequence + 1)
            .max()
            .unwrap_or(0);

        info!(
            "Opened mutation queue on {} store: {} pending, {} dead",
            store.name(),
            active.len(),
            dead.len()
        );

        Ok(Self {
            store,
            state: RwLock::new(QueueState {
                active,
                dead,
                next_sequence,
            }),
            options,
        })
    }

    pub fn options(&self) -> QueueOptions {
        self.options
    }

    /// Durably record `draft` as a new pending operation.
    ///
    /// # Errors
    /// - `InvalidInput` if the target is blank
    /// - `QueuePersistence` if the store write fails; nothing is queued then
    pub async fn enqueue(&self, draft: OperationDraft) -> Result<QueuedOperation> {
        if draft.target.trim().is_empty() {
            return Err(Error::InvalidInput("Operation target cannot be empty".to_string()));
        }

        let mut state = self.state.write().await;
        let op = QueuedOperation::from_draft(draft, self.options.default_max_retries, state.next_sequence);
        self.persist_pending(&op).await?;

        state.next_sequence += 1;
        state.active.insert(op.id, op.clone());
        debug!("Queued {} {} {} ({})", op.id, op.method, op.target, op.priority);
        Ok(op)
    }

    /// Active operations in drain order.
    pub async fn list_pending(&self) -> Vec<QueuedOperation> {
        let state = self.state.read().await;
        let mut ops: Vec<_> = state.active.values().cloned().collect();
        ops.sort_by_key(QueuedOperation::sort_key);
        ops
    }

    /// Number of active operations, in-flight ones included.
    pub async fn pending_count(&self) -> usize {
        self.state.read().await.active.len()
    }

    pub async fn get(&self, id: &OperationId) -> Option<QueuedOperation> {
        self.state.read().await.active.get(id).cloned()
    }

    /// Flag an operation as being sent. Memory only.
    pub async fn mark_in_flight(&self, id: &OperationId) -> Result<QueuedOperation> {
        let mut state = self.state.write().await;
        let op = state
            .active
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Queued operation: {}", id)))?;
        op.status = OperationStatus::InFlight;
        Ok(op.clone())
    }

    /// Return an in-flight operation to pending without counting an attempt.
    pub async fn release(&self, id: &OperationId) {
        let mut state = self.state.write().await;
        if let Some(op) = state.active.get_mut(id) {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
            }
        }
    }

    /// Remove a successfully delivered operation.
    ///
    /// # Errors
    /// - `QueuePersistence` if the record cannot be deleted; the operation
    ///   stays queued and will be sent again
    pub async fn record_success(&self, id: &OperationId) -> Result<QueuedOperation> {
        let mut state = self.state.write().await;
        let mut op = state
            .active
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Queued operation: {}", id)))?;

        self.store
            .delete(&pending_key(id))
            .await
            .map_err(Error::into_queue_persistence)?;

        state.active.remove(id);
        op.attempt += 1;
        op.status = OperationStatus::Succeeded;
        debug!("Operation {} succeeded after {} attempt(s)", op.id, op.attempt);
        Ok(op)
    }

    /// Count a failed attempt and decide between retry and dead letter.
    ///
    /// A retryable error with budget left sends the operation back to
    /// pending. Anything else is terminal: the operation leaves the active
    /// queue, and an exhausted retry budget is reported as
    /// `RetriesExhausted`.
    ///
    /// # Errors
    /// - `QueuePersistence` if the new state cannot be written
    pub async fn record_failure(&self, id: &OperationId, error: &Error) -> Result<FailureDisposition> {
        let mut state = self.state.write().await;
        let mut op = state
            .active
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Queued operation: {}", id)))?;

        if error.is_retryable() && op.has_retry_budget() {
            op.attempt += 1;
            op.status = OperationStatus::Pending;
            op.last_error = Some(error.to_string());
            self.persist_pending(&op).await?;

            let attempt = op.attempt;
            state.active.insert(op.id, op);
            debug!("Operation {} will be retried (attempt {})", id, attempt);
            return Ok(FailureDisposition::Retrying { attempt });
        }

        op.attempt += 1;
        op.status = OperationStatus::Failed;
        let reason = if error.is_retryable() {
            Error::RetriesExhausted {
                attempts: op.attempt,
                last_error: error.to_string(),
            }
            .to_string()
        } else {
            error.to_string()
        };
        op.last_error = Some(reason.clone());

        if self.options.retain_dead_letters {
            set_json(self.store.as_ref(), &dead_key(id), &op)
                .await
                .map_err(Error::into_queue_persistence)?;
        }
        self.store
            .delete(&pending_key(id))
            .await
            .map_err(Error::into_queue_persistence)?;

        state.active.remove(id);
        warn!("Operation {} {} {} failed: {}", op.id, op.method, op.target, reason);
        if self.options.retain_dead_letters {
            state.dead.insert(op.id, op);
        }
        Ok(FailureDisposition::DeadLettered { reason })
    }

    /// Terminally failed operations, oldest first.
    pub async fn dead_letters(&self) -> Vec<QueuedOperation> {
        let state = self.state.read().await;
        let mut ops: Vec<_> = state.dead.values().cloned().collect();
        ops.sort_by_key(|op| (op.created_at, op.sequence));
        ops
    }

    /// Move a dead letter back to the active queue with a fresh budget.
    ///
    /// The operation keeps its id, so a server that honors the idempotency
    /// header still sees it as the same write. It joins the back of its
    /// priority lane.
    ///
    /// # Errors
    /// - `NotFound` if no dead letter has this id
    /// - `QueuePersistence` if the store write fails
    pub async fn requeue_dead_letter(&self, id: &OperationId) -> Result<QueuedOperation> {
        let mut state = self.state.write().await;
        let mut op = state
            .dead
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Dead letter: {}", id)))?;

        op.attempt = 0;
        op.status = OperationStatus::Pending;
        op.sequence = state.next_sequence;
        op.created_at = chrono::Utc::now();

        self.persist_pending(&op).await?;
        self.store
            .delete(&dead_key(id))
            .await
            .map_err(Error::into_queue_persistence)?;

        state.next_sequence += 1;
        state.dead.remove(id);
        state.active.insert(op.id, op.clone());
        info!("Requeued dead letter {}", id);
        Ok(op)
    }

    /// Drop a dead letter for good.
    pub async fn discard_dead_letter(&self, id: &OperationId) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.dead.contains_key(id) {
            return Err(Error::NotFound(format!("Dead letter: {}", id)));
        }
        self.store
            .delete(&dead_key(id))
            .await
            .map_err(Error::into_queue_persistence)?;
        state.dead.remove(id);
        info!("Discarded dead letter {}", id);
        Ok(())
    }

    async fn persist_pending(&self, op: &QueuedOperation) -> Result<()> {
        let mut record = op.clone();
        record.status = OperationStatus::Pending;
        set_json(self.store.as_ref(), &pending_key(&op.id), &record)
            .await
            .map_err(Error::into_queue_persistence)
    }
}

fn pending_key(id: &OperationId) -> String {
    format!("{}{}", PENDING_PREFIX, id)
}

fn dead_key(id: &OperationId) -> String {
    format!("{}{}", DEAD_PREFIX, id)
}

async fn load_prefix(store: &dyn DurableStore, prefix: &str) -> Result<Vec<QueuedOperation>> {
    let keys = store
        .list_keys_with_prefix(prefix)
        .await
        .map_err(Error::into_queue_persistence)?;

    let mut ops = Vec::with_capacity(keys.len());
    for key in keys {
        match get_json::<QueuedOperation>(store, &key).await {
            Ok(Some(op)) => ops.push(op),
            Ok(None) => {}
            Err(Error::Serialization(e)) => warn!("Skipping corrupt queue record {}: {}", key, e),
            Err(e) => return Err(e.into_queue_persistence()),
        }
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_common::Priority;
    use ferry_storage::MemoryStore;
    use proptest::prelude::*;

    async fn open(store: &MemoryStore) -> MutationQueue {
        MutationQueue::open(Arc::new(store.clone()), QueueOptions::default())
            .await
            .unwrap()
    }

    fn transient() -> Error {
        Error::TransientNetwork("HTTP 503: unavailable".to_string())
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_returning() {
        let store = MemoryStore::new();
        let queue = open(&store).await;

        let op = queue.enqueue(OperationDraft::post("/visits")).await.unwrap();

        assert_eq!(queue.pending_count().await, 1);
        let keys = store.list_keys_with_prefix(PENDING_PREFIX).await.unwrap();
        assert_eq!(keys, vec![format!("queue/pending/{}", op.id)]);
    }

    #[tokio::test]
    async fn test_enqueue_failure_leaves_queue_unchanged() {
        let store = MemoryStore::new();
        let queue = open(&store).await;
        store.set_read_only(true);

        let result = queue.enqueue(OperationDraft::post("/visits")).await;

        assert!(matches!(result, Err(Error::QueuePersistence(_))));
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_blank_target_rejected() {
        let queue = open(&MemoryStore::new()).await;
        let result = queue.enqueue(OperationDraft::post("  ")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue = open(&MemoryStore::new()).await;

        let low = queue
            .enqueue(OperationDraft::post("/low").with_priority(Priority::Low))
            .await
            .unwrap();
        let first = queue.enqueue(OperationDraft::post("/m1")).await.unwrap();
        let high = queue
            .enqueue(OperationDraft::post("/high").with_priority(Priority::High))
            .await
            .unwrap();
        let second = queue.enqueue(OperationDraft::post("/m2")).await.unwrap();

        let order: Vec<_> = queue.list_pending().await.into_iter().map(|op| op.id).collect();
        assert_eq!(order, vec![high.id, first.id, second.id, low.id]);
    }

    #[tokio::test]
    async fn test_reopen_restores_queue() {
        let store = MemoryStore::new();
        let queue = open(&store).await;
        let a = queue.enqueue(OperationDraft::post("/a")).await.unwrap();
        let b = queue.enqueue(OperationDraft::put("/b")).await.unwrap();
        queue.mark_in_flight(&a.id).await.unwrap();
        drop(queue);

        let reopened = open(&store).await;
        let pending = reopened.list_pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a.id);
        assert_eq!(pending[0].status, OperationStatus::Pending);
        assert_eq!(pending[0].attempt, 0);
        assert_eq!(pending[1].id, b.id);

        let c = reopened.enqueue(OperationDraft::post("/c")).await.unwrap();
        assert!(c.sequence > b.sequence);
    }

    #[tokio::test]
    async fn test_terminal_records_leave_pending_on_open() {
        let store = MemoryStore::new();
        let mut failed = QueuedOperation::from_draft(OperationDraft::post("/rejected"), 3, 0);
        failed.status = OperationStatus::Failed;
        let mut delivered = QueuedOperation::from_draft(OperationDraft::post("/done"), 3, 1);
        delivered.status = OperationStatus::Succeeded;
        set_json(&store, &pending_key(&failed.id), &failed).await.unwrap();
        set_json(&store, &pending_key(&delivered.id), &delivered).await.unwrap();

        let queue = open(&store).await;

        assert_eq!(queue.pending_count().await, 0);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, failed.id);
        assert!(store.list_keys_with_prefix(PENDING_PREFIX).await.unwrap().is_empty());
        assert!(store.get(&dead_key(&failed.id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_record_skipped_on_open() {
        let store = MemoryStore::new();
        store
            .set("queue/pending/not-an-op", b"{".to_vec())
            .await
            .unwrap();

        let queue = open(&store).await;
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_success_removes_record() {
        let store = MemoryStore::new();
        let queue = open(&store).await;
        let op = queue.enqueue(OperationDraft::post("/a")).await.unwrap();

        queue.mark_in_flight(&op.id).await.unwrap();
        let done = queue.record_success(&op.id).await.unwrap();

        assert_eq!(done.status, OperationStatus::Succeeded);
        assert_eq!(done.attempt, 1);
        assert_eq!(queue.pending_count().await, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_success_write_keeps_operation() {
        let store = MemoryStore::new();
        let queue = open(&store).await;
        let op = queue.enqueue(OperationDraft::post("/a")).await.unwrap();
        store.set_read_only(true);

        let result = queue.record_success(&op.id).await;

        assert!(matches!(result, Err(Error::QueuePersistence(_))));
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_retry_then_exhaustion() {
        let store = MemoryStore::new();
        let queue = open(&store).await;
        let op = queue
            .enqueue(OperationDraft::post("/a").with_max_retries(2))
            .await
            .unwrap();

        let first = queue.record_failure(&op.id, &transient()).await.unwrap();
        assert_eq!(first, FailureDisposition::Retrying { attempt: 1 });
        let persisted: QueuedOperation = get_json(&store, &format!("queue/pending/{}", op.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.attempt, 1);

        let second = queue.record_failure(&op.id, &transient()).await.unwrap();
        match second {
            FailureDisposition::DeadLettered { reason } => {
                assert!(reason.starts_with("Retries exhausted after 2 attempts"));
            }
            other => panic!("expected dead letter, got {:?}", other),
        }

        assert_eq!(queue.pending_count().await, 0);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt, 2);
        assert_eq!(dead[0].status, OperationStatus::Failed);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal() {
        let queue = open(&MemoryStore::new()).await;
        let op = queue.enqueue(OperationDraft::post("/a")).await.unwrap();

        let rejected = Error::RejectedOperation {
            status: 422,
            message: "invalid dose".to_string(),
        };
        let disposition = queue.record_failure(&op.id, &rejected).await.unwrap();

        assert!(matches!(disposition, FailureDisposition::DeadLettered { .. }));
        assert_eq!(queue.dead_letters().await[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_dead_letters_not_retained() {
        let store = MemoryStore::new();
        let queue = MutationQueue::open(
            Arc::new(store.clone()),
            QueueOptions {
                default_max_retries: 1,
                retain_dead_letters: false,
            },
        )
        .await
        .unwrap();
        let op = queue.enqueue(OperationDraft::post("/a")).await.unwrap();

        queue.record_failure(&op.id, &transient()).await.unwrap();

        assert!(queue.dead_letters().await.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_dead_letter() {
        let store = MemoryStore::new();
        let queue = open(&store).await;
        let op = queue
            .enqueue(OperationDraft::post("/a").with_max_retries(1))
            .await
            .unwrap();
        let later = queue.enqueue(OperationDraft::post("/b")).await.unwrap();
        queue.record_failure(&op.id, &transient()).await.unwrap();

        let requeued = queue.requeue_dead_letter(&op.id).await.unwrap();

        assert_eq!(requeued.id, op.id);
        assert_eq!(requeued.attempt, 0);
        assert!(queue.dead_letters().await.is_empty());
        let order: Vec<_> = queue.list_pending().await.into_iter().map(|op| op.id).collect();
        assert_eq!(order, vec![later.id, op.id]);
        assert!(store.get(&format!("queue/dead/{}", op.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_discard_dead_letter() {
        let queue = open(&MemoryStore::new()).await;
        let op = queue
            .enqueue(OperationDraft::post("/a").with_max_retries(1))
            .await
            .unwrap();
        queue.record_failure(&op.id, &transient()).await.unwrap();

        queue.discard_dead_letter(&op.id).await.unwrap();
        assert!(queue.dead_letters().await.is_empty());
        assert!(matches!(
            queue.discard_dead_letter(&op.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_wins_over_stale_pending_record() {
        let store = MemoryStore::new();
        let queue = open(&store).await;
        let op = queue
            .enqueue(OperationDraft::post("/a").with_max_retries(1))
            .await
            .unwrap();
        let pending_record = store
            .get(&format!("queue/pending/{}", op.id))
            .await
            .unwrap()
            .unwrap();
        queue.record_failure(&op.id, &transient()).await.unwrap();
        drop(queue);

        // Simulate a crash between writing the dead letter and deleting the pending record.
        store
            .set(&format!("queue/pending/{}", op.id), pending_record)
            .await
            .unwrap();

        let reopened = open(&store).await;
        assert_eq!(reopened.pending_count().await, 0);
        assert_eq!(reopened.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_restores_pending() {
        let queue = open(&MemoryStore::new()).await;
        let op = queue.enqueue(OperationDraft::post("/a")).await.unwrap();

        queue.mark_in_flight(&op.id).await.unwrap();
        assert_eq!(queue.get(&op.id).await.unwrap().status, OperationStatus::InFlight);

        queue.release(&op.id).await;
        let released = queue.get(&op.id).await.unwrap();
        assert_eq!(released.status, OperationStatus::Pending);
        assert_eq!(released.attempt, 0);
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![Just(Priority::High), Just(Priority::Medium), Just(Priority::Low)]
    }

    proptest! {
        #[test]
        fn prop_drain_order_is_priority_then_fifo(priorities in prop::collection::vec(priority_strategy(), 1..24)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let order = runtime.block_on(async {
                let queue = open(&MemoryStore::new()).await;
                let mut enqueued = Vec::new();
                for (i, priority) in priorities.iter().enumerate() {
                    let op = queue
                        .enqueue(OperationDraft::post(format!("/op/{}", i)).with_priority(*priority))
                        .await
                        .unwrap();
                    enqueued.push((op.priority, op.sequence));
                }
                let listed: Vec<_> = queue
                    .list_pending()
                    .await
                    .into_iter()
                    .map(|op| (op.priority, op.sequence))
                    .collect();
                (enqueued, listed)
            });

            let (mut expected, listed) = order;
            expected.sort();
            prop_assert_eq!(listed, expected);
        }
    }
}
