//! Sync coordinator: drains the mutation queue against the transport.
//!
//! A single background task owns draining. It wakes on `sync_now` requests,
//! on online transitions and on the backoff timer, and runs one pass at a
//! time. Triggers that arrive while a pass is running are folded into a
//! single follow-up pass. New work nudges the task too, but a nudge never
//! overrides a scheduled backoff: retryable leftovers wait for the timer.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ferry_common::{Error, OperationId, Result};

use crate::backoff::BackoffConfig;
use crate::cache::ReadThroughCache;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::operation::QueuedOperation;
use crate::queue::{FailureDisposition, MutationQueue};
use crate::transport::{Transport, TransportRequest, TransportResponse};

/// Whether a drain pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Draining,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    /// Delivered operations, in processing order.
    pub succeeded: Vec<OperationId>,
    /// Terminally failed operations, in processing order.
    pub failed: Vec<OperationId>,
    /// Operations that failed retryably and wait for a later pass.
    pub retried: Vec<OperationId>,
    /// Operations still queued after the pass.
    pub remaining: usize,
    /// Cache keys dropped after successful deliveries.
    pub invalidated: Vec<String>,
    /// The pass was stopped by `cancel_sync` or shutdown.
    pub cancelled: bool,
    pub duration: Duration,
}

impl SyncResult {
    /// Whether the pass attempted nothing.
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.retried.is_empty()
    }
}

/// Maps a delivered operation to extra cache keys to invalidate.
pub trait InvalidationMap: Send + Sync {
    fn keys_for(&self, op: &QueuedOperation) -> Vec<String>;
}

impl<F> InvalidationMap for F
where
    F: Fn(&QueuedOperation) -> Vec<String> + Send + Sync,
{
    fn keys_for(&self, op: &QueuedOperation) -> Vec<String> {
        self(op)
    }
}

/// Callback run after every drain pass.
pub type SyncCompleteHandler = Arc<dyn Fn(&SyncResult) + Send + Sync>;

/// Everything a drain pass touches.
pub(crate) struct Drainer {
    pub(crate) queue: Arc<MutationQueue>,
    pub(crate) cache: Arc<ReadThroughCache>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connectivity: ConnectivityMonitor,
    pub(crate) invalidation: Option<Arc<dyn InvalidationMap>>,
    pub(crate) idempotency_header: Option<String>,
}

impl Drainer {
    /// Attempt every pending operation once, in drain order.
    ///
    /// Stops early when `cancel` fires or the monitor goes offline; the
    /// operations not reached stay pending.
    ///
    /// # Errors
    /// - `QueuePersistence` if an outcome cannot be recorded; the pass stops
    ///   and the operation involved stays pending
    pub(crate) async fn drain_pass(&self, cancel: &CancellationToken) -> Result<SyncResult> {
        let started = std::time::Instant::now();
        let mut result = SyncResult::default();
        let snapshot = self.queue.list_pending().await;
        debug!("Drain pass over {} operation(s)", snapshot.len());

        for queued in snapshot {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            if !self.connectivity.is_online() {
                debug!("Went offline, stopping drain pass");
                break;
            }

            let op = match self.queue.mark_in_flight(&queued.id).await {
                Ok(op) => op,
                Err(_) => continue,
            };
            let request = TransportRequest::from_operation(&op, self.idempotency_header.as_deref());

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                response = self.transport.execute(&request) => {
                    Some(response.and_then(TransportResponse::into_result))
                }
            };
            let Some(outcome) = outcome else {
                self.queue.release(&op.id).await;
                info!("Drain pass cancelled while sending {}", op.id);
                result.cancelled = true;
                break;
            };

            match outcome {
                Ok(_) => {
                    if let Err(e) = self.queue.record_success(&op.id).await {
                        self.queue.release(&op.id).await;
                        return Err(e);
                    }
                    result.succeeded.push(op.id);
                    self.invalidate_for(&op, &mut result).await;
                }
                Err(err) => match self.queue.record_failure(&op.id, &err).await {
                    Ok(FailureDisposition::Retrying { .. }) => result.retried.push(op.id),
                    Ok(FailureDisposition::DeadLettered { .. }) => result.failed.push(op.id),
                    Err(e) => {
                        self.queue.release(&op.id).await;
                        return Err(e);
                    }
                },
            }
        }

        result.remaining = self.queue.pending_count().await;
        result.duration = started.elapsed();
        Ok(result)
    }

    async fn invalidate_for(&self, op: &QueuedOperation, result: &mut SyncResult) {
        let mut keys = op.invalidates.clone();
        if let Some(map) = &self.invalidation {
            keys.extend(map.keys_for(op));
        }
        keys.dedup();

        for key in keys {
            match self.cache.invalidate(&key).await {
                Ok(()) => result.invalidated.push(key),
                Err(e) => warn!("Failed to invalidate cache entry {}: {}", key, e),
            }
        }
    }
}

enum CoordinatorRequest {
    /// Run a pass; the reply, if any, receives its result.
    SyncNow(Option<oneshot::Sender<Result<SyncResult>>>),
    /// New work was queued; run a pass unless a backoff retry is scheduled.
    Nudge,
}

type Waiter = oneshot::Sender<Result<SyncResult>>;

/// Handle to the background drain task.
pub struct SyncCoordinator {
    requests: mpsc::Sender<CoordinatorRequest>,
    state: watch::Receiver<CoordinatorState>,
    pass_cancel: Arc<Mutex<CancellationToken>>,
    shutdown: CancellationToken,
    handlers: Arc<RwLock<Vec<SyncCompleteHandler>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Spawn the drain task. Requires a tokio runtime.
    pub(crate) fn spawn(drainer: Drainer, backoff: BackoffConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Idle);
        let shutdown = CancellationToken::new();
        let pass_cancel = Arc::new(Mutex::new(shutdown.child_token()));
        let handlers: Arc<RwLock<Vec<SyncCompleteHandler>>> = Arc::default();

        let task = CoordinatorTask {
            connectivity_rx: drainer.connectivity.subscribe(),
            drainer,
            requests: requests_rx,
            state: state_tx,
            pass_cancel: pass_cancel.clone(),
            shutdown: shutdown.clone(),
            handlers: handlers.clone(),
            backoff,
        };
        let handle = tokio::spawn(task.run());

        Self {
            requests: requests_tx,
            state: state_rx,
            pass_cancel,
            shutdown,
            handlers,
            task: Mutex::new(Some(handle)),
        }
    }

    /// Run a drain pass and wait for its result.
    ///
    /// If a pass is already running, this waits for the follow-up pass that
    /// picks up every trigger received meanwhile.
    ///
    /// # Errors
    /// - `QueuePersistence` if the pass could not record an outcome
    /// - `Shutdown` if the coordinator stopped
    pub async fn sync_now(&self) -> Result<SyncResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(CoordinatorRequest::SyncNow(Some(reply_tx)))
            .await
            .map_err(|_| Error::Shutdown("Sync coordinator stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Shutdown("Sync coordinator stopped".to_string()))?
    }

    /// Ask for a pass to deliver newly queued work, without waiting.
    ///
    /// Ignored while a backoff retry is scheduled or the last pass left
    /// retryable failures behind; the scheduled pass picks the work up.
    pub fn nudge(&self) {
        if self.requests.try_send(CoordinatorRequest::Nudge).is_err() {
            debug!("Sync nudge dropped, coordinator busy or stopped");
        }
    }

    /// Register a handler called with the result of every pass.
    pub fn on_sync_complete<F>(&self, handler: F)
    where
        F: Fn(&SyncResult) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Receiver notified on every Idle/Draining change.
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    /// Stop the running pass, if any. The operation being sent stays pending
    /// with its attempt count unchanged.
    pub fn cancel_sync(&self) {
        self.pass_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Stop the drain task and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Sync coordinator task failed: {}", e);
            }
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct CoordinatorTask {
    drainer: Drainer,
    requests: mpsc::Receiver<CoordinatorRequest>,
    connectivity_rx: watch::Receiver<ConnectivityState>,
    state: watch::Sender<CoordinatorState>,
    pass_cancel: Arc<Mutex<CancellationToken>>,
    shutdown: CancellationToken,
    handlers: Arc<RwLock<Vec<SyncCompleteHandler>>>,
    backoff: BackoffConfig,
}

impl CoordinatorTask {
    async fn run(mut self) {
        let mut connectivity_open = true;
        let mut next_pass: Option<Instant> = None;
        let mut backoff_step: u32 = 0;

        info!("Sync coordinator started");

        loop {
            let mut waiters: Vec<Waiter> = Vec::new();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                request = self.requests.recv() => match request {
                    Some(CoordinatorRequest::SyncNow(reply)) => waiters.extend(reply),
                    Some(CoordinatorRequest::Nudge) => {
                        if next_pass.is_some() || !self.drainer.connectivity.is_online() {
                            debug!("Nudge ignored, waiting for scheduled pass");
                            continue;
                        }
                    }
                    None => break,
                },

                changed = self.connectivity_rx.changed(), if connectivity_open => {
                    if changed.is_err() {
                        connectivity_open = false;
                        continue;
                    }
                    let state = *self.connectivity_rx.borrow_and_update();
                    if !state.is_online() {
                        next_pass = None;
                        continue;
                    }
                    debug!("Back online, draining");
                    backoff_step = 0;
                }

                _ = wait_until(next_pass) => {
                    debug!("Backoff elapsed, draining");
                }
            }
            next_pass = None;

            let Some(outcome) = self.run_coalesced(waiters).await else {
                break;
            };

            match &outcome {
                Ok(result) if result.cancelled => {}
                Ok(result) if result.remaining == 0 => backoff_step = 0,
                _ if self.drainer.connectivity.is_online() => {
                    let delay = self.backoff.delay_for_pass(backoff_step);
                    backoff_step = backoff_step.saturating_add(1);
                    debug!("Scheduling next drain pass in {:?}", delay);
                    next_pass = Some(Instant::now() + delay);
                }
                _ => {}
            }
        }

        self.state.send_replace(CoordinatorState::Idle);
        info!("Sync coordinator stopped");
    }

    /// Run passes until no trigger arrived during the last one.
    ///
    /// Returns the last pass outcome, or `None` on shutdown.
    async fn run_coalesced(&mut self, mut waiters: Vec<Waiter>) -> Option<Result<SyncResult>> {
        loop {
            let outcome = self.run_pass().await;
            answer(waiters, &outcome);

            if self.shutdown.is_cancelled() {
                return None;
            }

            let mut follow_up = false;
            let mut nudged = false;
            waiters = Vec::new();
            while let Ok(request) = self.requests.try_recv() {
                match request {
                    CoordinatorRequest::SyncNow(reply) => {
                        follow_up = true;
                        waiters.extend(reply);
                    }
                    CoordinatorRequest::Nudge => nudged = true,
                }
            }
            if nudged {
                // Retryable leftovers mean the backend is struggling; leave
                // new work to the backoff pass.
                follow_up |= matches!(&outcome, Ok(r) if !r.cancelled && r.retried.is_empty());
            }
            if self.connectivity_rx.has_changed().unwrap_or(false) {
                follow_up |= self.connectivity_rx.borrow_and_update().is_online();
            }

            if !follow_up {
                return Some(outcome);
            }
            debug!("Triggers arrived during the pass, running follow-up");
        }
    }

    async fn run_pass(&self) -> Result<SyncResult> {
        let cancel = self.shutdown.child_token();
        *self.pass_cancel.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();

        self.state.send_replace(CoordinatorState::Draining);
        let outcome = self.drainer.drain_pass(&cancel).await;
        self.state.send_replace(CoordinatorState::Idle);

        match &outcome {
            Ok(result) => {
                info!(
                    "Drain pass finished: {} succeeded, {} failed, {} remaining",
                    result.succeeded.len(),
                    result.failed.len(),
                    result.remaining
                );
                let handlers = self
                    .handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for handler in handlers {
                    let result = result.clone();
                    // A panicking handler must not take the drain task down.
                    if let Err(e) = tokio::spawn(async move { handler(&result) }).await {
                        error!("Sync complete handler failed: {}", e);
                    }
                }
            }
            Err(e) => error!("Drain pass aborted: {}", e),
        }
        outcome
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn answer(waiters: Vec<Waiter>, outcome: &Result<SyncResult>) {
    for waiter in waiters {
        let reply = match outcome {
            Ok(result) => Ok(result.clone()),
            Err(Error::QueuePersistence(msg)) => Err(Error::QueuePersistence(msg.clone())),
            Err(e) => Err(Error::QueuePersistence(e.to_string())),
        };
        let _ = waiter.send(reply);
    }
}
