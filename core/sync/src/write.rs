//! Optimistic write options and outcomes.

use ferry_common::{Error, OperationId};

/// Hook run before a write is sent or queued.
pub type ApplyHook = Box<dyn FnOnce() + Send>;
/// Hook run when a write ends in an error and was not queued.
pub type RollbackHook = Box<dyn FnOnce(&Error) + Send>;

/// How a write should behave when it cannot be applied right away.
#[derive(Default)]
pub struct WriteOptions {
    /// Queue the write instead of failing when an online attempt fails with
    /// a retryable error.
    pub queue_on_failure: bool,
    pub(crate) on_optimistic_apply: Option<ApplyHook>,
    pub(crate) on_rollback: Option<RollbackHook>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_on_failure(mut self, queue: bool) -> Self {
        self.queue_on_failure = queue;
        self
    }

    /// Apply the write to local state before the outcome is known.
    pub fn on_optimistic_apply<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_optimistic_apply = Some(Box::new(hook));
        self
    }

    /// Undo the optimistic apply if the write fails without being queued.
    pub fn on_rollback<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Error) + Send + 'static,
    {
        self.on_rollback = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for WriteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOptions")
            .field("queue_on_failure", &self.queue_on_failure)
            .field("on_optimistic_apply", &self.on_optimistic_apply.is_some())
            .field("on_rollback", &self.on_rollback.is_some())
            .finish()
    }
}

/// Result of a write that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<T> {
    /// The backend accepted the write directly.
    Applied(T),
    /// The write is durably queued and will be sent by a later drain pass.
    Queued(OperationId),
}

impl<T> WriteOutcome<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }

    /// The direct result, if the write was applied.
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Queued(_) => None,
        }
    }

    pub fn queued_id(&self) -> Option<OperationId> {
        match self {
            Self::Applied(_) => None,
            Self::Queued(id) => Some(*id),
        }
    }
}
