//! Write intents and their queued form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use ferry_common::types::base64_bytes;
use ferry_common::{Method, OperationId, Priority, Result};

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for a drain pass.
    Pending,
    /// Being sent by the current drain pass.
    InFlight,
    /// Accepted by the backend.
    Succeeded,
    /// Terminally failed; kept only as a dead letter.
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A write the caller wants applied to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDraft {
    pub method: Method,
    /// Resource path or URL.
    pub target: String,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: Priority,
    /// Overrides the engine's default retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Cache keys to invalidate once the write succeeds.
    #[serde(default)]
    pub invalidates: Vec<String>,
}

impl OperationDraft {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            body: Vec::new(),
            headers: BTreeMap::new(),
            priority: Priority::default(),
            max_retries: None,
            invalidates: Vec::new(),
        }
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::Post, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::Put, target)
    }

    pub fn patch(target: impl Into<String>) -> Self {
        Self::new(Method::Patch, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::Delete, target)
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize `value` as the body and set a JSON content type.
    pub fn with_json_body<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.body = serde_json::to_vec(value)?;
        self.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        Ok(self)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Invalidate `key` in the read-through cache after a successful drain.
    pub fn invalidates(mut self, key: impl Into<String>) -> Self {
        self.invalidates.push(key.into());
        self
    }
}

/// A durably recorded write intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub method: Method,
    pub target: String,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub priority: Priority,
    /// Attempts made so far.
    pub attempt: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    /// Enqueue order within the queue; breaks `created_at` ties.
    pub sequence: u64,
    pub status: OperationStatus,
    pub invalidates: Vec<String>,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    /// Build the pending form of `draft`.
    ///
    /// A retry budget of zero is raised to one so every operation is sent at
    /// least once.
    pub fn from_draft(draft: OperationDraft, default_max_retries: u32, sequence: u64) -> Self {
        Self {
            id: OperationId::new(),
            method: draft.method,
            target: draft.target,
            body: draft.body,
            headers: draft.headers,
            priority: draft.priority,
            attempt: 0,
            max_retries: draft.max_retries.unwrap_or(default_max_retries).max(1),
            created_at: Utc::now(),
            sequence,
            status: OperationStatus::Pending,
            invalidates: draft.invalidates,
            last_error: None,
        }
    }

    /// Drain order: priority first, then enqueue order.
    ///
    /// `sequence` rather than `created_at` decides ties so a wall clock
    /// stepping backwards cannot reorder equal-priority operations.
    pub fn sort_key(&self) -> (Priority, u64) {
        (self.priority, self.sequence)
    }

    /// Whether the operation is still part of the active queue.
    pub fn is_active(&self) -> bool {
        matches!(self.status, OperationStatus::Pending | OperationStatus::InFlight)
    }

    /// Whether another retryable failure would still leave budget for a
    /// later attempt.
    pub fn has_retry_budget(&self) -> bool {
        self.attempt + 1 < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_builder() {
        let draft = OperationDraft::patch("/patients/42")
            .with_body(r#"{"allergies":[]}"#)
            .with_header("X-Org", "clinic-7")
            .with_priority(Priority::High)
            .with_max_retries(5)
            .invalidates("patient:42");

        assert_eq!(draft.method, Method::Patch);
        assert_eq!(draft.headers.get("X-Org").map(String::as_str), Some("clinic-7"));
        assert_eq!(draft.invalidates, vec!["patient:42"]);
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let draft = OperationDraft::post("/notes")
            .with_json_body(&serde_json::json!({ "text": "follow up" }))
            .unwrap();

        assert_eq!(
            draft.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(draft.body, br#"{"text":"follow up"}"#);
    }

    #[test]
    fn test_from_draft_defaults() {
        let op = QueuedOperation::from_draft(OperationDraft::delete("/tags/9"), 3, 7);

        assert_eq!(op.attempt, 0);
        assert_eq!(op.max_retries, 3);
        assert_eq!(op.sequence, 7);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.priority, Priority::Medium);
        assert!(op.is_active());
    }

    #[test]
    fn test_sort_key_ignores_clock_skew() {
        let earlier = QueuedOperation::from_draft(OperationDraft::post("/a"), 3, 1);
        let mut later = QueuedOperation::from_draft(OperationDraft::post("/b"), 3, 2);
        later.created_at = earlier.created_at - chrono::Duration::minutes(5);

        assert!(earlier.sort_key() < later.sort_key());

        let urgent = QueuedOperation::from_draft(OperationDraft::post("/c").with_priority(Priority::High), 3, 3);
        assert!(urgent.sort_key() < earlier.sort_key());
    }

    #[test]
    fn test_zero_budget_raised_to_one() {
        let op = QueuedOperation::from_draft(OperationDraft::put("/x").with_max_retries(0), 3, 0);
        assert_eq!(op.max_retries, 1);
        assert!(!op.has_retry_budget());
    }

    #[test]
    fn test_retry_budget() {
        let mut op = QueuedOperation::from_draft(OperationDraft::put("/x").with_max_retries(2), 3, 0);
        assert!(op.has_retry_budget());
        op.attempt = 1;
        assert!(!op.has_retry_budget());
    }

    #[test]
    fn test_draft_deserialize_minimal() {
        let draft: OperationDraft =
            serde_json::from_str(r#"{ "method": "POST", "target": "/visits" }"#).unwrap();
        assert_eq!(draft.method, Method::Post);
        assert!(draft.body.is_empty());
        assert_eq!(draft.priority, Priority::Medium);
    }
}
