//! Transport abstraction used to deliver queued writes.

mod http;
mod scripted;

pub use http::HttpTransport;
pub use scripted::{ScriptedReply, ScriptedTransport};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

use ferry_common::{Error, Method, Result};

use crate::operation::QueuedOperation;

/// A request ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: Method,
    pub target: String,
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
}

impl TransportRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            body: Bytes::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Build the request replaying `op`.
    ///
    /// With `idempotency_header` set, the operation id is sent under that
    /// header so the backend can recognize a replay of the same write.
    pub fn from_operation(op: &QueuedOperation, idempotency_header: Option<&str>) -> Self {
        let mut headers = op.headers.clone();
        if let Some(name) = idempotency_header {
            headers.insert(name.to_string(), op.id.to_string());
        }
        Self {
            method: op.method,
            target: op.target.clone(),
            body: Bytes::copy_from_slice(&op.body),
            headers,
        }
    }
}

/// What the backend answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    /// Turn a non-2xx status into the matching error class.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let message = String::from_utf8_lossy(&self.body).trim().to_string();
        let message = if message.is_empty() {
            "no response body".to_string()
        } else {
            message
        };
        Err(Error::from_status(self.status, message))
    }
}

/// Sends requests to the backend.
///
/// Implementations return `Ok` for every response that arrived, whatever its
/// status, and `Err(TransientNetwork)` when no response arrived at all.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport name (e.g., "http", "scripted").
    fn name(&self) -> &str;

    /// Send one request and wait for the response.
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse>;
}
