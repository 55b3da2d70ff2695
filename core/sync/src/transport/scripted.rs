//! In-process transport that answers from a script.
//!
//! Used by tests and demos to drive the engine through failures, rejections
//! and slow responses without a network.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ferry_common::{Error, Result};

use super::{Transport, TransportRequest, TransportResponse};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Respond with this status and an empty body.
    Status(u16),
    /// Fail without a response.
    Transient(String),
    /// Respond with this exact response.
    Respond(TransportResponse),
}

#[derive(Default)]
struct Script {
    replies: HashMap<String, VecDeque<ScriptedReply>>,
    defaults: HashMap<String, ScriptedReply>,
    log: Vec<TransportRequest>,
}

/// Transport returning queued replies per target. Clones share the script.
///
/// Each request consumes the next reply queued for its target; when none is
/// left the target's default applies, and without a default the answer is
/// `200`.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    latency: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue `replies` for `target`, answered in order.
    pub fn push(&self, target: &str, replies: impl IntoIterator<Item = ScriptedReply>) {
        let mut script = self.lock();
        script
            .replies
            .entry(target.to_string())
            .or_default()
            .extend(replies);
    }

    /// Answer `target` with `reply` once its queued replies run out.
    pub fn set_default(&self, target: &str, reply: ScriptedReply) {
        self.lock().defaults.insert(target.to_string(), reply);
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.lock().log.clone()
    }

    /// Targets of every request received so far.
    pub fn targets(&self) -> Vec<String> {
        self.lock().log.iter().map(|r| r.target.clone()).collect()
    }

    pub fn request_count(&self) -> usize {
        self.lock().log.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_reply(&self, request: &TransportRequest) -> ScriptedReply {
        let mut script = self.lock();
        script.log.push(request.clone());
        if let Some(reply) = script
            .replies
            .get_mut(&request.target)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        script
            .defaults
            .get(&request.target)
            .cloned()
            .unwrap_or(ScriptedReply::Status(200))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse> {
        let reply = self.next_reply(request);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match reply {
            ScriptedReply::Status(status) => Ok(TransportResponse {
                status,
                headers: Default::default(),
                body: Bytes::new(),
            }),
            ScriptedReply::Transient(message) => Err(Error::TransientNetwork(message)),
            ScriptedReply::Respond(response) => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_common::Method;

    #[tokio::test]
    async fn test_replies_in_order_then_default() {
        let transport = ScriptedTransport::new();
        transport.push(
            "/a",
            [ScriptedReply::Transient("reset".to_string()), ScriptedReply::Status(503)],
        );
        transport.set_default("/a", ScriptedReply::Status(201));

        let request = TransportRequest::new(Method::Post, "/a");
        assert!(transport.execute(&request).await.is_err());
        assert_eq!(transport.execute(&request).await.unwrap().status, 503);
        assert_eq!(transport.execute(&request).await.unwrap().status, 201);
        assert_eq!(transport.execute(&request).await.unwrap().status, 201);
        assert_eq!(transport.request_count(), 4);
    }

    #[tokio::test]
    async fn test_unscripted_target_succeeds() {
        let transport = ScriptedTransport::new();
        let response = transport
            .execute(&TransportRequest::new(Method::Delete, "/x"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(transport.targets(), vec!["/x"]);
    }
}
