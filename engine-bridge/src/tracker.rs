//! Request/response correlation by message id.
//!
//! Each outgoing command gets a [`PendingRequest`] and a deadline in a
//! [`DelayQueue`]. Inbound messages resolve the matching entry; anything
//! unmatched is handed back for subscriber fan-out.

use std::collections::HashMap;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::bridge::protocol::Message;
use crate::error::BridgeError;

pub type ResponseResult = Result<Message, BridgeError>;

/// Longest deadline the timer wheel accepts with room to spare.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub struct PendingRequest {
    pub id: String,
    pub sent_at: Instant,
    pub timeout: Duration,
    reply: oneshot::Sender<ResponseResult>,
    deadline: delay_queue::Key,
}

impl PendingRequest {
    fn complete(self, result: ResponseResult) {
        if self.reply.send(result).is_err() {
            tracing::debug!(id = %self.id, "Caller stopped waiting before completion");
        }
    }
}

pub struct RequestTracker {
    pending: HashMap<String, PendingRequest>,
    deadlines: DelayQueue<String>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            deadlines: DelayQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Start tracking `id`. A duplicate id is rejected on `reply` immediately.
    ///
    /// Timeouts above [`MAX_REQUEST_TIMEOUT`] are clamped to it.
    pub fn register(
        &mut self,
        id: String,
        timeout: Duration,
        reply: oneshot::Sender<ResponseResult>,
    ) -> bool {
        if self.pending.contains_key(&id) {
            tracing::warn!(%id, "Rejecting request with duplicate id");
            let _ = reply.send(Err(BridgeError::DuplicateRequest(id)));
            return false;
        }

        let timeout = timeout.min(MAX_REQUEST_TIMEOUT);
        let deadline = self.deadlines.insert(id.clone(), timeout);
        tracing::trace!(%id, timeout_ms = timeout.as_millis() as u64, "Registered pending request");
        self.pending.insert(
            id.clone(),
            PendingRequest {
                id,
                sent_at: Instant::now(),
                timeout,
                reply,
                deadline,
            },
        );
        true
    }

    /// Resolve the request `message` answers.
    ///
    /// Returns the message back when nothing is waiting for it: no id, a
    /// progress broadcast, or an id that is unknown (never sent, timed out,
    /// cancelled).
    pub fn route(&mut self, message: Message) -> Option<Message> {
        if message.kind.is_broadcast() {
            return Some(message);
        }
        let Some(entry) = message.id().and_then(|id| self.pending.remove(id)) else {
            return Some(message);
        };
        self.deadlines.remove(&entry.deadline);

        let elapsed_ms = entry.sent_at.elapsed().as_millis() as u64;
        if message.is_error() {
            tracing::debug!(id = %entry.id, elapsed_ms, "Engine answered with error");
            let err = BridgeError::EngineError {
                id: entry.id.clone(),
                code: message.error_code(),
                message: message.error_message(),
            };
            entry.complete(Err(err));
        } else {
            tracing::debug!(id = %entry.id, kind = %message.kind, elapsed_ms, "Request resolved");
            entry.complete(Ok(message));
        }
        None
    }

    /// Reject the next request whose deadline passed, returning its id.
    pub fn poll_expire(&mut self, cx: &mut Context<'_>) -> Poll<Option<String>> {
        match self.deadlines.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let id = expired.into_inner();
                if let Some(entry) = self.pending.remove(&id) {
                    tracing::warn!(%id, timeout_ms = entry.timeout.as_millis() as u64, "Request timed out");
                    let err = BridgeError::EngineTimeout {
                        id: id.clone(),
                        timeout: entry.timeout,
                    };
                    entry.complete(Err(err));
                }
                Poll::Ready(Some(id))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Stop tracking `id` without touching the engine.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some(entry) => {
                self.deadlines.remove(&entry.deadline);
                tracing::debug!(%id, "Request cancelled by caller");
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding request, e.g. when the process goes away.
    pub fn fail_all(&mut self, make_err: impl Fn(String) -> BridgeError) -> usize {
        let count = self.pending.len();
        self.deadlines.clear();
        for (id, entry) in self.pending.drain() {
            entry.complete(Err(make_err(id)));
        }
        count
    }
}
