//! Request/response correlation over a tool channel.
//!
//! A [`Protocol`] is owned by exactly one side of one channel. Every call it
//! issues settles exactly once: with the matching RESPONSE, with the matching
//! ERROR, with a timeout, or with a disposal error. Late or duplicate replies
//! find no pending entry and are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, ToolHostError};
use crate::message::{Message, MessageType};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingRequest {
    method: String,
    responder: oneshot::Sender<Result<Value>>,
}

#[derive(Debug)]
pub struct Protocol {
    pending: DashMap<String, PendingRequest>,
    timeout: Duration,
    disposed: AtomicBool,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest").field("method", &self.method).finish()
    }
}

/// Removes the pending entry when the awaiting future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingRequest>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Protocol {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a REQUEST and wait for its correlated reply.
    pub async fn send_request<F>(
        &self,
        tool_id: &str,
        method: &str,
        args: Vec<Value>,
        transmit: F,
    ) -> Result<Value>
    where
        F: FnOnce(Message) -> Result<()>,
    {
        self.send(MessageType::Request, tool_id, method, args, transmit).await
    }

    /// Send a call of any correlated kind (REQUEST, ACTIVATE, DEACTIVATE, API_CALL).
    ///
    /// `transmit` receives the fully built message; if it fails the call fails
    /// immediately and nothing stays pending.
    pub async fn send<F>(
        &self,
        kind: MessageType,
        tool_id: &str,
        method: &str,
        args: Vec<Value>,
        transmit: F,
    ) -> Result<Value>
    where
        F: FnOnce(Message) -> Result<()>,
    {
        if self.is_disposed() {
            return Err(ToolHostError::Disposed(method.to_string()));
        }

        let message = Message::call(kind, tool_id, method, args);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            message.id.clone(),
            PendingRequest { method: method.to_string(), responder: tx },
        );
        let _guard = PendingGuard { pending: &self.pending, id: message.id.clone() };

        // dispose() may have drained the map between the check and the insert
        if self.is_disposed() {
            return Err(ToolHostError::Disposed(method.to_string()));
        }

        debug!(tool_id, method, id = %message.id, kind = %kind, "sending request");
        transmit(message)?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ToolHostError::Disposed(method.to_string())),
            Err(_) => {
                warn!(tool_id, method, "request timed out after {:?}", self.timeout);
                Err(ToolHostError::Timeout(method.to_string()))
            }
        }
    }

    /// Settle the pending request matching `message.id`.
    ///
    /// Returns `false` when nothing was waiting (duplicate, post-timeout or
    /// foreign id); such replies are dropped.
    pub fn handle_response(&self, message: Message) -> bool {
        if !message.kind.is_reply() {
            warn!(id = %message.id, kind = %message.kind, "not a reply, ignoring");
            return false;
        }
        let Some((_, pending)) = self.pending.remove(&message.id) else {
            debug!(id = %message.id, "no pending request for reply, dropping");
            return false;
        };

        let outcome = match (message.kind, message.error) {
            (MessageType::Response, None) => Ok(message.result.unwrap_or(Value::Null)),
            (_, Some(error)) => Err(ToolHostError::Remote(error)),
            (_, None) => Err(ToolHostError::Remote(format!("{} failed", pending.method))),
        };
        // the caller may have given up in the meantime
        let _ = pending.responder.send(outcome);
        true
    }

    /// Reject every pending request and refuse new ones.
    /// Returns how many requests were rejected.
    pub fn dispose(&self) -> usize {
        self.disposed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending
                    .responder
                    .send(Err(ToolHostError::Disposed(pending.method.clone())));
                rejected += 1;
            }
        }
        rejected
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn spawn_call(
        protocol: Arc<Protocol>,
        method: &'static str,
    ) -> (tokio::task::JoinHandle<Result<Value>>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            protocol
                .send_request("t1", method, vec![json!(1)], |msg| {
                    tx.send(msg).map_err(|e| ToolHostError::ChannelClosed(e.to_string()))
                })
                .await
        });
        (handle, rx)
    }

    #[tokio::test]
    async fn response_resolves_matching_request() {
        let protocol = Arc::new(Protocol::default());
        let (handle, mut sent) = spawn_call(protocol.clone(), "echo");

        let request = sent.recv().await.unwrap();
        assert_eq!(request.kind, MessageType::Request);
        assert_eq!(request.method_name(), "echo");

        assert!(protocol.handle_response(Message::response(&request.id, "t1", json!("hello"))));
        assert_eq!(handle.await.unwrap().unwrap(), json!("hello"));
        assert_eq!(protocol.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_rejects_with_payload() {
        let protocol = Arc::new(Protocol::default());
        let (handle, mut sent) = spawn_call(protocol.clone(), "boom");
        let request = sent.recv().await.unwrap();

        protocol.handle_response(Message::error(&request.id, "t1", "it broke"));
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err, ToolHostError::Remote("it broke".into()));
    }

    #[tokio::test]
    async fn duplicate_reply_is_dropped() {
        let protocol = Arc::new(Protocol::default());
        let (handle, mut sent) = spawn_call(protocol.clone(), "echo");
        let request = sent.recv().await.unwrap();

        assert!(protocol.handle_response(Message::response(&request.id, "t1", json!(1))));
        assert!(!protocol.handle_response(Message::error(&request.id, "t1", "late")));
        assert_eq!(handle.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn responses_correlate_by_id_not_order() {
        let protocol = Arc::new(Protocol::default());
        let (first, mut sent_a) = spawn_call(protocol.clone(), "a");
        let (second, mut sent_b) = spawn_call(protocol.clone(), "b");
        let req_a = sent_a.recv().await.unwrap();
        let req_b = sent_b.recv().await.unwrap();

        protocol.handle_response(Message::response(&req_b.id, "t1", json!("b")));
        protocol.handle_response(Message::response(&req_a.id, "t1", json!("a")));

        assert_eq!(first.await.unwrap().unwrap(), json!("a"));
        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn timeout_rejects_only_that_caller() {
        let protocol = Arc::new(Protocol::new(Duration::from_millis(50)));
        let (slow, mut sent_slow) = spawn_call(protocol.clone(), "hang");
        let slow_req = sent_slow.recv().await.unwrap();

        let err = slow.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Request timeout for hang");
        assert_eq!(protocol.pending_count(), 0);

        // a late reply for the timed-out id is dropped
        assert!(!protocol.handle_response(Message::response(&slow_req.id, "t1", json!(null))));

        // and the protocol keeps working
        let (fast, mut sent_fast) = spawn_call(protocol.clone(), "echo");
        let req = sent_fast.recv().await.unwrap();
        protocol.handle_response(Message::response(&req.id, "t1", json!("ok")));
        assert_eq!(fast.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn dispose_rejects_all_pending_once() {
        let protocol = Arc::new(Protocol::default());
        let (a, mut sent_a) = spawn_call(protocol.clone(), "a");
        let (b, mut sent_b) = spawn_call(protocol.clone(), "b");
        let req_a = sent_a.recv().await.unwrap();
        sent_b.recv().await.unwrap();

        assert_eq!(protocol.dispose(), 2);
        assert!(matches!(a.await.unwrap(), Err(ToolHostError::Disposed(m)) if m == "a"));
        assert!(matches!(b.await.unwrap(), Err(ToolHostError::Disposed(m)) if m == "b"));

        assert!(!protocol.handle_response(Message::response(&req_a.id, "t1", json!(1))));
        assert_eq!(protocol.dispose(), 0);
    }

    #[tokio::test]
    async fn send_after_dispose_fails_fast() {
        let protocol = Protocol::default();
        protocol.dispose();
        let err = protocol
            .send_request("t1", "echo", vec![], |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolHostError::Disposed(_)));
    }

    #[tokio::test]
    async fn transmit_failure_leaves_nothing_pending() {
        let protocol = Protocol::default();
        let err = protocol
            .send_request("t1", "echo", vec![], |_| {
                Err(ToolHostError::ChannelClosed("gone".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolHostError::ChannelClosed(_)));
        assert_eq!(protocol.pending_count(), 0);
    }

    #[test]
    fn non_reply_is_ignored() {
        let protocol = Protocol::default();
        assert!(!protocol.handle_response(Message::ready("t1")));
    }
}
