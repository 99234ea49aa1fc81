//! Per-invocation JSON-RPC request/response correlator.
//!
//! A session-oriented, bidirectional protocol server produces responses
//! asynchronously by calling `send`. In a stateless HTTP deployment every
//! invocation delivers one batch of messages and must block until the
//! responses for that batch exist. `SessionTransport` bridges the two: it
//! registers a pending slot per request id, dispatches every message to the
//! protocol server, and awaits the slots in original batch order.
//!
//! The pending table is owned exclusively by one transport instance and is
//! replaced wholesale at the start of each `handle_messages` call. Entries
//! from a previous batch become unreachable rather than resolved; there is
//! no cross-invocation correlation state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::GatewayError;
use crate::transport::jsonrpc::{JsonRpcId, JsonRpcMessage};

/// Dispatch callback supplied by the protocol server.
///
/// Invoked once per inbound message, regardless of message type. The server
/// answers requests by calling `send` on the [`ResponseSender`] it was
/// handed, synchronously or from a spawned task.
pub type MessageCallback = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;

/// Table of unresolved request ids for the current batch.
type PendingTable = HashMap<JsonRpcId, oneshot::Sender<JsonRpcMessage>>;

/// Result of driving one batch through the transport.
#[derive(Debug, PartialEq)]
pub enum BatchOutcome {
    /// The batch carried no requests (notifications/responses only).
    Empty,
    /// Exactly one request: its correlated response.
    Single(JsonRpcMessage),
    /// Multiple requests: responses ordered by original batch position.
    Batch(Vec<JsonRpcMessage>),
}

/// Cheap cloneable handle for resolving pending requests.
///
/// Protocol servers hold one of these to deliver responses; clones share the
/// transport's pending table, so a response produced from a spawned task
/// still resolves the awaiting batch.
#[derive(Clone)]
pub struct ResponseSender {
    pending: Arc<Mutex<PendingTable>>,
}

impl ResponseSender {
    /// Deliver a message toward the awaiting batch.
    ///
    /// If the message's `id` matches a pending request, that request
    /// resolves with the message. Anything else (notification, unmatched
    /// id, no id) is a silent no-op, never an error.
    pub fn send(&self, message: JsonRpcMessage) {
        let Some(id) = message.id() else {
            trace!("discarding outbound message without id");
            return;
        };
        let sender = self.pending.lock().remove(&id);
        match sender {
            Some(tx) => {
                // Receiver may already be gone if the invocation was dropped.
                let _ = tx.send(message);
            }
            None => trace!(?id, "no pending request for outbound message"),
        }
    }
}

/// Per-invocation transport state.
enum TransportState {
    Idle,
    Started,
}

/// Correlates a batch of JSON-RPC messages with asynchronously produced
/// responses, within a single HTTP invocation.
pub struct SessionTransport {
    state: Mutex<TransportState>,
    pending: Arc<Mutex<PendingTable>>,
    on_message: Mutex<Option<MessageCallback>>,
}

impl Default for SessionTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTransport {
    /// Create an idle transport with an empty pending table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Idle),
            pending: Arc::new(Mutex::new(HashMap::new())),
            on_message: Mutex::new(None),
        }
    }

    /// Register the protocol server's dispatch callback.
    pub fn set_on_message(&self, callback: MessageCallback) {
        *self.on_message.lock() = Some(callback);
    }

    /// Handle for resolving pending requests from outside the transport.
    pub fn sender(&self) -> ResponseSender {
        ResponseSender {
            pending: Arc::clone(&self.pending),
        }
    }

    /// Transition idle → started.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::AlreadyStarted` if called while started.
    pub fn start(&self) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        match *state {
            TransportState::Started => Err(GatewayError::AlreadyStarted),
            TransportState::Idle => {
                *state = TransportState::Started;
                Ok(())
            }
        }
    }

    /// Close the transport. Idempotent from any state, never fails.
    pub fn close(&self) {
        *self.state.lock() = TransportState::Idle;
    }

    /// Deliver a message toward the awaiting batch. See [`ResponseSender::send`].
    pub fn send(&self, message: JsonRpcMessage) {
        self.sender().send(message)
    }

    /// Drive one batch of messages through the protocol server and collect
    /// the correlated responses.
    ///
    /// The pending table is replaced with a fresh one, opening a new
    /// correlation scope. For each message in order: requests get a pending
    /// slot registered under their id *before* dispatch (a synchronous
    /// response must be able to resolve it), then the message is dispatched
    /// to the callback regardless of type. Responses come back ordered by
    /// original request position, not resolution order.
    ///
    /// A duplicate id within one batch overwrites the earlier pending slot;
    /// the earlier request is silently starved and this call then never
    /// completes, bounded only by the enclosing invocation's own timeout.
    /// Known hazard, kept as-is.
    ///
    /// There is no per-request timeout or cancellation at this layer.
    pub async fn handle_messages(
        &self,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<BatchOutcome, GatewayError> {
        *self.pending.lock() = HashMap::new();

        let callback = self.on_message.lock().clone();
        let mut receivers: Vec<oneshot::Receiver<JsonRpcMessage>> = Vec::new();

        for message in messages {
            if message.is_request() {
                if let Some(id) = message.id() {
                    let (tx, rx) = oneshot::channel();
                    self.pending.lock().insert(id, tx);
                    receivers.push(rx);
                }
            }
            if let Some(callback) = &callback {
                callback(message);
            }
        }

        debug!(requests = receivers.len(), "awaiting batch responses");

        if receivers.is_empty() {
            return Ok(BatchOutcome::Empty);
        }
        if receivers.len() == 1 {
            let rx = receivers.remove(0);
            return Ok(BatchOutcome::Single(Self::await_response(rx).await));
        }

        // Sequential awaits preserve registration order, which is the
        // original request order. Completion requires every slot to resolve,
        // so arrival order does not matter.
        let mut responses = Vec::with_capacity(receivers.len());
        for rx in receivers {
            responses.push(Self::await_response(rx).await);
        }
        Ok(BatchOutcome::Batch(responses))
    }

    /// Await a single pending slot.
    ///
    /// A closed channel means the slot's sender was dropped without
    /// resolving, which only happens when a duplicate id overwrote it. The
    /// starved request must stay unresolved rather than surface an error,
    /// so this future then never completes.
    async fn await_response(rx: oneshot::Receiver<JsonRpcMessage>) -> JsonRpcMessage {
        match rx.await {
            Ok(message) => message,
            Err(_) => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn request(id: i64, method: &str) -> JsonRpcMessage {
        JsonRpcMessage::request(JsonRpcId::Number(id), method, None)
    }

    fn echo_callback(transport: &SessionTransport) -> MessageCallback {
        let sender = transport.sender();
        Arc::new(move |msg: JsonRpcMessage| {
            if let Some(id) = msg.id() {
                if msg.is_request() {
                    sender.send(JsonRpcMessage::response(
                        id,
                        json!({"echo": msg.method()}),
                    ));
                }
            }
        })
    }

    #[test]
    fn test_start_twice_fails() {
        let transport = SessionTransport::new();
        assert!(transport.start().is_ok());
        assert!(matches!(
            transport.start(),
            Err(GatewayError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let transport = SessionTransport::new();
        transport.close();
        transport.close();
        transport.start().unwrap();
        transport.close();
        transport.close();
        // Closed transport can be started again.
        assert!(transport.start().is_ok());
    }

    #[test]
    fn test_send_without_pending_is_noop() {
        let transport = SessionTransport::new();
        transport.send(JsonRpcMessage::response(JsonRpcId::Number(99), json!(null)));
        transport.send(JsonRpcMessage::notification("notify", None));
    }

    #[tokio::test]
    async fn test_single_request_resolves_matching_response() {
        let transport = SessionTransport::new();
        transport.set_on_message(echo_callback(&transport));
        transport.start().unwrap();

        let outcome = transport
            .handle_messages(vec![request(1, "ping")])
            .await
            .unwrap();

        match outcome {
            BatchOutcome::Single(response) => {
                assert_eq!(response.id(), Some(JsonRpcId::Number(1)));
                assert_eq!(response.as_value()["result"]["echo"], "ping");
            }
            other => panic!("expected single response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notification_only_batch_is_empty() {
        let transport = SessionTransport::new();
        let dispatched = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&dispatched);
        transport.set_on_message(Arc::new(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        transport.start().unwrap();

        let outcome = transport
            .handle_messages(vec![
                JsonRpcMessage::notification("a", None),
                JsonRpcMessage::notification("b", None),
            ])
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Empty);
        // Dispatch callback fires once per message regardless of type.
        assert_eq!(dispatched.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_ordered_by_request_position() {
        let transport = SessionTransport::new();
        let sender = transport.sender();
        // Respond to each request from a spawned task with inverted delays,
        // so resolution order is the reverse of request order.
        transport.set_on_message(Arc::new(move |msg: JsonRpcMessage| {
            if !msg.is_request() {
                return;
            }
            let Some(JsonRpcId::Number(n)) = msg.id() else {
                return;
            };
            let sender = sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30 - 10 * n as u64)).await;
                sender.send(JsonRpcMessage::response(
                    JsonRpcId::Number(n),
                    json!({"n": n}),
                ));
            });
        }));
        transport.start().unwrap();

        let outcome = transport
            .handle_messages(vec![request(1, "a"), request(2, "b"), request(3, "c")])
            .await
            .unwrap();

        match outcome {
            BatchOutcome::Batch(responses) => {
                assert_eq!(responses.len(), 3);
                let ids: Vec<_> = responses.iter().map(|r| r.id()).collect();
                assert_eq!(
                    ids,
                    vec![
                        Some(JsonRpcId::Number(1)),
                        Some(JsonRpcId::Number(2)),
                        Some(JsonRpcId::Number(3))
                    ]
                );
            }
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mixed_batch_awaits_only_requests() {
        let transport = SessionTransport::new();
        transport.set_on_message(echo_callback(&transport));
        transport.start().unwrap();

        let outcome = transport
            .handle_messages(vec![
                request(1, "a"),
                JsonRpcMessage::notification("notify", None),
                request(2, "b"),
            ])
            .await
            .unwrap();

        match outcome {
            BatchOutcome::Batch(responses) => assert_eq!(responses.len(), 2),
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_new_batch_orphans_previous_pending() {
        let transport = SessionTransport::new();
        // No callback: requests are never answered.
        transport.start().unwrap();

        let sender = transport.sender();
        let first = transport.handle_messages(vec![request(1, "a")]);
        tokio::pin!(first);

        // First batch is outstanding; give it a moment, it must not resolve.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut first)
                .await
                .is_err()
        );

        // Second batch replaces the pending table; resolving id 1 afterwards
        // cannot reach the orphaned first batch.
        transport.set_on_message(echo_callback(&transport));
        let outcome = transport
            .handle_messages(vec![request(2, "b")])
            .await
            .unwrap();
        assert!(matches!(outcome, BatchOutcome::Single(_)));

        sender.send(JsonRpcMessage::response(JsonRpcId::Number(1), json!(null)));
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut first)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_duplicate_id_starves_earlier_request() {
        let transport = SessionTransport::new();
        let sender = transport.sender();
        let responded = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count = Arc::clone(&responded);
        transport.set_on_message(Arc::new(move |msg: JsonRpcMessage| {
            // Answer only the second occurrence, identified by method "dup2".
            if msg.method() == Some("dup2") {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if let Some(id) = msg.id() {
                    sender.send(JsonRpcMessage::response(id, json!("second")));
                }
            }
        }));
        transport.start().unwrap();

        // Two requests share id 7. The second registration overwrites the
        // first slot, so one awaited slot can never resolve and the batch
        // hangs: the preserved starvation hazard.
        let batch = transport.handle_messages(vec![request(7, "dup1"), request(7, "dup2")]);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), batch)
                .await
                .is_err()
        );
        assert_eq!(responded.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_input_batch() {
        let transport = SessionTransport::new();
        transport.start().unwrap();
        let outcome = transport.handle_messages(vec![]).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Empty);
    }
}
