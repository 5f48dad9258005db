//! # Target Connections
//!
//! One `TargetConnection` per `(tenant, target url)`, owned by the tenant
//! actor. The actual socket lives in a task started by a `Connector`; the
//! two sides talk through channels:
//!
//! ```text
//!  tenant actor --BackendRequest--> link task --ws--> backend
//!  tenant actor <--TargetEvent----- link task <-ws--- backend
//! ```
//!
//! ## States
//!
//! `Connecting -> Open -> Closed`. Subscribes issued while connecting are
//! buffered and flushed in order on open. Closing cancels the link task and
//! discards every mapping; the subscriber side is replayed on the next
//! connection.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::protocol::{BackendMessage, BackendRequest};

/// What happened on a link.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetEventKind {
    /// The backend connection is established.
    Opened,
    /// A backend message arrived.
    Message(BackendMessage),
    /// The connection ended (error, remote close or cancellation).
    Closed,
}

/// A link event tagged with the connection generation it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetEvent {
    /// Target base URL.
    pub url: String,
    /// Generation of the connection that produced the event.
    pub generation: u64,
    /// Payload.
    pub kind: TargetEventKind,
}

/// Handle on a running link task. Dropping it cancels the task.
pub struct TargetLink {
    outbox: mpsc::UnboundedSender<BackendRequest>,
    cancel: CancellationToken,
}

impl TargetLink {
    /// Wraps the request sender and cancellation token of a link task.
    pub fn new(outbox: mpsc::UnboundedSender<BackendRequest>, cancel: CancellationToken) -> Self {
        Self { outbox, cancel }
    }

    fn send(&self, request: BackendRequest) {
        // A dead link reports Closed on its own.
        let _ = self.outbox.send(request);
    }
}

impl Drop for TargetLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens backend event links.
pub trait Connector: Send + Sync {
    /// Starts a link task for `url`. The task reports through `events`,
    /// tagging everything with `generation`, and ends with `Closed`.
    fn open(&self, url: &str, generation: u64, events: mpsc::UnboundedSender<TargetEvent>) -> TargetLink;
}

/// A subscribe awaiting its backend acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    /// Subscription the ack will belong to.
    pub internal_id: Uuid,
    /// Bare topic that was sent.
    pub topic: String,
}

/// # Ack Queue
///
/// The backend acknowledges subscribes in exactly the order it received
/// them and does not echo any request id. Correlation is therefore purely
/// positional: every subscribe sent pushes one entry, every
/// `subscribe-ack` pops the head.
///
/// Entries are never removed out of order. If a subscription goes away
/// while its ack is outstanding, its entry stays queued and the ack is
/// answered with an unsubscribe when it arrives.
#[derive(Debug, Default)]
pub struct AckQueue {
    queue: VecDeque<PendingAck>,
}

impl AckQueue {
    /// Records a subscribe that was just sent.
    pub fn push(&mut self, internal_id: Uuid, topic: &str) {
        self.queue.push_back(PendingAck {
            internal_id,
            topic: topic.to_string(),
        });
    }

    /// Pops the entry answered by the next ack.
    pub fn pop(&mut self) -> Option<PendingAck> {
        self.queue.pop_front()
    }

    /// Pops the head only if it was sent for `topic`.
    pub fn pop_if_topic(&mut self, topic: &str) -> Option<PendingAck> {
        if self.queue.front().is_some_and(|head| head.topic == topic) {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Outstanding acks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Link task started, backend not yet reachable.
    Connecting,
    /// Requests flow.
    Open,
    /// Terminal.
    Closed,
}

/// # Target Connection
pub struct TargetConnection {
    url: String,
    generation: u64,
    state: ConnectionState,
    buffered: Vec<PendingAck>,
    acks: AckQueue,
    backend_ids: HashMap<Uuid, Value>,
    link: Option<TargetLink>,
}

impl TargetConnection {
    /// Starts connecting to `url`. `replay` becomes the initial buffer.
    pub fn open(
        url: &str,
        generation: u64,
        replay: Vec<PendingAck>,
        connector: &dyn Connector,
        events: mpsc::UnboundedSender<TargetEvent>,
    ) -> Self {
        let link = connector.open(url, generation, events);
        Self {
            url: url.to_string(),
            generation,
            state: ConnectionState::Connecting,
            buffered: replay,
            acks: AckQueue::default(),
            backend_ids: HashMap::new(),
            link: Some(link),
        }
    }

    /// Target base URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Generation this connection accepts events from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Subscribes buffered while connecting.
    pub fn buffered(&self) -> &[PendingAck] {
        &self.buffered
    }

    /// Outstanding acknowledgments.
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Backend id bound to `internal_id`, if acknowledged.
    pub fn backend_id(&self, internal_id: Uuid) -> Option<&Value> {
        self.backend_ids.get(&internal_id)
    }

    fn send(&self, request: BackendRequest) {
        if let Some(link) = &self.link {
            link.send(request);
        }
    }

    /// Relays a subscribe (buffered while connecting).
    pub fn subscribe(&mut self, internal_id: Uuid, topic: &str) {
        match self.state {
            ConnectionState::Connecting => self.buffered.push(PendingAck {
                internal_id,
                topic: topic.to_string(),
            }),
            ConnectionState::Open => {
                self.send(BackendRequest::Subscribe {
                    topic: topic.to_string(),
                });
                self.acks.push(internal_id, topic);
            }
            ConnectionState::Closed => {}
        }
    }

    /// Relays an unsubscribe. Without a backend id this is a no-op, except
    /// that a still-buffered subscribe is dropped.
    pub fn unsubscribe(&mut self, internal_id: Uuid) {
        match self.state {
            ConnectionState::Connecting => self.buffered.retain(|p| p.internal_id != internal_id),
            ConnectionState::Open => {
                if let Some(subscription_id) = self.backend_ids.remove(&internal_id) {
                    self.send(BackendRequest::Unsubscribe { subscription_id });
                }
            }
            ConnectionState::Closed => {}
        }
    }

    /// Connecting -> Open; flushes the buffer in order.
    pub fn on_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.state = ConnectionState::Open;
        for pending in std::mem::take(&mut self.buffered) {
            self.subscribe(pending.internal_id, &pending.topic);
        }
    }

    /// Correlates a `subscribe-ack`. `still_wanted` tells whether the
    /// subscription at the queue head still exists; if not, the backend
    /// subscription is released right away. Returns the popped entry.
    pub fn on_subscribe_ack(
        &mut self,
        backend_id: Value,
        still_wanted: impl FnOnce(Uuid) -> bool,
    ) -> Option<PendingAck> {
        let Some(head) = self.acks.pop() else {
            log::warn!("Unexpected subscribe-ack {} from {}", backend_id, self.url);
            return None;
        };
        if still_wanted(head.internal_id) {
            self.backend_ids.insert(head.internal_id, backend_id);
        } else {
            log::debug!("Releasing orphaned backend subscription {} on {}", backend_id, self.url);
            self.send(BackendRequest::Unsubscribe {
                subscription_id: backend_id,
            });
        }
        Some(head)
    }

    /// A backend error for `topic` that matches the queue head rejects that
    /// subscribe; returns the rejected entry.
    pub fn on_error(&mut self, topic: Option<&str>) -> Option<PendingAck> {
        topic.and_then(|t| self.acks.pop_if_topic(t))
    }

    /// Enters Closed: cancels the link and discards every mapping.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.link = None;
        self.buffered.clear();
        self.acks.clear();
        self.backend_ids.clear();
    }
}

impl Drop for TargetConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Connector that records requests instead of opening sockets.
    #[derive(Default)]
    struct RecordingConnector {
        requests: Arc<Mutex<Vec<mpsc::UnboundedReceiver<BackendRequest>>>>,
        tokens: Arc<Mutex<Vec<CancellationToken>>>,
    }

    impl Connector for RecordingConnector {
        fn open(&self, _url: &str, _generation: u64, _events: mpsc::UnboundedSender<TargetEvent>) -> TargetLink {
            let (tx, rx) = mpsc::unbounded_channel();
            let token = CancellationToken::new();
            self.requests.lock().unwrap().push(rx);
            self.tokens.lock().unwrap().push(token.clone());
            TargetLink::new(tx, token)
        }
    }

    fn drain(connector: &RecordingConnector) -> Vec<BackendRequest> {
        let mut requests = connector.requests.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(r) = requests[0].try_recv() {
            out.push(r);
        }
        out
    }

    fn open(connector: &RecordingConnector, replay: Vec<PendingAck>) -> TargetConnection {
        let (events, _rx) = mpsc::unbounded_channel();
        TargetConnection::open("http://w1", 1, replay, connector, events)
    }

    #[test]
    fn test_buffer_flushes_in_order_on_open() {
        let connector = RecordingConnector::default();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut conn = open(
            &connector,
            vec![PendingAck { internal_id: a, topic: "h/a/*/s".to_string() }],
        );
        conn.subscribe(b, "h/b/*/s");
        conn.subscribe(c, "h/c/*/s");
        conn.unsubscribe(b);
        assert!(drain(&connector).is_empty());

        conn.on_open();

        assert_eq!(
            drain(&connector),
            vec![
                BackendRequest::Subscribe { topic: "h/a/*/s".to_string() },
                BackendRequest::Subscribe { topic: "h/c/*/s".to_string() },
            ]
        );
        assert_eq!(conn.pending_acks(), 2);
    }

    #[test]
    fn test_acks_bind_in_fifo_order() {
        let connector = RecordingConnector::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut conn = open(&connector, vec![]);
        conn.on_open();
        conn.subscribe(a, "h/a/*/s");
        conn.subscribe(b, "h/b/*/s");

        conn.on_subscribe_ack(json!(10), |_| true);
        conn.on_subscribe_ack(json!(11), |_| true);

        assert_eq!(conn.backend_id(a), Some(&json!(10)));
        assert_eq!(conn.backend_id(b), Some(&json!(11)));
    }

    #[test]
    fn test_unsubscribe_without_mapping_is_noop() {
        let connector = RecordingConnector::default();
        let a = Uuid::new_v4();
        let mut conn = open(&connector, vec![]);
        conn.on_open();
        conn.subscribe(a, "h/a/*/s");
        drain(&connector);

        conn.unsubscribe(a);
        assert!(drain(&connector).is_empty());

        // The late ack for the removed subscription is released immediately.
        conn.on_subscribe_ack(json!("x"), |_| false);
        assert_eq!(
            drain(&connector),
            vec![BackendRequest::Unsubscribe { subscription_id: json!("x") }]
        );
        assert_eq!(conn.backend_id(a), None);
    }

    #[test]
    fn test_error_pops_only_matching_head() {
        let connector = RecordingConnector::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut conn = open(&connector, vec![]);
        conn.on_open();
        conn.subscribe(a, "h/a/*/s");
        conn.subscribe(b, "h/b/*/s");

        assert_eq!(conn.on_error(Some("h/b/*/s")), None);
        assert_eq!(conn.on_error(None), None);
        assert_eq!(conn.on_error(Some("h/a/*/s")).map(|p| p.internal_id), Some(a));

        conn.on_subscribe_ack(json!(5), |_| true);
        assert_eq!(conn.backend_id(b), Some(&json!(5)));
    }

    #[test]
    fn test_close_cancels_link_and_clears() {
        let connector = RecordingConnector::default();
        let a = Uuid::new_v4();
        let mut conn = open(&connector, vec![]);
        conn.on_open();
        conn.subscribe(a, "h/a/*/s");
        conn.on_subscribe_ack(json!(1), |_| true);

        conn.close();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(connector.tokens.lock().unwrap()[0].is_cancelled());
        assert_eq!(conn.backend_id(a), None);
        assert_eq!(conn.pending_acks(), 0);
    }
}
