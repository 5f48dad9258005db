//! # Subscriptions
//!
//! A `SubscriberConnection` is the single source of truth for what a client
//! wants. Target connections only ever reference subscriptions through their
//! `internal_id`; after a backend reconnect the subscriber side is replayed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::protocol::{ClientFormat, ClientMessage};
use crate::core::predicate::Predicate;
use crate::core::topic::TopicPattern;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-wide subscriber connection id.
pub fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Result of offering an event to one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Offer {
    /// Topic or predicate did not match.
    Skip,
    /// Deliver this payload.
    Deliver(Value),
    /// The limit is now exceeded; the subscription must be removed.
    Exhausted,
}

/// One client subscription.
pub struct Subscription {
    /// Connection-scoped id shown to the client.
    pub id: u64,
    /// Globally unique id used to correlate backend acks.
    pub internal_id: Uuid,
    /// Parsed topic pattern.
    pub pattern: TopicPattern,
    /// Delivery cap.
    pub limit: Option<u64>,
    /// Deliveries counted so far.
    pub delivered_count: u64,
    predicate: Option<Predicate>,
}

impl Subscription {
    /// Creates a subscription with a fresh internal id.
    pub fn new(id: u64, pattern: TopicPattern, limit: Option<u64>, predicate: Option<Predicate>) -> Self {
        Self {
            id,
            internal_id: Uuid::new_v4(),
            pattern,
            limit,
            delivered_count: 0,
            predicate,
        }
    }

    /// Runs topic match, predicate and limit accounting for one event.
    pub fn offer(&mut self, topic: &str, data: &Value) -> Offer {
        if !self.pattern.matches(topic) {
            return Offer::Skip;
        }
        let payload = match &self.predicate {
            Some(predicate) => match predicate(data) {
                Some(payload) => payload,
                None => return Offer::Skip,
            },
            None => data.clone(),
        };

        self.delivered_count += 1;
        match self.limit {
            Some(limit) if self.delivered_count > limit => Offer::Exhausted,
            _ => Offer::Deliver(payload),
        }
    }
}

/// # Subscriber Connection
///
/// Ordered subscriptions of one frontend socket plus its outbound queue.
pub struct SubscriberConnection {
    /// Process-wide connection id.
    pub client_id: u64,
    /// Event rendering.
    pub format: ClientFormat,
    next_subscription_id: u64,
    subscriptions: Vec<Subscription>,
    outbox: mpsc::UnboundedSender<ClientMessage>,
}

impl SubscriberConnection {
    /// Creates a connection writing to `outbox`.
    pub fn new(client_id: u64, format: ClientFormat, outbox: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self {
            client_id,
            format,
            next_subscription_id: 1,
            subscriptions: Vec::new(),
            outbox,
        }
    }

    /// Queues a message for the client. A closed socket is ignored; the
    /// disconnect command follows.
    pub fn send(&self, message: ClientMessage) {
        let _ = self.outbox.send(message);
    }

    /// Appends a subscription under the next visible id.
    pub fn add(&mut self, pattern: TopicPattern, limit: Option<u64>, predicate: Option<Predicate>) -> &Subscription {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.subscriptions.push(Subscription::new(id, pattern, limit, predicate));
        &self.subscriptions[self.subscriptions.len() - 1]
    }

    /// Removes by visible id.
    pub fn remove(&mut self, id: u64) -> Option<Subscription> {
        let position = self.subscriptions.iter().position(|s| s.id == id)?;
        Some(self.subscriptions.remove(position))
    }

    /// Looks up by internal id.
    pub fn find_internal(&self, internal_id: Uuid) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.internal_id == internal_id)
    }

    /// Subscriptions in creation order.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Offers an event to every subscription; returns the internal ids of
    /// subscriptions removed because their limit was exceeded.
    pub fn fan_out(&mut self, topic: &str, timestamp: &Value, data: &Value) -> Vec<Uuid> {
        let mut exhausted = Vec::new();
        let format = self.format;
        for subscription in &mut self.subscriptions {
            match subscription.offer(topic, data) {
                Offer::Skip => {}
                Offer::Deliver(payload) => {
                    let _ = self.outbox.send(format.event(subscription.id, topic, timestamp, payload));
                }
                Offer::Exhausted => {
                    let _ = self.outbox.send(ClientMessage::UnsubscribeAck {
                        subscription_id: subscription.id,
                    });
                    exhausted.push(subscription.internal_id);
                }
            }
        }
        if !exhausted.is_empty() {
            self.subscriptions.retain(|s| !exhausted.contains(&s.internal_id));
        }
        exhausted
    }
}
