//! # Wire Messages
//!
//! JSON shapes exchanged with backends and with subscribers. All messages are
//! objects tagged by `type`.
//!
//! Backend side:
//!
//! ```text
//! -> {"type":"subscribe","topic":"hub/led/*/state"}
//! <- {"type":"subscribe-ack","subscriptionId":17}
//! -> {"type":"unsubscribe","subscriptionId":17}
//! <- {"type":"unsubscribe-ack","subscriptionId":17}
//! <- {"type":"event","topic":"hub/led/1/state","timestamp":..,"data":{..}}
//! <- {"type":"error","code":"..","topic":"..","message":".."}
//! ```
//!
//! Subscriber side uses the same vocabulary with connection-scoped numeric
//! subscription ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::predicate::PredicateError;
use crate::core::topic::TopicError;

/// Requests sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BackendRequest {
    /// Subscribe to a bare topic pattern.
    Subscribe {
        /// Pattern without query suffix.
        topic: String,
    },
    /// Cancel a backend subscription.
    Unsubscribe {
        /// Id assigned by the backend in its ack.
        subscription_id: Value,
    },
}

/// Messages received from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BackendMessage {
    /// Acknowledges the oldest unacknowledged subscribe.
    SubscribeAck {
        /// Backend subscription id.
        subscription_id: Value,
    },
    /// Acknowledges an unsubscribe.
    UnsubscribeAck {
        /// Backend subscription id.
        subscription_id: Value,
    },
    /// A published event.
    Event {
        /// Concrete topic.
        topic: String,
        /// Publication time as sent by the backend.
        #[serde(default)]
        timestamp: Value,
        /// Payload.
        #[serde(default)]
        data: Value,
    },
    /// A backend-side failure, possibly tied to a subscribe.
    Error {
        /// Backend error code.
        code: String,
        /// Topic of the failed request, if any.
        #[serde(default)]
        topic: Option<String>,
        /// Human readable description.
        #[serde(default)]
        message: String,
    },
}

/// Requests sent by a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    /// Subscribe to `pattern[?query]`, optionally capped at `limit` deliveries.
    Subscribe {
        /// Topic pattern with optional query suffix.
        topic: String,
        /// Maximum number of deliveries.
        #[serde(default)]
        limit: Option<u64>,
    },
    /// Cancel one of this connection's subscriptions.
    Unsubscribe {
        /// Connection-scoped id from `subscribe-ack`.
        subscription_id: u64,
    },
}

/// Error codes reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Not a valid request document.
    MalformedMessage,
    /// Topic grammar violation.
    InvalidTopic,
    /// Query suffix failed to compile.
    InvalidQuery,
    /// Unsubscribe for an id this connection does not hold.
    UnknownSubscription,
    /// A backend refused the subscribe.
    SubscribeRejected,
}

/// Messages sent to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Subscription accepted.
    SubscribeAck {
        /// Assigned id.
        subscription_id: u64,
    },
    /// Subscription removed, on request or because its limit was reached.
    UnsubscribeAck {
        /// Removed id.
        subscription_id: u64,
    },
    /// A delivered event.
    Event {
        /// Matching subscription; omitted in the legacy format.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<u64>,
        /// Concrete topic.
        topic: String,
        /// Publication time.
        timestamp: Value,
        /// Payload, possibly reshaped by the subscription's predicate.
        data: Value,
    },
    /// A request failed; the connection stays open.
    Error {
        /// Machine readable code.
        code: ErrorCode,
        /// Topic involved, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        /// Subscription involved, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<u64>,
        /// Human readable description.
        message: String,
    },
}

impl ClientMessage {
    /// Serializes to the JSON text frame.
    pub fn to_text(&self) -> String {
        // Every variant is a plain map of strings, numbers and JSON values.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Event rendering variants negotiated per subscriber connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientFormat {
    /// Events carry the `subscriptionId` they were delivered under.
    #[default]
    Current,
    /// Events omit `subscriptionId`.
    Legacy,
}

impl ClientFormat {
    /// Builds an event message in this format.
    pub fn event(self, subscription_id: u64, topic: &str, timestamp: &Value, data: Value) -> ClientMessage {
        ClientMessage::Event {
            subscription_id: match self {
                ClientFormat::Current => Some(subscription_id),
                ClientFormat::Legacy => None,
            },
            topic: topic.to_string(),
            timestamp: timestamp.clone(),
            data,
        }
    }
}

/// Subscriber protocol failures, each mapped to an `ErrorCode`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not a valid request.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Topic grammar violation.
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    /// Query compilation failure.
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] PredicateError),

    /// Unknown subscription id.
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),

    /// Backend refused the subscribe.
    #[error("subscribe rejected by backend: {message}")]
    SubscribeRejected {
        /// Backend supplied reason.
        message: String,
    },
}

impl ProtocolError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Malformed(_) => ErrorCode::MalformedMessage,
            ProtocolError::InvalidTopic(_) => ErrorCode::InvalidTopic,
            ProtocolError::InvalidQuery(_) => ErrorCode::InvalidQuery,
            ProtocolError::UnknownSubscription(_) => ErrorCode::UnknownSubscription,
            ProtocolError::SubscribeRejected { .. } => ErrorCode::SubscribeRejected,
        }
    }

    /// Builds the error reply.
    pub fn to_message(&self, topic: Option<&str>, subscription_id: Option<u64>) -> ClientMessage {
        ClientMessage::Error {
            code: self.code(),
            topic: topic.map(str::to_string),
            subscription_id,
            message: self.to_string(),
        }
    }
}
