//! # Event Broker Module
//!
//! Bridges many backend event connections to many subscriber connections
//! per tenant.
//!
//! ## Components:
//!
//! - **`protocol`**: backend and subscriber wire messages, error codes and
//!   the two subscriber output formats.
//! - **`subscription`**: subscriber connections and their subscriptions
//!   (topic match, predicate, delivery limit).
//! - **`target`**: backend connection state machine, FIFO ack correlation
//!   and the `Connector` seam.
//! - **`connector`**: WebSocket `Connector` (feature `connector-ws`).
//! - **`tenant`**: the per-tenant actor that serializes all of the above.
//! - **`event_broker`**: tenant lifecycle, reconciliation and subscriber
//!   handles.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// WebSocket backend connector.
#[cfg(feature = "connector-ws")]
pub mod connector;
/// Tenant lifecycle and subscriber handles.
pub mod event_broker;
/// Wire messages.
pub mod protocol;
/// Subscriber-side state.
pub mod subscription;
/// Backend connection state machine.
pub mod target;
/// Per-tenant actor.
pub mod tenant;

// --- Public API Re-exports ---
#[cfg(feature = "connector-ws")]
pub use connector::WsConnector;
pub use event_broker::{EventBroker, SubscriberHandle};
pub use protocol::{
    BackendMessage, BackendRequest, ClientFormat, ClientMessage, ClientRequest, ErrorCode, ProtocolError,
};
pub use target::{Connector, TargetEvent, TargetEventKind, TargetLink};
