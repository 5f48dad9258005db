//! # lib_gateway
//!
//! Core of a multi-tenant gateway between edge hubs and a pool of backend
//! worker processes ("targets"):
//!
//! - **`core`**: target health, router cache, active target resolution and
//!   allocation.
//! - **`broker`**: the event broker multiplexing backend event streams to
//!   subscribers.
//! - **`registry`**: the collaborator interfaces (service registry, peer
//!   directory, coordination store) and in-memory implementations.
//! - **`configs`**: typed configuration.
//! - **`retrieve`**: HTTP liveness probing (feature `probe-http`).

pub mod broker;
pub mod configs;
pub mod core;
pub mod registry;
#[cfg(feature = "probe-http")]
pub mod retrieve;

// Re-export the types most callers need.
pub use broker::{ClientFormat, ClientMessage, EventBroker, SubscriberHandle};
pub use configs::GatewayConfig;
pub use crate::core::{ActiveTargetResolver, HealthMonitor, RouterCache, SimpleQueryCompiler, TargetAllocator};
pub use registry::{CoordinationStore, PeerDirectory, ServiceRegistry, Target};
