//! # Core Routing Module
//!
//! The routing half of the gateway: which targets exist, which of them are
//! healthy, and which one a tenant should talk to.
//!
//! ## Core Components:
//!
//! - **`health`**: per-target hysteresis state machine fed by a periodic,
//!   concurrency-bounded probe loop.
//!
//! - **`router_cache`**: TTL map from `(tenant, peer name)` to the target
//!   URL currently serving that peer.
//!
//! - **`resolver`**: mirrors the registry, peer directory and deployed
//!   version into a per-tenant view and publishes "services changed"
//!   notifications.
//!
//! - **`allocator`**: claims targets for tenants with per-tenant request
//!   coalescing and round-robin selection.
//!
//! - **`topic`** / **`predicate`**: subscription topic grammar and the query
//!   filters attached to it; used by the event broker.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Capacity-bounded target allocation with request coalescing.
pub mod allocator;
/// Target health state machine and probe loop.
pub mod health;
/// Query predicates over event payloads.
pub mod predicate;
/// Per-tenant view of the target pool.
pub mod resolver;
/// TTL cache of peer routes.
pub mod router_cache;
/// Subscription topic patterns.
pub mod topic;

// --- Public API Re-exports ---
pub use allocator::{AllocationError, TargetAllocator};
pub use health::{HealthMonitor, HealthRecord, HealthStatus, Prober};
pub use predicate::{Predicate, PredicateCompiler, PredicateError, SimpleQueryCompiler};
pub use resolver::{ActiveTarget, ActiveTargetResolver};
pub use router_cache::RouterCache;
pub use topic::{TopicError, TopicPattern};
