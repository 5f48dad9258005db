//! # Retrieval Module
//!
//! HTTP clients used by the gateway to talk to its targets outside of the
//! event channel.
//!
//! - **`http_probe`**: the liveness `Prober` used by the health monitor.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Liveness probing over plain HTTP GET.
pub mod http_probe;

pub use http_probe::HttpProber;
