//! # Configuration Module
//!
//! Typed configuration for every gateway component. Each component owns a
//! section with its own defaults so that a partial JSON document is enough
//! to override a single knob.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Component sections and JSON loading.
pub mod gateway_config;

pub use gateway_config::{
    AllocatorConfig, BrokerConfig, ConfigError, GatewayConfig, HealthConfig, RouterCacheConfig,
};
