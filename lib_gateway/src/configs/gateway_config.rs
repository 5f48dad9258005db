//! # Gateway Configuration
//!
//! All durations are expressed in milliseconds in the JSON form so the file
//! stays readable without a duration grammar.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// The file is not valid JSON for `GatewayConfig`.
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A value is outside its allowed range.
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field, dotted path.
        field: &'static str,
        /// Human readable constraint.
        reason: &'static str,
    },
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    /// Suppresses the periodic probing loop.
    pub disabled: bool,
    /// Delay between probe cycles.
    pub interval_ms: u64,
    /// Per-probe timeout.
    pub timeout_ms: u64,
    /// Maximum probes in flight.
    pub max_parallel: usize,
    /// Consecutive successes needed to flip to Up.
    pub healthy_threshold: u32,
    /// Consecutive failures needed to flip to Down.
    pub unhealthy_threshold: u32,
    /// Path appended to the target URL for the liveness request.
    pub probe_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            interval_ms: 30_000,
            timeout_ms: 10_000,
            max_parallel: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 5,
            probe_path: "/".to_string(),
        }
    }
}

impl HealthConfig {
    /// Probe cycle period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Probe timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Router cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterCacheConfig {
    /// Entry lifetime.
    pub ttl_ms: u64,
    /// Maximum entries, `None` for unbounded.
    pub capacity: Option<usize>,
}

impl Default for RouterCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            capacity: None,
        }
    }
}

impl RouterCacheConfig {
    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Target allocator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocatorConfig {
    /// Targets a tenant may own.
    pub max_targets: usize,
    /// Registry kind under which targets are registered.
    pub target_kind: String,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_targets: 2,
            target_kind: "worker".to_string(),
        }
    }
}

/// Event broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Safety reconciliation tick.
    pub reconcile_interval_ms: u64,
    /// Path of the event endpoint on every target.
    pub event_path: String,
    /// Timeout for establishing a backend event connection.
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: 5_000,
            event_path: "/events".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl BrokerConfig {
    /// Safety reconciliation tick.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Backend connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// # Gateway Configuration
///
/// Root document. Every section is optional in JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Health monitor section.
    pub health: HealthConfig,
    /// Router cache section.
    pub router_cache: RouterCacheConfig,
    /// Allocator section.
    pub allocator: AllocatorConfig,
    /// Broker section.
    pub broker: BrokerConfig,
}

impl GatewayConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.healthy_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "health.healthyThreshold",
                reason: "must be at least 1",
            });
        }
        if self.health.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "health.unhealthyThreshold",
                reason: "must be at least 1",
            });
        }
        if self.health.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "health.intervalMs",
                reason: "must be at least 1",
            });
        }
        if self.health.max_parallel == 0 {
            return Err(ConfigError::Invalid {
                field: "health.maxParallel",
                reason: "must be at least 1",
            });
        }
        if self.allocator.max_targets == 0 {
            return Err(ConfigError::Invalid {
                field: "allocator.maxTargets",
                reason: "must be at least 1",
            });
        }
        if self.broker.reconcile_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.reconcileIntervalMs",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}
