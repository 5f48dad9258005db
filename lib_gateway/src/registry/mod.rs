//! # Registry Collaborators
//!
//! The gateway core never talks to the coordination store directly. It sees
//! three narrow interfaces, each with a change stream that carries the full
//! current list on every mutation:
//!
//! - **`ServiceRegistry`**: the pool of backend targets and their tenant
//!   ownership records.
//! - **`PeerDirectory`**: edge hubs announced by name per tenant, each
//!   pointing at the target currently serving it.
//! - **`CoordinationStore`**: plain key/value reads with watch semantics,
//!   used for the currently deployed target version.
//!
//! The `memory` submodule provides in-process implementations used by the
//! tests and by the server's static mode.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// In-process implementations of the collaborator traits.
pub mod memory;

pub use memory::{MemoryCoordinationStore, MemoryPeerDirectory, MemoryServiceRegistry};

/// Key under which the coordination store publishes the deployed target version.
pub const VERSION_KEY: &str = "targets/version";

/// # Target
///
/// A backend worker process as recorded in the service registry. A target
/// with no `tenant_id` is unallocated and may be claimed by any tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Service kind the target was registered under.
    pub kind: String,
    /// Base URL of the target (e.g. `http://10.0.0.5:8080`).
    pub url: String,
    /// Owning tenant, `None` while unallocated.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Deployed build version of the target.
    pub version: String,
    /// Registration time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// # Peer Route
///
/// An externally announced peer (edge hub) of a tenant and the target URL
/// that currently serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRoute {
    /// Tenant the peer belongs to.
    pub tenant_id: String,
    /// Peer name, unique within the tenant.
    pub name: String,
    /// Target URL serving the peer.
    pub server_url: String,
}

/// Errors surfaced by registry collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The backing store could not be reached or answered with a failure.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// No record exists for the given URL.
    #[error("target not found: {0}")]
    NotFound(String),

    /// The target is already owned by another tenant.
    #[error("target {url} already owned by tenant {owner}")]
    Conflict {
        /// Target URL that was being claimed.
        url: String,
        /// Tenant currently holding the target.
        owner: String,
    },
}

/// The service registry as seen by the gateway core.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Lists every target registered under `kind`.
    async fn find(&self, kind: &str) -> Result<Vec<Target>, RegistryError>;

    /// Lists every registered target.
    async fn find_all(&self) -> Result<Vec<Target>, RegistryError>;

    /// Registers (or re-registers) an unallocated target.
    async fn add(&self, kind: &str, url: &str, version: &str) -> Result<(), RegistryError>;

    /// Removes a target record.
    async fn remove(&self, url: &str) -> Result<(), RegistryError>;

    /// Writes the ownership record tagging `url` with `tenant_id`.
    async fn assign(&self, url: &str, tenant_id: &str) -> Result<(), RegistryError>;

    /// Change stream; every mutation publishes the full current list.
    fn changes(&self) -> broadcast::Receiver<Vec<Target>>;
}

/// The peer announcement directory.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Lists announced peers, optionally restricted to one tenant.
    async fn find_all(&self, tenant_id: Option<&str>) -> Result<Vec<PeerRoute>, RegistryError>;

    /// Looks up a single peer.
    async fn get(&self, tenant_id: &str, name: &str) -> Result<Option<PeerRoute>, RegistryError>;

    /// Change stream; every mutation publishes the full current list.
    fn changes(&self) -> broadcast::Receiver<Vec<PeerRoute>>;
}

/// Key/value reads with watch notifications.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Reads the current value of `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, RegistryError>;

    /// Watches `key`; the receiver always holds the latest value.
    fn watch(&self, key: &str) -> watch::Receiver<Option<String>>;
}
