//! # In-Memory Collaborators
//!
//! Process-local stand-ins for the coordination store. They honour the same
//! contracts as a networked store (full-list change notifications, ownership
//! conflicts) and can be switched into an "unavailable" mode so callers can
//! exercise their fail-soft paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch};

use super::{CoordinationStore, PeerDirectory, PeerRoute, RegistryError, ServiceRegistry, Target};

const CHANGE_BUFFER: usize = 64;

/// In-memory `ServiceRegistry`.
pub struct MemoryServiceRegistry {
    targets: Mutex<Vec<Target>>,
    changes: broadcast::Sender<Vec<Target>>,
    unavailable: AtomicBool,
}

impl MemoryServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            targets: Mutex::new(Vec::new()),
            changes,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Creates a registry pre-populated with `targets` (no notification is sent).
    pub fn with_targets(targets: Vec<Target>) -> Self {
        let registry = Self::new();
        *registry.targets.lock().expect("Registry lock poisoned") = targets;
        registry
    }

    /// Simulates an unreachable store: every call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Returns a copy of the current records without going through the async API.
    pub fn snapshot(&self) -> Vec<Target> {
        self.targets.lock().expect("Registry lock poisoned").clone()
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::Relaxed) {
            Err(RegistryError::Unavailable("memory registry switched off".to_string()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, snapshot: Vec<Target>) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.changes.send(snapshot);
    }
}

impl Default for MemoryServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegistry for MemoryServiceRegistry {
    async fn find(&self, kind: &str) -> Result<Vec<Target>, RegistryError> {
        self.check_available()?;
        let targets = self.targets.lock().expect("Registry lock poisoned");
        Ok(targets.iter().filter(|t| t.kind == kind).cloned().collect())
    }

    async fn find_all(&self) -> Result<Vec<Target>, RegistryError> {
        self.check_available()?;
        Ok(self.snapshot())
    }

    async fn add(&self, kind: &str, url: &str, version: &str) -> Result<(), RegistryError> {
        self.check_available()?;
        let snapshot = {
            let mut targets = self.targets.lock().expect("Registry lock poisoned");
            targets.retain(|t| t.url != url);
            targets.push(Target {
                kind: kind.to_string(),
                url: url.to_string(),
                tenant_id: None,
                version: version.to_string(),
                created_at: Utc::now(),
            });
            targets.clone()
        };
        log::info!("Registered target {} (kind {}, version {})", url, kind, version);
        self.publish(snapshot);
        Ok(())
    }

    async fn remove(&self, url: &str) -> Result<(), RegistryError> {
        self.check_available()?;
        let snapshot = {
            let mut targets = self.targets.lock().expect("Registry lock poisoned");
            let before = targets.len();
            targets.retain(|t| t.url != url);
            if targets.len() == before {
                return Err(RegistryError::NotFound(url.to_string()));
            }
            targets.clone()
        };
        log::info!("Removed target {}", url);
        self.publish(snapshot);
        Ok(())
    }

    async fn assign(&self, url: &str, tenant_id: &str) -> Result<(), RegistryError> {
        self.check_available()?;
        let snapshot = {
            let mut targets = self.targets.lock().expect("Registry lock poisoned");
            let target = targets
                .iter_mut()
                .find(|t| t.url == url)
                .ok_or_else(|| RegistryError::NotFound(url.to_string()))?;
            if let Some(owner) = target.tenant_id.as_ref().filter(|o| o.as_str() != tenant_id) {
                return Err(RegistryError::Conflict {
                    url: url.to_string(),
                    owner: owner.clone(),
                });
            }
            target.tenant_id = Some(tenant_id.to_string());
            targets.clone()
        };
        log::info!("Assigned target {} to tenant {}", url, tenant_id);
        self.publish(snapshot);
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<Vec<Target>> {
        self.changes.subscribe()
    }
}

/// In-memory `PeerDirectory`.
pub struct MemoryPeerDirectory {
    routes: Mutex<Vec<PeerRoute>>,
    changes: broadcast::Sender<Vec<PeerRoute>>,
}

impl MemoryPeerDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            routes: Mutex::new(Vec::new()),
            changes,
        }
    }

    /// Announces (or moves) a peer and notifies watchers.
    pub fn announce(&self, tenant_id: &str, name: &str, server_url: &str) {
        let snapshot = {
            let mut routes = self.routes.lock().expect("Directory lock poisoned");
            routes.retain(|r| !(r.tenant_id == tenant_id && r.name == name));
            routes.push(PeerRoute {
                tenant_id: tenant_id.to_string(),
                name: name.to_string(),
                server_url: server_url.to_string(),
            });
            routes.clone()
        };
        let _ = self.changes.send(snapshot);
    }

    /// Withdraws a peer and notifies watchers.
    pub fn withdraw(&self, tenant_id: &str, name: &str) {
        let snapshot = {
            let mut routes = self.routes.lock().expect("Directory lock poisoned");
            routes.retain(|r| !(r.tenant_id == tenant_id && r.name == name));
            routes.clone()
        };
        let _ = self.changes.send(snapshot);
    }
}

impl Default for MemoryPeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerDirectory for MemoryPeerDirectory {
    async fn find_all(&self, tenant_id: Option<&str>) -> Result<Vec<PeerRoute>, RegistryError> {
        let routes = self.routes.lock().expect("Directory lock poisoned");
        Ok(routes
            .iter()
            .filter(|r| tenant_id.map_or(true, |t| r.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn get(&self, tenant_id: &str, name: &str) -> Result<Option<PeerRoute>, RegistryError> {
        let routes = self.routes.lock().expect("Directory lock poisoned");
        Ok(routes
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.name == name)
            .cloned())
    }

    fn changes(&self) -> broadcast::Receiver<Vec<PeerRoute>> {
        self.changes.subscribe()
    }
}

/// In-memory `CoordinationStore`.
#[derive(Default)]
pub struct MemoryCoordinationStore {
    values: Mutex<HashMap<String, watch::Sender<Option<String>>>>,
}

impl MemoryCoordinationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `value` under `key` and wakes every watcher.
    pub fn put(&self, key: &str, value: &str) {
        let mut values = self.values.lock().expect("Store lock poisoned");
        let sender = values
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0);
        sender.send_replace(Some(value.to_string()));
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RegistryError> {
        let values = self.values.lock().expect("Store lock poisoned");
        Ok(values.get(key).and_then(|s| s.borrow().clone()))
    }

    fn watch(&self, key: &str) -> watch::Receiver<Option<String>> {
        let mut values = self.values.lock().expect("Store lock poisoned");
        values
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_assign_publishes_full_list() {
        let registry = MemoryServiceRegistry::new();
        registry.add("worker", "http://a", "v1").await.unwrap();
        let mut changes = registry.changes();

        registry.assign("http://a", "tenant-1").await.unwrap();

        let list = changes.recv().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].tenant_id.as_deref(), Some("tenant-1"));
    }

    #[tokio::test]
    async fn test_assign_conflict_keeps_owner() {
        let registry = MemoryServiceRegistry::new();
        registry.add("worker", "http://a", "v1").await.unwrap();
        registry.assign("http://a", "tenant-1").await.unwrap();

        let result = registry.assign("http://a", "tenant-2").await;

        assert!(matches!(result, Err(RegistryError::Conflict { .. })));
        assert_eq!(registry.snapshot()[0].tenant_id.as_deref(), Some("tenant-1"));
    }

    #[tokio::test]
    async fn test_unavailable_registry_fails_every_call() {
        let registry = MemoryServiceRegistry::new();
        registry.set_unavailable(true);

        assert!(matches!(registry.find_all().await, Err(RegistryError::Unavailable(_))));
        assert!(registry.add("worker", "http://a", "v1").await.is_err());
    }

    #[tokio::test]
    async fn test_store_watch_sees_later_put() {
        let store = MemoryCoordinationStore::new();
        let mut rx = store.watch("k");
        assert_eq!(*rx.borrow(), None);

        store.put("k", "v2");

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_deref(), Some("v2"));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }
}
