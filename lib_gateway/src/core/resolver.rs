//! # Active Target Resolver
//!
//! Read-side view of the target pool per tenant. It mirrors the registry into
//! a per-tenant index (rebuilt wholesale on every registry notification),
//! keeps the router cache in sync with the peer directory, and tracks the
//! currently deployed target version from the coordination store.
//!
//! After any of these inputs change, subscribers of `subscribe_changes()`
//! receive a "services changed" tick; the event broker reconciles on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::core::health::{HealthMonitor, HealthStatus};
use crate::core::router_cache::RouterCache;
use crate::registry::{
    CoordinationStore, PeerDirectory, PeerRoute, RegistryError, ServiceRegistry, Target,
    VERSION_KEY,
};

const CHANGE_BUFFER: usize = 16;

/// A target URL as reported by `active_targets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTarget {
    /// Base URL.
    pub url: String,
    /// Registry version; empty for URLs known only from the router cache.
    pub version: String,
    /// Health at resolution time.
    pub status: HealthStatus,
}

/// # Active Target Resolver
pub struct ActiveTargetResolver {
    registry: Arc<dyn ServiceRegistry>,
    peers: Arc<dyn PeerDirectory>,
    store: Arc<dyn CoordinationStore>,
    health: Arc<HealthMonitor>,
    cache: RouterCache,
    index: RwLock<HashMap<String, Vec<Target>>>,
    version: RwLock<Option<String>>,
    changes: broadcast::Sender<()>,
    running: Mutex<Option<CancellationToken>>,
}

impl ActiveTargetResolver {
    /// Creates a resolver with an empty index. Call `start` to load and follow.
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        peers: Arc<dyn PeerDirectory>,
        store: Arc<dyn CoordinationStore>,
        health: Arc<HealthMonitor>,
        cache: RouterCache,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            registry,
            peers,
            store,
            health,
            cache,
            index: RwLock::new(HashMap::new()),
            version: RwLock::new(None),
            changes,
            running: Mutex::new(None),
        }
    }

    /// The health monitor used for serving checks.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// The router cache.
    pub fn cache(&self) -> &RouterCache {
        &self.cache
    }

    /// "Services changed" notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        let _ = self.changes.send(());
    }

    /// The deployed target version, `None` until the store publishes one.
    pub fn current_version(&self) -> Option<String> {
        self.version.read().expect("Resolver lock poisoned").clone()
    }

    /// Whether `version` counts as current. Without a published version
    /// every version does.
    pub fn is_current(&self, version: &str) -> bool {
        self.version
            .read()
            .expect("Resolver lock poisoned")
            .as_deref()
            .map_or(true, |v| v == version)
    }

    fn set_version(&self, version: Option<String>) {
        let mut current = self.version.write().expect("Resolver lock poisoned");
        if *current != version {
            log::info!("Target version {:?} -> {:?}", *current, version);
            *current = version;
        }
    }

    /// Rebuilds the per-tenant index from a full registry listing.
    pub fn apply_registry(&self, targets: Vec<Target>) {
        let mut index: HashMap<String, Vec<Target>> = HashMap::new();
        for target in targets {
            if let Some(tenant) = target.tenant_id.clone() {
                index.entry(tenant).or_default().push(target);
            }
        }
        *self.index.write().expect("Resolver lock poisoned") = index;
    }

    /// Reloads the index from the registry.
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let targets = self.registry.find_all().await?;
        self.apply_registry(targets);
        Ok(())
    }

    /// Full router cache resync from a peer listing.
    pub fn apply_peers(&self, routes: Vec<PeerRoute>) {
        self.cache.reset();
        for route in routes {
            self.cache.set(&route.tenant_id, &route.name, &route.server_url);
        }
    }

    /// Reloads the router cache from the peer directory.
    pub async fn sync_peers(&self) -> Result<(), RegistryError> {
        let routes = self.peers.find_all(None).await?;
        self.apply_peers(routes);
        Ok(())
    }

    /// Tenant-owned targets at the current version that are serving.
    pub fn targets(&self, tenant_id: &str) -> Vec<Target> {
        let index = self.index.read().expect("Resolver lock poisoned");
        index
            .get(tenant_id)
            .map(|targets| {
                targets
                    .iter()
                    .filter(|t| self.is_current(&t.version) && self.health.is_serving(&t.url))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every URL that should carry the tenant's event traffic.
    ///
    /// Router cache URLs are trusted as-is. Registry targets count when they
    /// run the current version or are referenced by the cache, and only while
    /// serving.
    pub fn active_targets(&self, tenant_id: &str) -> Vec<ActiveTarget> {
        let cached = self.cache.urls(tenant_id);
        let index = self.index.read().expect("Resolver lock poisoned");
        let owned = index.get(tenant_id).map(Vec::as_slice).unwrap_or_default();

        let mut active: Vec<ActiveTarget> = cached
            .iter()
            .map(|url| ActiveTarget {
                url: url.clone(),
                version: owned
                    .iter()
                    .find(|t| &t.url == url)
                    .map(|t| t.version.clone())
                    .unwrap_or_default(),
                status: self.health.status(url),
            })
            .collect();

        for target in owned {
            if active.iter().any(|a| a.url == target.url) {
                continue;
            }
            if self.is_current(&target.version) && self.health.is_serving(&target.url) {
                active.push(ActiveTarget {
                    url: target.url.clone(),
                    version: target.version.clone(),
                    status: self.health.status(&target.url),
                });
            }
        }
        active
    }

    /// URLs of `active_targets`.
    pub fn active_urls(&self, tenant_id: &str) -> Vec<String> {
        self.active_targets(tenant_id).into_iter().map(|a| a.url).collect()
    }

    /// Resolves the target serving peer `name`: router cache first, then the
    /// peer directory (caching the answer).
    pub async fn lookup_peers_target(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<String>, RegistryError> {
        if let Some(url) = self.cache.get(tenant_id, name) {
            return Ok(Some(url));
        }
        let route = self.peers.get(tenant_id, name).await?;
        Ok(route.map(|r| {
            self.cache.set(tenant_id, name, &r.server_url);
            r.server_url
        }))
    }

    /// Loads the initial state and follows registry, peer and version
    /// changes until `stop`. Initial load failures are logged; the next
    /// notification heals them. Returns `false` if already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let token = {
            let mut running = self.running.lock().expect("Resolver lock poisoned");
            if running.is_some() {
                return false;
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };

        // Subscribe before loading so nothing published in between is lost.
        let mut registry_rx = self.registry.changes();
        let mut peers_rx = self.peers.changes();
        let mut version_rx = self.store.watch(VERSION_KEY);

        match self.store.get(VERSION_KEY).await {
            Ok(version) => self.set_version(version),
            Err(e) => log::warn!("Initial version read failed: {}", e),
        }
        if let Err(e) = self.refresh().await {
            log::warn!("Initial registry load failed: {}", e);
        }
        if let Err(e) = self.sync_peers().await {
            log::warn!("Initial peer sync failed: {}", e);
        }
        self.notify();

        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    msg = registry_rx.recv() => match msg {
                        Ok(targets) => resolver.apply_registry(targets),
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Registry stream lagged by {}, reloading", n);
                            if let Err(e) = resolver.refresh().await {
                                log::warn!("Registry reload failed: {}", e);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                    msg = peers_rx.recv() => match msg {
                        Ok(routes) => resolver.apply_peers(routes),
                        Err(RecvError::Lagged(_)) => {
                            if let Err(e) = resolver.sync_peers().await {
                                log::warn!("Peer resync failed: {}", e);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = version_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let version = version_rx.borrow_and_update().clone();
                        resolver.set_version(version);
                    }
                }
                resolver.notify();
            }
            log::info!("Resolver stopped following changes.");
        });
        true
    }

    /// Stops following changes.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().expect("Resolver lock poisoned").take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::HealthConfig;
    use crate::core::health::Prober;
    use crate::registry::{MemoryCoordinationStore, MemoryPeerDirectory, MemoryServiceRegistry};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    struct NeverProber;

    #[async_trait]
    impl Prober for NeverProber {
        async fn probe(&self, _url: &str) -> bool {
            false
        }
    }

    struct Fixture {
        registry: Arc<MemoryServiceRegistry>,
        peers: Arc<MemoryPeerDirectory>,
        store: Arc<MemoryCoordinationStore>,
        resolver: Arc<ActiveTargetResolver>,
    }

    fn target(url: &str, tenant: Option<&str>, version: &str) -> Target {
        Target {
            kind: "worker".to_string(),
            url: url.to_string(),
            tenant_id: tenant.map(str::to_string),
            version: version.to_string(),
            created_at: Utc::now(),
        }
    }

    fn fixture(targets: Vec<Target>) -> Fixture {
        let registry = Arc::new(MemoryServiceRegistry::with_targets(targets));
        let peers = Arc::new(MemoryPeerDirectory::new());
        let store = Arc::new(MemoryCoordinationStore::new());
        store.put(VERSION_KEY, "v2");
        let health = Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            registry.clone(),
            Arc::new(NeverProber),
        ));
        let resolver = Arc::new(ActiveTargetResolver::new(
            registry.clone(),
            peers.clone(),
            store.clone(),
            health,
            RouterCache::with_ttl(Duration::from_secs(60), None),
        ));
        Fixture {
            registry,
            peers,
            store,
            resolver,
        }
    }

    #[tokio::test]
    async fn test_targets_filter_version_and_health() {
        let f = fixture(vec![
            target("http://a", Some("t1"), "v2"),
            target("http://b", Some("t1"), "v1"),
            target("http://c", Some("t1"), "v2"),
            target("http://d", Some("t2"), "v2"),
            target("http://e", None, "v2"),
        ]);
        f.resolver.start().await;
        f.resolver.health().record_failure("http://c");

        let urls: Vec<String> = f.resolver.targets("t1").into_iter().map(|t| t.url).collect();

        assert_eq!(urls, vec!["http://a".to_string()]);
        assert!(f.resolver.targets("nobody").is_empty());
    }

    #[tokio::test]
    async fn test_active_targets_trust_router_cache() {
        let f = fixture(vec![
            target("http://a", Some("t1"), "v2"),
            target("http://old", Some("t1"), "v1"),
        ]);
        f.peers.announce("t1", "hub-a", "http://old");
        f.peers.announce("t1", "hub-b", "http://elsewhere");
        f.resolver.start().await;

        let active = f.resolver.active_targets("t1");
        let mut urls: Vec<&str> = active.iter().map(|a| a.url.as_str()).collect();
        urls.sort();

        assert_eq!(urls, vec!["http://a", "http://elsewhere", "http://old"]);
        let elsewhere = active.iter().find(|a| a.url == "http://elsewhere").unwrap();
        assert_eq!(elsewhere.version, "");
        let old = active.iter().find(|a| a.url == "http://old").unwrap();
        assert_eq!(old.version, "v1");
    }

    #[tokio::test]
    async fn test_lookup_peer_caches_directory_answer() {
        let f = fixture(vec![]);
        f.peers.announce("t1", "hub-a", "http://w1");

        let url = f.resolver.lookup_peers_target("t1", "hub-a").await.unwrap();

        assert_eq!(url.as_deref(), Some("http://w1"));
        assert_eq!(f.resolver.cache().get("t1", "hub-a").as_deref(), Some("http://w1"));
        assert_eq!(f.resolver.lookup_peers_target("t1", "ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_follows_registry_and_version_changes() {
        let f = fixture(vec![]);
        let mut changes = f.resolver.subscribe_changes();
        assert!(f.resolver.start().await);
        changes.recv().await.unwrap();

        f.registry.add("worker", "http://a", "v3").await.unwrap();
        f.registry.assign("http://a", "t1").await.unwrap();
        changes.recv().await.unwrap();
        changes.recv().await.unwrap();
        assert!(f.resolver.targets("t1").is_empty());

        f.store.put(VERSION_KEY, "v3");
        changes.recv().await.unwrap();

        assert_eq!(f.resolver.current_version().as_deref(), Some("v3"));
        assert_eq!(f.resolver.targets("t1").len(), 1);
        f.resolver.stop();
    }

    #[tokio::test]
    async fn test_peer_change_resyncs_cache() {
        let f = fixture(vec![]);
        let mut changes = f.resolver.subscribe_changes();
        f.resolver.start().await;
        changes.recv().await.unwrap();

        f.peers.announce("t1", "hub-a", "http://w1");
        changes.recv().await.unwrap();
        f.peers.withdraw("t1", "hub-a");
        changes.recv().await.unwrap();

        assert!(f.resolver.cache().keys(None).is_empty());
    }
}
