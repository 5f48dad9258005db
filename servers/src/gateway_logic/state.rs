use anyhow::{Context, Result};
use lib_gateway::broker::{EventBroker, WsConnector};
use lib_gateway::configs::GatewayConfig;
use lib_gateway::core::{ActiveTargetResolver, HealthMonitor, RouterCache, SimpleQueryCompiler, TargetAllocator};
use lib_gateway::registry::{
    MemoryCoordinationStore, MemoryPeerDirectory, MemoryServiceRegistry, PeerRoute, Target, VERSION_KEY,
};
use lib_gateway::retrieve::HttpProber;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Static snapshot of the coordination store used to seed the in-memory
/// collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateFile {
    pub targets: Vec<Target>,
    pub peers: Vec<PeerRoute>,
    pub version: Option<String>,
}

impl StateFile {
    /// Reads the state file; a missing file is an empty state.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!("State file {} not found, starting with an empty registry.", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn seed(self) -> (Arc<MemoryServiceRegistry>, Arc<MemoryPeerDirectory>, Arc<MemoryCoordinationStore>) {
        log::info!(
            "Seeding {} targets, {} peers, version {:?}",
            self.targets.len(),
            self.peers.len(),
            self.version
        );
        let registry = Arc::new(MemoryServiceRegistry::with_targets(self.targets));
        let peers = Arc::new(MemoryPeerDirectory::new());
        for route in &self.peers {
            peers.announce(&route.tenant_id, &route.name, &route.server_url);
        }
        let store = Arc::new(MemoryCoordinationStore::new());
        if let Some(version) = &self.version {
            store.put(VERSION_KEY, version);
        }
        (registry, peers, store)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<ActiveTargetResolver>,
    pub allocator: TargetAllocator,
    pub broker: EventBroker,
}

impl AppState {
    /// Wires the gateway core over the seeded collaborators. Nothing runs
    /// until `start`.
    pub fn new(config: &GatewayConfig, seed: StateFile) -> Result<Self> {
        let (registry, peers, store) = seed.seed();
        let prober = HttpProber::from_config(&config.health).context("building HTTP prober")?;
        let health = Arc::new(HealthMonitor::new(config.health.clone(), registry.clone(), Arc::new(prober)));
        let resolver = Arc::new(ActiveTargetResolver::new(
            registry.clone(),
            peers,
            store,
            health,
            RouterCache::new(&config.router_cache),
        ));
        let allocator = TargetAllocator::new(config.allocator.clone(), registry, resolver.clone());
        let broker = EventBroker::new(
            config.broker.clone(),
            resolver.clone(),
            Arc::new(WsConnector::from_config(&config.broker)),
            Arc::new(SimpleQueryCompiler),
        );
        Ok(Self {
            resolver,
            allocator,
            broker,
        })
    }

    /// Starts the health monitor, the resolver and the broker.
    pub async fn start(&self) {
        self.resolver.health().start();
        self.resolver.start().await;
        self.broker.start();
        log::info!("Gateway core started.");
    }

    pub fn stop(&self) {
        self.broker.stop();
        self.resolver.stop();
        self.resolver.health().stop();
        log::info!("Gateway core stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_gateway::registry::{CoordinationStore, PeerDirectory};

    const STATE: &str = r#"{
        "targets": [
            { "kind": "worker", "url": "http://w1:8080", "tenantId": "t1", "version": "v1" },
            { "kind": "worker", "url": "http://w2:8080", "version": "v1" }
        ],
        "peers": [ { "tenantId": "t1", "name": "hub-a", "serverUrl": "http://w1:8080" } ],
        "version": "v1"
    }"#;

    #[tokio::test]
    async fn test_state_file_seeds_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, STATE).unwrap();

        let (registry, peers, store) = StateFile::load(&path).unwrap().seed();

        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.snapshot()[0].tenant_id.as_deref(), Some("t1"));
        let route = peers.get("t1", "hub-a").await.unwrap().unwrap();
        assert_eq!(route.server_url, "http://w1:8080");
        assert_eq!(store.get(VERSION_KEY).await.unwrap().as_deref(), Some("v1"));
    }

    #[test]
    fn test_missing_state_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(state, StateFile::default());
    }

    #[tokio::test]
    async fn test_app_state_resolves_seeded_tenant() {
        let mut config = GatewayConfig::default();
        config.health.disabled = true;
        let state = AppState::new(&config, serde_json::from_str(STATE).unwrap()).unwrap();
        state.start().await;

        let urls = state.resolver.active_urls("t1");
        assert_eq!(urls, vec!["http://w1:8080".to_string()]);
        assert!(state.allocator.lookup("t1").await.is_ok());

        state.stop();
    }
}
