//! # Target Allocator
//!
//! Hands out a target URL per tenant, claiming unallocated targets from the
//! registry until the tenant owns `max_targets` serving targets at the
//! current version.
//!
//! Concurrent `lookup`s for one tenant are coalesced: the first caller
//! starts an allocation sequence on its own task, later callers attach to it,
//! and every attached caller receives the same outcome once the sequence has
//! cleared its slot. A caller that gives up only drops its own waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::configs::AllocatorConfig;
use crate::core::resolver::ActiveTargetResolver;
use crate::registry::{RegistryError, ServiceRegistry, Target};

/// Allocation outcomes returned to `lookup` callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// The tenant owns no target and none is left to claim.
    #[error("no available target for tenant {0}")]
    NoAvailableTarget(String),

    /// The registry failed mid-sequence; local state was left untouched.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The allocation task went away before answering.
    #[error("allocation for tenant {0} was abandoned")]
    Abandoned(String),
}

type Waiter = oneshot::Sender<Result<String, AllocationError>>;

/// # Target Allocator
#[derive(Clone)]
pub struct TargetAllocator {
    config: AllocatorConfig,
    registry: Arc<dyn ServiceRegistry>,
    resolver: Arc<ActiveTargetResolver>,
    // tenant -> callers waiting on the in-flight sequence
    inflight: Arc<Mutex<HashMap<String, Vec<Waiter>>>>,
    // tenant -> round-robin position
    rotation: Arc<Mutex<HashMap<String, usize>>>,
}

impl TargetAllocator {
    /// Creates an allocator over `registry`, reading the local view through `resolver`.
    pub fn new(
        config: AllocatorConfig,
        registry: Arc<dyn ServiceRegistry>,
        resolver: Arc<ActiveTargetResolver>,
    ) -> Self {
        Self {
            config,
            registry,
            resolver,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            rotation: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns a target URL for `tenant_id`, allocating one if needed.
    pub async fn lookup(&self, tenant_id: &str) -> Result<String, AllocationError> {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut inflight = self.inflight.lock().expect("Allocator lock poisoned");
            let waiters = inflight.entry(tenant_id.to_string()).or_default();
            waiters.push(tx);
            waiters.len() == 1
        };

        if first {
            let allocator = self.clone();
            let tenant = tenant_id.to_string();
            tokio::spawn(async move { allocator.run_sequence(tenant).await });
        } else {
            log::debug!("Joining in-flight allocation for tenant {}", tenant_id);
        }

        rx.await
            .unwrap_or_else(|_| Err(AllocationError::Abandoned(tenant_id.to_string())))
    }

    async fn run_sequence(&self, tenant_id: String) {
        let outcome = self
            .allocate(&tenant_id)
            .await
            .and_then(|eligible| self.select(&tenant_id, &eligible));

        // Clear the slot first so that any caller woken below starts fresh.
        let waiters = self
            .inflight
            .lock()
            .expect("Allocator lock poisoned")
            .remove(&tenant_id)
            .unwrap_or_default();

        match &outcome {
            Ok(url) => log::debug!("Tenant {} -> {} ({} waiters)", tenant_id, url, waiters.len()),
            Err(e) => log::warn!("Allocation for tenant {} failed: {}", tenant_id, e),
        }
        for waiter in waiters {
            // A dropped receiver is a caller that stopped waiting.
            let _ = waiter.send(outcome.clone());
        }
    }

    fn select(&self, tenant_id: &str, eligible: &[Target]) -> Result<String, AllocationError> {
        if eligible.is_empty() {
            return Err(AllocationError::NoAvailableTarget(tenant_id.to_string()));
        }
        let mut rotation = self.rotation.lock().expect("Allocator lock poisoned");
        let index = rotation.entry(tenant_id.to_string()).or_insert(0);
        let url = eligible[*index % eligible.len()].url.clone();
        *index = index.wrapping_add(1);
        Ok(url)
    }

    /// Ensures `tenant_id` owns up to `max_targets` serving targets and
    /// returns the eligible ones.
    pub async fn allocate(&self, tenant_id: &str) -> Result<Vec<Target>, AllocationError> {
        let mut max_targets = self.config.max_targets.max(1);

        loop {
            let eligible = self.resolver.targets(tenant_id);
            if eligible.len() >= max_targets {
                return Ok(eligible);
            }

            let all = match self.registry.find_all().await {
                Ok(all) => all,
                Err(e) => return self.keep_current(tenant_id, e),
            };
            let health = self.resolver.health();
            let allocated: Vec<&Target> = all
                .iter()
                .filter(|t| {
                    t.tenant_id.as_deref() == Some(tenant_id)
                        && self.resolver.is_current(&t.version)
                        && health.is_serving(&t.url)
                })
                .collect();
            let unallocated: Vec<&Target> = all
                .iter()
                .filter(|t| {
                    t.tenant_id.is_none()
                        && t.kind == self.config.target_kind
                        && self.resolver.is_current(&t.version)
                })
                .collect();

            let owned = allocated.len();
            let candidate = unallocated.first().map(|t| t.url.clone());

            if owned >= max_targets {
                // Local view was stale.
                self.resolver.apply_registry(all);
                log::debug!("Tenant {} already owns {} targets", tenant_id, owned);
                return Ok(self.resolver.targets(tenant_id));
            }

            match candidate {
                Some(url) => match self.registry.assign(&url, tenant_id).await {
                    Ok(()) => {
                        log::info!("Allocated target {} to tenant {}", url, tenant_id);
                        if let Err(e) = self.resolver.refresh().await {
                            return self.keep_current(tenant_id, e);
                        }
                    }
                    Err(RegistryError::Conflict { owner, .. }) => {
                        log::debug!("Target {} claimed by {} first, retrying", url, owner);
                    }
                    Err(e) => return self.keep_current(tenant_id, e),
                },
                None if owned > 0 => {
                    // Pool exhausted: settle for what the tenant already has.
                    max_targets = owned;
                    self.resolver.apply_registry(all);
                }
                None => return Err(AllocationError::NoAvailableTarget(tenant_id.to_string())),
            }
        }
    }

    // Registry failure mid top-up: targets already held stay usable.
    fn keep_current(&self, tenant_id: &str, error: RegistryError) -> Result<Vec<Target>, AllocationError> {
        let eligible = self.resolver.targets(tenant_id);
        if eligible.is_empty() {
            return Err(error.into());
        }
        log::warn!(
            "Registry failed while topping up tenant {} ({}); keeping {} targets",
            tenant_id,
            error,
            eligible.len()
        );
        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::HealthConfig;
    use crate::core::health::{HealthMonitor, Prober};
    use crate::core::router_cache::RouterCache;
    use crate::registry::{MemoryCoordinationStore, MemoryPeerDirectory, MemoryServiceRegistry};
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysUp;

    #[async_trait]
    impl Prober for AlwaysUp {
        async fn probe(&self, _url: &str) -> bool {
            true
        }
    }

    async fn allocator(urls: &[&str], max_targets: usize) -> (Arc<MemoryServiceRegistry>, TargetAllocator) {
        let registry = Arc::new(MemoryServiceRegistry::new());
        for url in urls {
            registry.add("worker", url, "v1").await.unwrap();
        }
        let health = Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            registry.clone(),
            Arc::new(AlwaysUp),
        ));
        let resolver = Arc::new(ActiveTargetResolver::new(
            registry.clone(),
            Arc::new(MemoryPeerDirectory::new()),
            Arc::new(MemoryCoordinationStore::new()),
            health,
            RouterCache::with_ttl(Duration::from_secs(60), None),
        ));
        let config = AllocatorConfig {
            max_targets,
            ..AllocatorConfig::default()
        };
        (registry.clone(), TargetAllocator::new(config, registry, resolver))
    }

    #[tokio::test]
    async fn test_allocates_up_to_max_targets() {
        let (registry, allocator) = allocator(&["http://a", "http://b", "http://c"], 2).await;

        let eligible = allocator.allocate("t1").await.unwrap();

        assert_eq!(eligible.len(), 2);
        let owned = registry
            .snapshot()
            .into_iter()
            .filter(|t| t.tenant_id.as_deref() == Some("t1"))
            .count();
        assert_eq!(owned, 2);
    }

    #[tokio::test]
    async fn test_round_robin_alternates() {
        let (_registry, allocator) = allocator(&["http://a", "http://b"], 2).await;

        let first = allocator.lookup("t1").await.unwrap();
        let second = allocator.lookup("t1").await.unwrap();
        let third = allocator.lookup("t1").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn test_degrades_to_owned_count() {
        let (registry, allocator) = allocator(&["http://a", "http://b"], 3).await;
        registry.assign("http://b", "t2").await.unwrap();

        let eligible = allocator.allocate("t1").await.unwrap();

        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].url, "http://a");
    }

    #[tokio::test]
    async fn test_no_available_target() {
        let (registry, allocator) = allocator(&["http://a"], 2).await;
        registry.assign("http://a", "t2").await.unwrap();

        let result = allocator.lookup("t1").await;

        assert_eq!(result, Err(AllocationError::NoAvailableTarget("t1".to_string())));
    }

    #[tokio::test]
    async fn test_registry_failure_reaches_caller() {
        let (registry, allocator) = allocator(&["http://a"], 1).await;
        registry.set_unavailable(true);

        let result = allocator.lookup("t1").await;

        assert!(matches!(result, Err(AllocationError::Registry(RegistryError::Unavailable(_)))));
        registry.set_unavailable(false);
        assert!(registry.snapshot()[0].tenant_id.is_none());
    }

    #[tokio::test]
    async fn test_slot_cleared_after_sequence() {
        let (_registry, allocator) = allocator(&["http://a"], 1).await;

        allocator.lookup("t1").await.unwrap();

        assert!(allocator.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_failure_keeps_owned_targets() {
        let (registry, allocator) = allocator(&["http://a", "http://b"], 2).await;
        registry.assign("http://a", "t1").await.unwrap();
        allocator.resolver.refresh().await.unwrap();
        registry.set_unavailable(true);

        assert_eq!(allocator.lookup("t1").await, Ok("http://a".to_string()));

        registry.set_unavailable(false);
        assert!(registry.snapshot().iter().all(|t| t.url != "http://b" || t.tenant_id.is_none()));
    }
}
