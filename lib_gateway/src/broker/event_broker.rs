//! # Event Broker
//!
//! Entry point for subscriber sockets. Each tenant gets its own actor
//! (`tenant::run_tenant`), created with the tenant's first subscriber and
//! swept on the first tick after its last subscriber leaves.
//!
//! Target connections are reconciled against `active_targets` whenever the
//! resolver reports a change, on every tick, and right away when a tenant
//! gains its first subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::protocol::{ClientFormat, ClientMessage, ClientRequest, ProtocolError};
use crate::broker::subscription::next_client_id;
use crate::broker::target::Connector;
use crate::broker::tenant::{run_tenant, TenantCommand, TenantState};
use crate::configs::BrokerConfig;
use crate::core::predicate::PredicateCompiler;
use crate::core::resolver::ActiveTargetResolver;

struct TenantEntry {
    commands: mpsc::UnboundedSender<TenantCommand>,
    subscribers: usize,
}

struct BrokerInner {
    config: BrokerConfig,
    resolver: Arc<ActiveTargetResolver>,
    connector: Arc<dyn Connector>,
    compiler: Arc<dyn PredicateCompiler>,
    tenants: Mutex<HashMap<String, TenantEntry>>,
    running: Mutex<Option<CancellationToken>>,
}

/// # Event Broker
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl EventBroker {
    /// Creates a broker. Call `start` to follow resolver changes.
    pub fn new(
        config: BrokerConfig,
        resolver: Arc<ActiveTargetResolver>,
        connector: Arc<dyn Connector>,
        compiler: Arc<dyn PredicateCompiler>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                resolver,
                connector,
                compiler,
                tenants: Mutex::new(HashMap::new()),
                running: Mutex::new(None),
            }),
        }
    }

    /// Attaches a new subscriber connection to `tenant_id`.
    pub fn client(&self, tenant_id: &str, format: ClientFormat) -> SubscriberHandle {
        let client_id = next_client_id();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        let commands = {
            let mut tenants = self.inner.tenants.lock().expect("Broker lock poisoned");
            let entry = tenants
                .entry(tenant_id.to_string())
                .or_insert_with(|| self.spawn_tenant(tenant_id));
            entry.subscribers += 1;
            let _ = entry.commands.send(TenantCommand::Connect {
                client_id,
                format,
                outbox: outbox_tx.clone(),
            });
            if entry.subscribers == 1 {
                let _ = entry.commands.send(TenantCommand::Reconcile {
                    urls: self.inner.resolver.active_urls(tenant_id),
                });
            }
            entry.commands.clone()
        };

        SubscriberHandle {
            client_id,
            tenant_id: tenant_id.to_string(),
            commands,
            outbox_tx,
            outbox_rx,
            broker: Arc::clone(&self.inner),
        }
    }

    fn spawn_tenant(&self, tenant_id: &str) -> TenantEntry {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = TenantState::new(
            tenant_id,
            Arc::clone(&self.inner.connector),
            Arc::clone(&self.inner.compiler),
            events_tx,
        );
        tokio::spawn(run_tenant(state, commands_rx, events_rx));
        TenantEntry {
            commands: commands_tx,
            subscribers: 0,
        }
    }

    /// Tenants with a running actor.
    pub fn tenant_count(&self) -> usize {
        self.inner.tenants.lock().expect("Broker lock poisoned").len()
    }

    /// Subscribers attached to `tenant_id`.
    pub fn subscriber_count(&self, tenant_id: &str) -> usize {
        self.inner
            .tenants
            .lock()
            .expect("Broker lock poisoned")
            .get(tenant_id)
            .map_or(0, |e| e.subscribers)
    }

    /// Sends every tenant with subscribers its current active target set.
    pub fn reconcile(&self) {
        let tenants = self.inner.tenants.lock().expect("Broker lock poisoned");
        for (tenant_id, entry) in tenants.iter().filter(|(_, e)| e.subscribers > 0) {
            let urls = self.inner.resolver.active_urls(tenant_id);
            if entry.commands.send(TenantCommand::Reconcile { urls }).is_err() {
                log::warn!("Tenant {} actor is gone; reconciliation skipped", tenant_id);
            }
        }
    }

    /// Drops tenants without subscribers, stopping their actors.
    pub fn sweep(&self) {
        let mut tenants = self.inner.tenants.lock().expect("Broker lock poisoned");
        tenants.retain(|tenant_id, entry| {
            if entry.subscribers == 0 {
                log::info!("Sweeping idle tenant {}", tenant_id);
            }
            entry.subscribers > 0
        });
    }

    /// Follows resolver changes and the reconciliation tick until `stop`.
    pub fn start(&self) -> bool {
        let token = {
            let mut running = self.inner.running.lock().expect("Broker lock poisoned");
            if running.is_some() {
                return false;
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };

        let broker = self.clone();
        let mut changes = self.inner.resolver.subscribe_changes();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.inner.config.reconcile_interval());
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(()) | Err(RecvError::Lagged(_)) => broker.reconcile(),
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        broker.sweep();
                        broker.reconcile();
                    }
                }
            }
            log::info!("Event broker stopped.");
        });
        true
    }

    /// Stops the reconciliation loop and forgets every tenant; each actor
    /// ends once its last subscriber handle is dropped.
    pub fn stop(&self) {
        if let Some(token) = self.inner.running.lock().expect("Broker lock poisoned").take() {
            token.cancel();
        }
        self.inner.tenants.lock().expect("Broker lock poisoned").clear();
    }
}

/// # Subscriber Handle
///
/// One frontend connection. Requests go to the tenant actor; replies and
/// events come back through `recv`. Dropping the handle disconnects.
pub struct SubscriberHandle {
    client_id: u64,
    tenant_id: String,
    commands: mpsc::UnboundedSender<TenantCommand>,
    outbox_tx: mpsc::UnboundedSender<ClientMessage>,
    outbox_rx: mpsc::UnboundedReceiver<ClientMessage>,
    broker: Arc<BrokerInner>,
}

impl SubscriberHandle {
    /// Process-wide connection id.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Tenant this connection belongs to.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Requests a subscription; the answer arrives through `recv`.
    pub fn subscribe(&self, topic: &str, limit: Option<u64>) {
        let _ = self.commands.send(TenantCommand::Subscribe {
            client_id: self.client_id,
            topic: topic.to_string(),
            limit,
        });
    }

    /// Requests removal of a subscription.
    pub fn unsubscribe(&self, subscription_id: u64) {
        let _ = self.commands.send(TenantCommand::Unsubscribe {
            client_id: self.client_id,
            subscription_id,
        });
    }

    /// Parses one text frame from the client and dispatches it.
    pub fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(ClientRequest::Subscribe { topic, limit }) => self.subscribe(&topic, limit),
            Ok(ClientRequest::Unsubscribe { subscription_id }) => self.unsubscribe(subscription_id),
            Err(e) => {
                log::debug!("Client {} sent malformed frame: {}", self.client_id, e);
                let _ = self
                    .outbox_tx
                    .send(ProtocolError::Malformed(e.to_string()).to_message(None, None));
            }
        }
    }

    /// Next message for the client.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.outbox_rx.recv().await
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(TenantCommand::Disconnect {
            client_id: self.client_id,
        });
        let mut tenants = self.broker.tenants.lock().expect("Broker lock poisoned");
        if let Some(entry) = tenants.get_mut(&self.tenant_id) {
            // A swept and recreated tenant has a different actor.
            if entry.commands.same_channel(&self.commands) {
                entry.subscribers = entry.subscribers.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::ErrorCode;
    use crate::broker::target::{TargetEvent, TargetLink};
    use crate::configs::HealthConfig;
    use crate::core::health::{HealthMonitor, Prober};
    use crate::core::predicate::SimpleQueryCompiler;
    use crate::core::router_cache::RouterCache;
    use crate::registry::{MemoryCoordinationStore, MemoryPeerDirectory, MemoryServiceRegistry};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Up;

    #[async_trait]
    impl Prober for Up {
        async fn probe(&self, _url: &str) -> bool {
            true
        }
    }

    struct NullConnector;

    impl Connector for NullConnector {
        fn open(&self, _url: &str, _generation: u64, _events: mpsc::UnboundedSender<TargetEvent>) -> TargetLink {
            let (tx, _rx) = mpsc::unbounded_channel();
            TargetLink::new(tx, CancellationToken::new())
        }
    }

    fn broker() -> EventBroker {
        let registry = Arc::new(MemoryServiceRegistry::new());
        let health = Arc::new(HealthMonitor::new(HealthConfig::default(), registry.clone(), Arc::new(Up)));
        let resolver = Arc::new(ActiveTargetResolver::new(
            registry,
            Arc::new(MemoryPeerDirectory::new()),
            Arc::new(MemoryCoordinationStore::new()),
            health,
            RouterCache::with_ttl(Duration::from_secs(60), None),
        ));
        EventBroker::new(
            BrokerConfig::default(),
            resolver,
            Arc::new(NullConnector),
            Arc::new(SimpleQueryCompiler),
        )
    }

    #[tokio::test]
    async fn test_subscribe_roundtrip_through_actor() {
        let broker = broker();
        let mut client = broker.client("t1", ClientFormat::Current);

        client.handle_text(r#"{"type":"subscribe","topic":"hub/led/*/state"}"#);
        assert_eq!(client.recv().await, Some(ClientMessage::SubscribeAck { subscription_id: 1 }));

        client.handle_text(r#"{"type":"unsubscribe","subscriptionId":1}"#);
        assert_eq!(client.recv().await, Some(ClientMessage::UnsubscribeAck { subscription_id: 1 }));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error() {
        let broker = broker();
        let mut client = broker.client("t1", ClientFormat::Current);

        client.handle_text("{not json");

        assert!(matches!(
            client.recv().await,
            Some(ClientMessage::Error { code: ErrorCode::MalformedMessage, .. })
        ));
    }

    #[tokio::test]
    async fn test_idle_tenant_is_swept() {
        let broker = broker();
        let a = broker.client("t1", ClientFormat::Current);
        let b = broker.client("t1", ClientFormat::Legacy);
        assert_eq!(broker.subscriber_count("t1"), 2);

        drop(a);
        broker.sweep();
        assert_eq!(broker.tenant_count(), 1);

        drop(b);
        assert_eq!(broker.subscriber_count("t1"), 0);
        broker.sweep();
        assert_eq!(broker.tenant_count(), 0);
    }
}
