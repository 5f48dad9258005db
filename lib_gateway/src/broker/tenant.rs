//! # Tenant Actor
//!
//! Everything the broker knows about one tenant (its subscribers and its
//! target connections) is owned by `TenantState` and only touched from the
//! tenant's actor task. Subscriber requests, reconciliation and backend link
//! events all arrive as messages, so no two mutations ever interleave.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::protocol::{BackendMessage, ClientFormat, ClientMessage, ProtocolError};
use crate::broker::subscription::SubscriberConnection;
use crate::broker::target::{Connector, PendingAck, TargetConnection, TargetEvent, TargetEventKind};
use crate::core::predicate::PredicateCompiler;
use crate::core::topic::TopicPattern;

/// Messages accepted by a tenant actor.
pub enum TenantCommand {
    /// A subscriber socket attached.
    Connect {
        /// Connection id.
        client_id: u64,
        /// Event rendering.
        format: ClientFormat,
        /// Outbound queue of the socket.
        outbox: mpsc::UnboundedSender<ClientMessage>,
    },
    /// A subscriber socket went away.
    Disconnect {
        /// Connection id.
        client_id: u64,
    },
    /// `subscribe{topic, limit?}`.
    Subscribe {
        /// Connection id.
        client_id: u64,
        /// Pattern with optional query.
        topic: String,
        /// Delivery cap.
        limit: Option<u64>,
    },
    /// `unsubscribe{subscriptionId}`.
    Unsubscribe {
        /// Connection id.
        client_id: u64,
        /// Visible subscription id.
        subscription_id: u64,
    },
    /// Align target connections with this URL set.
    Reconcile {
        /// Active target URLs.
        urls: Vec<String>,
    },
}

/// # Tenant State
pub struct TenantState {
    tenant_id: String,
    connector: Arc<dyn Connector>,
    compiler: Arc<dyn PredicateCompiler>,
    subscribers: Vec<SubscriberConnection>,
    targets: HashMap<String, TargetConnection>,
    events: mpsc::UnboundedSender<TargetEvent>,
    next_generation: u64,
}

impl TenantState {
    /// Creates an empty tenant. Link events are reported on `events`.
    pub fn new(
        tenant_id: &str,
        connector: Arc<dyn Connector>,
        compiler: Arc<dyn PredicateCompiler>,
        events: mpsc::UnboundedSender<TargetEvent>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            connector,
            compiler,
            subscribers: Vec::new(),
            targets: HashMap::new(),
            events,
            next_generation: 1,
        }
    }

    /// Tenant id.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Attached subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// URLs with a live target connection, sorted.
    pub fn target_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.targets.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// The connection for `url`, if any.
    pub fn target(&self, url: &str) -> Option<&TargetConnection> {
        self.targets.get(url)
    }

    fn subscriber(&mut self, client_id: u64) -> Option<&mut SubscriberConnection> {
        self.subscribers.iter_mut().find(|s| s.client_id == client_id)
    }

    /// Applies one command.
    pub fn handle(&mut self, command: TenantCommand) {
        match command {
            TenantCommand::Connect {
                client_id,
                format,
                outbox,
            } => self.connect(client_id, format, outbox),
            TenantCommand::Disconnect { client_id } => self.disconnect(client_id),
            TenantCommand::Subscribe {
                client_id,
                topic,
                limit,
            } => self.subscribe(client_id, &topic, limit),
            TenantCommand::Unsubscribe {
                client_id,
                subscription_id,
            } => self.unsubscribe(client_id, subscription_id),
            TenantCommand::Reconcile { urls } => self.reconcile(&urls),
        }
    }

    /// Attaches a subscriber.
    pub fn connect(&mut self, client_id: u64, format: ClientFormat, outbox: mpsc::UnboundedSender<ClientMessage>) {
        log::info!("Tenant {}: client {} connected ({:?})", self.tenant_id, client_id, format);
        self.subscribers
            .push(SubscriberConnection::new(client_id, format, outbox));
    }

    /// Detaches a subscriber and releases its backend subscriptions. The
    /// last subscriber leaving closes every target connection.
    pub fn disconnect(&mut self, client_id: u64) {
        let Some(position) = self.subscribers.iter().position(|s| s.client_id == client_id) else {
            return;
        };
        let subscriber = self.subscribers.remove(position);
        for subscription in subscriber.subscriptions() {
            self.relay_unsubscribe(subscription.internal_id);
        }
        log::info!("Tenant {}: client {} disconnected", self.tenant_id, client_id);

        if self.subscribers.is_empty() && !self.targets.is_empty() {
            log::info!("Tenant {}: no subscribers left, closing {} targets", self.tenant_id, self.targets.len());
            self.shutdown();
        }
    }

    /// Handles `subscribe{topic, limit?}` for a client.
    pub fn subscribe(&mut self, client_id: u64, topic: &str, limit: Option<u64>) {
        let compiler = Arc::clone(&self.compiler);
        let Some(subscriber) = self.subscriber(client_id) else {
            return;
        };

        let compiled = TopicPattern::parse(topic)
            .map_err(ProtocolError::from)
            .and_then(|pattern| {
                let predicate = match pattern.query() {
                    Some(query) => Some(compiler.compile(query)?),
                    None => None,
                };
                Ok((pattern, predicate))
            });
        let (pattern, predicate) = match compiled {
            Ok(compiled) => compiled,
            Err(e) => {
                log::debug!("Client {} subscribe '{}' refused: {}", client_id, topic, e);
                subscriber.send(e.to_message(Some(topic), None));
                return;
            }
        };

        let bare = pattern.bare().to_string();
        let subscription = subscriber.add(pattern, limit, predicate);
        let (id, internal_id) = (subscription.id, subscription.internal_id);
        subscriber.send(ClientMessage::SubscribeAck { subscription_id: id });

        for target in self.targets.values_mut() {
            target.subscribe(internal_id, &bare);
        }
    }

    /// Handles `unsubscribe{subscriptionId}` for a client.
    pub fn unsubscribe(&mut self, client_id: u64, subscription_id: u64) {
        let Some(subscriber) = self.subscriber(client_id) else {
            return;
        };
        match subscriber.remove(subscription_id) {
            Some(subscription) => {
                subscriber.send(ClientMessage::UnsubscribeAck { subscription_id });
                self.relay_unsubscribe(subscription.internal_id);
            }
            None => subscriber.send(
                ProtocolError::UnknownSubscription(subscription_id).to_message(None, Some(subscription_id)),
            ),
        }
    }

    fn relay_unsubscribe(&mut self, internal_id: Uuid) {
        for target in self.targets.values_mut() {
            target.unsubscribe(internal_id);
        }
    }

    fn replay(&self) -> Vec<PendingAck> {
        self.subscribers
            .iter()
            .flat_map(|s| s.subscriptions())
            .map(|s| PendingAck {
                internal_id: s.internal_id,
                topic: s.pattern.bare().to_string(),
            })
            .collect()
    }

    /// Closes connections to URLs outside `urls` and opens the missing ones.
    pub fn reconcile(&mut self, urls: &[String]) {
        let stale: Vec<String> = self
            .targets
            .keys()
            .filter(|url| !urls.contains(*url))
            .cloned()
            .collect();
        for url in stale {
            if let Some(mut target) = self.targets.remove(&url) {
                log::info!("Tenant {}: closing target {}", self.tenant_id, url);
                target.close();
            }
        }

        if self.subscribers.is_empty() {
            return;
        }
        for url in urls {
            if self.targets.contains_key(url) {
                continue;
            }
            let generation = self.next_generation;
            self.next_generation += 1;
            log::info!("Tenant {}: opening target {} (generation {})", self.tenant_id, url, generation);
            let target = TargetConnection::open(
                url,
                generation,
                self.replay(),
                self.connector.as_ref(),
                self.events.clone(),
            );
            self.targets.insert(url.clone(), target);
        }
    }

    /// Applies a link event; events from superseded connections are dropped.
    pub fn on_target_event(&mut self, event: TargetEvent) {
        let current = self
            .targets
            .get(&event.url)
            .is_some_and(|t| t.generation() == event.generation);
        if !current {
            log::trace!("Dropping stale event from {} generation {}", event.url, event.generation);
            return;
        }

        match event.kind {
            TargetEventKind::Opened => {
                if let Some(target) = self.targets.get_mut(&event.url) {
                    target.on_open();
                }
            }
            TargetEventKind::Closed => {
                if let Some(mut target) = self.targets.remove(&event.url) {
                    log::warn!("Tenant {}: target {} disconnected", self.tenant_id, event.url);
                    target.close();
                }
            }
            TargetEventKind::Message(message) => self.on_backend_message(&event.url, message),
        }
    }

    fn on_backend_message(&mut self, url: &str, message: BackendMessage) {
        match message {
            BackendMessage::Event {
                topic,
                timestamp,
                data,
            } => self.fan_out(&topic, &timestamp, &data),
            BackendMessage::SubscribeAck { subscription_id } => {
                let subscribers = &self.subscribers;
                if let Some(target) = self.targets.get_mut(url) {
                    target.on_subscribe_ack(subscription_id, |internal_id| {
                        subscribers.iter().any(|s| s.find_internal(internal_id).is_some())
                    });
                }
            }
            BackendMessage::UnsubscribeAck { subscription_id } => {
                log::debug!("Target {} released subscription {}", url, subscription_id);
            }
            BackendMessage::Error {
                code,
                topic,
                message,
            } => {
                let rejected = self
                    .targets
                    .get_mut(url)
                    .and_then(|t| t.on_error(topic.as_deref()));
                match rejected {
                    Some(pending) => self.reject(pending, &message),
                    None => log::warn!("Target {} error {}: {}", url, code, message),
                }
            }
        }
    }

    fn reject(&self, pending: PendingAck, reason: &str) {
        for subscriber in &self.subscribers {
            if let Some(subscription) = subscriber.find_internal(pending.internal_id) {
                let error = ProtocolError::SubscribeRejected {
                    message: reason.to_string(),
                };
                subscriber.send(error.to_message(Some(&pending.topic), Some(subscription.id)));
                return;
            }
        }
    }

    /// Delivers one backend event to every matching subscription.
    pub fn fan_out(&mut self, topic: &str, timestamp: &Value, data: &Value) {
        let mut exhausted = Vec::new();
        for subscriber in &mut self.subscribers {
            exhausted.extend(subscriber.fan_out(topic, timestamp, data));
        }
        for internal_id in exhausted {
            self.relay_unsubscribe(internal_id);
        }
    }

    /// Closes every target connection.
    pub fn shutdown(&mut self) {
        for (_, mut target) in self.targets.drain() {
            target.close();
        }
    }
}

/// Runs a tenant actor until its command channel closes.
pub async fn run_tenant(
    mut state: TenantState,
    mut commands: mpsc::UnboundedReceiver<TenantCommand>,
    mut events: mpsc::UnboundedReceiver<TargetEvent>,
) {
    log::debug!("Tenant {} actor started", state.tenant_id());
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => state.handle(command),
                None => break,
            },
            Some(event) = events.recv() => state.on_target_event(event),
        }
    }
    state.shutdown();
    log::info!("Tenant {} actor stopped", state.tenant_id());
}
