//! # WebSocket Connector
//!
//! Opens the event channel of a target over WebSocket. The target base URL
//! is rewritten `http -> ws`, `https -> wss` and joined with the configured
//! event path.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::broker::protocol::{BackendMessage, BackendRequest};
use crate::broker::target::{Connector, TargetEvent, TargetEventKind, TargetLink};
use crate::configs::BrokerConfig;

/// `Connector` backed by `tokio-tungstenite`.
pub struct WsConnector {
    event_path: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for `event_path` with a connect timeout.
    pub fn new(event_path: &str, connect_timeout: Duration) -> Self {
        Self {
            event_path: event_path.to_string(),
            connect_timeout,
        }
    }

    /// Creates a connector from the broker section of the configuration.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.event_path, config.connect_timeout())
    }
}

/// Builds the event endpoint URL for a target base URL.
pub fn event_url(base: &str, event_path: &str) -> Result<Url, String> {
    let mut url = Url::parse(base).map_err(|e| format!("invalid target url {}: {}", base, e))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(format!("unsupported scheme {} in {}", other, base)),
    };
    url.set_scheme(scheme)
        .map_err(|_| format!("cannot switch {} to {}", base, scheme))?;

    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        event_path.trim_start_matches('/')
    );
    url.set_path(&path);
    Ok(url)
}

impl Connector for WsConnector {
    fn open(&self, url: &str, generation: u64, events: mpsc::UnboundedSender<TargetEvent>) -> TargetLink {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let link = LinkTask {
            url: url.to_string(),
            generation,
            events,
        };
        tokio::spawn(link.run(
            event_url(url, &self.event_path),
            self.connect_timeout,
            outbox_rx,
            cancel.clone(),
        ));
        TargetLink::new(outbox_tx, cancel)
    }
}

struct LinkTask {
    url: String,
    generation: u64,
    events: mpsc::UnboundedSender<TargetEvent>,
}

impl LinkTask {
    fn emit(&self, kind: TargetEventKind) {
        let _ = self.events.send(TargetEvent {
            url: self.url.clone(),
            generation: self.generation,
            kind,
        });
    }

    async fn run(
        self,
        endpoint: Result<Url, String>,
        connect_timeout: Duration,
        mut outbox: mpsc::UnboundedReceiver<BackendRequest>,
        cancel: CancellationToken,
    ) {
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::error!("{}", e);
                self.emit(TargetEventKind::Closed);
                return;
            }
        };

        log::info!("Connecting to target events: {}", endpoint);
        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("Connect to {} cancelled", endpoint);
                self.emit(TargetEventKind::Closed);
                return;
            }
            res = tokio::time::timeout(connect_timeout, connect_async(endpoint.as_str())) => res,
        };
        let ws_stream = match connected {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                log::warn!("Failed to connect to {}: {}", endpoint, e);
                self.emit(TargetEventKind::Closed);
                return;
            }
            Err(_) => {
                log::warn!("Connect to {} timed out after {:?}", endpoint, connect_timeout);
                self.emit(TargetEventKind::Closed);
                return;
            }
        };

        log::info!("Connected to target events: {}", endpoint);
        self.emit(TargetEventKind::Opened);
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = write.close().await;
                    break;
                }
                Some(request) = outbox.recv() => {
                    let text = match serde_json::to_string(&request) {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("Failed to encode {:?}: {}", request, e);
                            continue;
                        }
                    };
                    log::debug!("Sending to {}: {}", self.url, text);
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        log::warn!("Send to {} failed: {}", self.url, e);
                        break;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<BackendMessage>(text.as_str()) {
                            Ok(message) => self.emit(TargetEventKind::Message(message)),
                            Err(e) => log::warn!("Unparseable message from {}: {}", self.url, e),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Target {} closed its event stream", self.url);
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("Target {} stream error: {}", self.url, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        self.emit(TargetEventKind::Closed);
    }
}
