//! # Target Health Monitor
//!
//! Keeps a hysteresis health state per target URL and refreshes it with a
//! periodic, concurrency-bounded probe loop.
//!
//! ## State machine
//!
//! Every record starts `Undetermined`. The very first observation decides the
//! bootstrap state immediately (`Up` on success, `Down` on failure). After
//! that a flip requires `healthy_threshold` consecutive successes or
//! `unhealthy_threshold` consecutive failures; results below the threshold
//! leave the status untouched, which damps flapping targets.
//!
//! ## Failure policy
//!
//! Probes never raise: timeouts, refused connections and non-200 answers are
//! all counted as failures. A registry outage skips the cycle and keeps the
//! previous records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{future, stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::configs::HealthConfig;
use crate::registry::ServiceRegistry;

/// Health status of one target URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Never observed.
    Undetermined,
    /// Answering probes.
    Up,
    /// Failing probes.
    Down,
    /// Recovering. Part of the status vocabulary shared with other
    /// components; the hysteresis machine itself never produces it.
    Rising,
}

impl HealthStatus {
    /// Whether a target in this state may receive traffic.
    ///
    /// `Undetermined` serves so that a gateway with probing disabled (or not
    /// yet run) still routes.
    pub fn is_serving(self) -> bool {
        matches!(self, HealthStatus::Up | HealthStatus::Undetermined)
    }
}

/// # Health Record
///
/// Hysteresis counters for a single target URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// Current status.
    pub status: HealthStatus,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Time of the last probe result of either kind.
    pub last_check_time: Option<DateTime<Utc>>,
    /// Time of the last successful probe.
    pub last_seen_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    healthy_threshold: u32,
    #[serde(skip)]
    unhealthy_threshold: u32,
}

impl HealthRecord {
    /// Creates an `Undetermined` record with the given thresholds (both clamped to ≥ 1).
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Undetermined,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_check_time: None,
            last_seen_time: None,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Records a successful probe.
    pub fn success(&mut self) {
        let now = Utc::now();
        self.last_check_time = Some(now);
        self.last_seen_time = Some(now);
        self.consecutive_failures = 0;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);

        if self.status == HealthStatus::Undetermined
            || self.consecutive_successes >= self.healthy_threshold
        {
            self.status = HealthStatus::Up;
        }
    }

    /// Records a failed probe.
    pub fn fail(&mut self) {
        self.last_check_time = Some(Utc::now());
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.status == HealthStatus::Undetermined
            || self.consecutive_failures >= self.unhealthy_threshold
        {
            self.status = HealthStatus::Down;
        }
    }
}

/// A liveness check against one target.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns `true` when the target answered healthy.
    async fn probe(&self, url: &str) -> bool;
}

/// # Health Monitor
///
/// Shared, read-mostly map of `HealthRecord`s plus the probing loop that
/// feeds it. Reads never wait on probes.
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<dyn ServiceRegistry>,
    prober: Arc<dyn Prober>,
    records: RwLock<HashMap<String, HealthRecord>>,
    running: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    /// Creates a monitor. Nothing is probed until `start` is called.
    pub fn new(
        config: HealthConfig,
        registry: Arc<dyn ServiceRegistry>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            config,
            registry,
            prober,
            records: RwLock::new(HashMap::new()),
            running: Mutex::new(None),
        }
    }

    /// Current status of `url`; `Undetermined` if it was never observed.
    pub fn status(&self, url: &str) -> HealthStatus {
        self.records
            .read()
            .expect("Health lock poisoned")
            .get(url)
            .map_or(HealthStatus::Undetermined, |r| r.status)
    }

    /// Shorthand for `status(url).is_serving()`.
    pub fn is_serving(&self, url: &str) -> bool {
        self.status(url).is_serving()
    }

    /// A copy of the record for `url`, if any.
    pub fn record(&self, url: &str) -> Option<HealthRecord> {
        self.records.read().expect("Health lock poisoned").get(url).cloned()
    }

    /// Feeds a successful observation of `url` into its state machine.
    pub fn record_success(&self, url: &str) {
        self.apply(url, true);
    }

    /// Feeds a failed observation of `url` into its state machine.
    pub fn record_failure(&self, url: &str) {
        self.apply(url, false);
    }

    fn apply(&self, url: &str, healthy: bool) {
        let mut records = self.records.write().expect("Health lock poisoned");
        let record = records.entry(url.to_string()).or_insert_with(|| {
            HealthRecord::new(self.config.healthy_threshold, self.config.unhealthy_threshold)
        });
        let before = record.status;
        if healthy {
            record.success();
        } else {
            record.fail();
        }
        if record.status != before {
            log::info!("Target {} health {:?} -> {:?}", url, before, record.status);
        }
    }

    /// Starts the probing loop. Returns `false` when probing is disabled or
    /// the loop is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.config.disabled {
            log::info!("Health monitor disabled; statuses stay at their last known values.");
            return false;
        }

        let mut running = self.running.lock().expect("Health lock poisoned");
        if running.is_some() {
            return false;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());
        drop(running);

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval());
            log::info!(
                "Health monitor started (interval {:?}, parallel {}).",
                monitor.config.interval(),
                monitor.config.max_parallel
            );
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Cancelling drops the cycle future, which aborts in-flight probes.
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = monitor.run_cycle() => {}
                        }
                    }
                }
            }
            log::info!("Health monitor stopped.");
        });
        true
    }

    /// Stops the probing loop and aborts any probe in flight.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().expect("Health lock poisoned").take() {
            token.cancel();
        }
    }

    /// Runs a single probe cycle over every registered target.
    pub async fn run_cycle(&self) {
        let targets = match self.registry.find_all().await {
            Ok(targets) => targets,
            Err(e) => {
                log::warn!("Health cycle skipped, registry unavailable: {}", e);
                return;
            }
        };

        let timeout = self.config.timeout();
        stream::iter(targets.into_iter().map(|t| t.url))
            .map(|url| {
                let prober = Arc::clone(&self.prober);
                async move {
                    let healthy = matches!(
                        tokio::time::timeout(timeout, prober.probe(&url)).await,
                        Ok(true)
                    );
                    (url, healthy)
                }
            })
            .buffer_unordered(self.config.max_parallel.max(1))
            .for_each(|(url, healthy)| {
                log::debug!("Probe {} -> {}", url, if healthy { "ok" } else { "failed" });
                self.apply(&url, healthy);
                future::ready(())
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryServiceRegistry;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedProber {
        healthy: HashSet<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, url: &str) -> bool {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.healthy.contains(url)
        }
    }

    struct SlowProber;

    #[async_trait]
    impl Prober for SlowProber {
        async fn probe(&self, _url: &str) -> bool {
            tokio::time::sleep(Duration::from_secs(60)).await;
            true
        }
    }

    fn config(unhealthy: u32) -> HealthConfig {
        HealthConfig {
            healthy_threshold: 2,
            unhealthy_threshold: unhealthy,
            ..HealthConfig::default()
        }
    }

    async fn registry_with(urls: &[&str]) -> Arc<MemoryServiceRegistry> {
        let registry = Arc::new(MemoryServiceRegistry::new());
        for url in urls {
            registry.add("worker", url, "v1").await.unwrap();
        }
        registry
    }

    #[test]
    fn test_first_observation_decides_bootstrap() {
        // Thresholds far above one call: the first result must still decide.
        let mut up = HealthRecord::new(10, 10);
        up.success();
        assert_eq!(up.status, HealthStatus::Up);

        let mut down = HealthRecord::new(10, 10);
        down.fail();
        assert_eq!(down.status, HealthStatus::Down);
    }

    #[test]
    fn test_hysteresis_down_then_up() {
        let mut record = HealthRecord::new(2, 2);
        record.fail();
        record.fail();
        assert_eq!(record.status, HealthStatus::Down);

        record.success();
        assert_eq!(record.status, HealthStatus::Down);
        record.success();
        assert_eq!(record.status, HealthStatus::Up);
    }

    #[test]
    fn test_hysteresis_up_then_down() {
        let mut record = HealthRecord::new(2, 2);
        record.success();
        record.success();
        assert_eq!(record.status, HealthStatus::Up);

        record.fail();
        assert_eq!(record.status, HealthStatus::Up);
        record.fail();
        assert_eq!(record.status, HealthStatus::Down);
    }

    #[test]
    fn test_interleaved_results_reset_counters() {
        let mut record = HealthRecord::new(2, 2);
        record.success();
        record.fail();
        record.success();
        record.fail();
        assert_eq!(record.status, HealthStatus::Up);
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.consecutive_successes, 0);
        assert!(record.last_seen_time.is_some());
    }

    #[test]
    fn test_serving_statuses() {
        assert!(HealthStatus::Up.is_serving());
        assert!(HealthStatus::Undetermined.is_serving());
        assert!(!HealthStatus::Down.is_serving());
        assert!(!HealthStatus::Rising.is_serving());
    }

    #[tokio::test]
    async fn test_cycle_probes_every_target() {
        let registry = registry_with(&["http://a", "http://b"]).await;
        let prober = Arc::new(FixedProber {
            healthy: HashSet::from(["http://a".to_string()]),
            calls: AtomicUsize::new(0),
        });
        let monitor = HealthMonitor::new(config(2), registry, prober.clone());

        monitor.run_cycle().await;

        assert_eq!(prober.calls.load(Ordering::Relaxed), 2);
        assert_eq!(monitor.status("http://a"), HealthStatus::Up);
        assert_eq!(monitor.status("http://b"), HealthStatus::Down);
        assert_eq!(monitor.status("http://unknown"), HealthStatus::Undetermined);
    }

    #[tokio::test]
    async fn test_registry_outage_keeps_previous_state() {
        let registry = registry_with(&["http://a"]).await;
        let prober = Arc::new(FixedProber {
            healthy: HashSet::new(),
            calls: AtomicUsize::new(0),
        });
        let monitor = HealthMonitor::new(config(2), registry.clone(), prober.clone());
        monitor.record_success("http://a");

        registry.set_unavailable(true);
        monitor.run_cycle().await;

        assert_eq!(prober.calls.load(Ordering::Relaxed), 0);
        assert_eq!(monitor.status("http://a"), HealthStatus::Up);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let registry = registry_with(&["http://slow"]).await;
        let monitor = HealthMonitor::new(config(2), registry, Arc::new(SlowProber));

        monitor.run_cycle().await;

        assert_eq!(monitor.status("http://slow"), HealthStatus::Down);
    }

    #[tokio::test]
    async fn test_disabled_monitor_never_starts() {
        let registry = registry_with(&["http://a"]).await;
        let prober = Arc::new(FixedProber {
            healthy: HashSet::new(),
            calls: AtomicUsize::new(0),
        });
        let monitor = Arc::new(HealthMonitor::new(
            HealthConfig {
                disabled: true,
                ..config(2)
            },
            registry,
            prober.clone(),
        ));

        assert!(!monitor.start());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(prober.calls.load(Ordering::Relaxed), 0);
        assert_eq!(monitor.status("http://a"), HealthStatus::Undetermined);
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let registry = registry_with(&["http://a"]).await;
        let prober = Arc::new(FixedProber {
            healthy: HashSet::from(["http://a".to_string()]),
            calls: AtomicUsize::new(0),
        });
        let monitor = Arc::new(HealthMonitor::new(
            HealthConfig {
                interval_ms: 10,
                ..config(2)
            },
            registry,
            prober.clone(),
        ));

        assert!(monitor.start());
        assert!(!monitor.start());
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop();

        assert_eq!(monitor.status("http://a"), HealthStatus::Up);
        let calls = prober.calls.load(Ordering::Relaxed);
        assert!(calls >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prober.calls.load(Ordering::Relaxed), calls);
    }
}
