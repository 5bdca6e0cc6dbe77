//! Publish Gate
//!
//! Composition root: wires the store, clock, rate limit registry, usage
//! recorder, posting queue, dispatcher and SLO aggregator together, and owns
//! the background tasks (one dispatch loop per platform plus an alert monitor).

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{Config, PlatformLimit};
use crate::error::{GateError, GateResult};
use crate::metrics;
use crate::queue::{
    Dispatcher, DispatcherConfig, HttpPlatformClient, NewQueueItem, PlatformClients,
    PostingQueue, QueueItem,
};
use crate::rate_limit::{LimitDefaults, RateLimitRegistry};
use crate::slo::{self, HealthStatus, SloAggregator, SloSnapshot, DEFAULT_ERROR_RATE_WINDOW_MINUTES};
use crate::store::{FileStore, MemoryStore, Store};
use crate::usage::UsageRecorder;

/// Runtime settings for a [`PublishGate`]
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub limits: LimitDefaults,
    /// Windows configured at startup
    pub presets: BTreeMap<String, PlatformLimit>,
    pub dispatcher: DispatcherConfig,
    pub error_rate_window_minutes: u32,
    pub alert_interval: Duration,
    pub usage_retention: chrono::Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            limits: LimitDefaults::default(),
            presets: BTreeMap::new(),
            dispatcher: DispatcherConfig::default(),
            error_rate_window_minutes: DEFAULT_ERROR_RATE_WINDOW_MINUTES,
            alert_interval: Duration::from_secs(60),
            usage_retention: chrono::Duration::days(8),
        }
    }
}

impl From<&Config> for GateSettings {
    fn from(config: &Config) -> Self {
        Self {
            limits: config.limit_defaults(),
            presets: config.limits.platforms.clone(),
            dispatcher: config.dispatcher_config(),
            error_rate_window_minutes: config.slo.error_rate_window_minutes,
            alert_interval: Duration::from_secs(config.slo.alert_interval_secs),
            usage_retention: config.usage_retention(),
        }
    }
}

/// Open the store backend selected by the configuration
pub async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match config.store.backend.as_str() {
        "memory" => {
            warn!("Using in-memory store; state will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        _ => {
            let path = config.store_path();
            let store = FileStore::open(&path)
                .await
                .with_context(|| format!("Failed to open store at {:?}", path))?;
            Ok(Arc::new(store))
        }
    }
}

/// One [`HttpPlatformClient`] per configured endpoint
pub fn build_clients(config: &Config) -> PlatformClients {
    let mut clients = PlatformClients::new();
    for (platform, client) in &config.clients {
        clients.insert(platform, Arc::new(HttpPlatformClient::new(platform, client.clone())));
    }
    clients
}

/// Body of the health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub metrics: SloSnapshot,
}

/// The assembled admission and publishing core
pub struct PublishGate {
    settings: GateSettings,
    clock: Arc<dyn Clock>,
    registry: Arc<RateLimitRegistry>,
    recorder: UsageRecorder,
    queue: Arc<PostingQueue>,
    dispatcher: Arc<Dispatcher>,
    slo: SloAggregator,
    clients: PlatformClients,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PublishGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishGate")
            .field("settings", &self.settings)
            .field("clients", &self.clients)
            .finish()
    }
}

impl PublishGate {
    /// Load persisted state, apply presets and recover interrupted items.
    ///
    /// Background tasks are not started; call [`PublishGate::start`].
    pub async fn open(
        settings: GateSettings,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        clients: PlatformClients,
    ) -> GateResult<Arc<Self>> {
        let recorder = UsageRecorder::new(Arc::clone(&store), Arc::clone(&clock));
        let registry = Arc::new(
            RateLimitRegistry::load(
                Arc::clone(&store),
                Arc::clone(&clock),
                recorder.clone(),
                settings.limits,
            )
            .await?,
        );

        for (platform, preset) in &settings.presets {
            registry
                .configure(platform, preset.window_seconds, preset.max_actions)
                .await?;
        }

        let queue = Arc::new(PostingQueue::load(Arc::clone(&store), Arc::clone(&clock)).await?);
        queue.recover_in_flight(&settings.dispatcher.retry).await?;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            clients.clone(),
            Arc::clone(&clock),
            settings.dispatcher.clone(),
        ));
        let slo = SloAggregator::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&clock),
            settings.error_rate_window_minutes,
        );
        let (shutdown, _) = watch::channel(false);

        info!(
            platforms = ?clients.platforms(),
            presets = settings.presets.len(),
            "Publish gate opened"
        );

        Ok(Arc::new(Self {
            settings,
            clock,
            registry,
            recorder,
            queue,
            dispatcher,
            slo,
            clients,
            started_at: Instant::now(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn registry(&self) -> &Arc<RateLimitRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    pub fn queue(&self) -> &Arc<PostingQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn slo(&self) -> &SloAggregator {
        &self.slo
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Enqueue an item for a platform with a registered client
    pub async fn enqueue(&self, request: NewQueueItem) -> GateResult<QueueItem> {
        if !self.clients.contains(&request.platform) {
            return Err(GateError::UnknownPlatform(request.platform));
        }
        self.queue.enqueue(request).await
    }

    /// Clear a dispatch halt after the store is reachable again.
    ///
    /// Publish outcomes held during the outage are recorded first; if the
    /// store is still down the halt stays in place and the error is returned.
    pub async fn resume_all(&self) -> GateResult<bool> {
        let settled = self.dispatcher.settle_pending().await?;
        if settled > 0 {
            info!(settled, "Recorded publish outcomes held during store outage");
        }
        let resumed = self.queue.resume_all().await;
        if resumed {
            metrics::STORE_AVAILABLE.set(1);
        }
        Ok(resumed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn health(&self) -> HealthReport {
        let snapshot = self.slo.snapshot().await;
        let status = if snapshot.dispatch_halted.is_some() {
            HealthStatus::Critical
        } else {
            snapshot.status
        };
        HealthReport {
            status,
            uptime_secs: self.uptime().as_secs(),
            metrics: snapshot,
        }
    }

    /// One pass of the alert monitor: evaluate alerts, refresh gauges, prune usage
    pub async fn run_maintenance(&self) {
        let alerts = self.slo.alerts().await;
        slo::log_alerts(&alerts);

        for (platform, pct) in self.registry.saturations() {
            metrics::set_saturation(&platform, pct);
        }

        if let Err(e) = self.recorder.prune(self.settings.usage_retention).await {
            warn!(error = %e, "Usage pruning failed");
        }
    }

    /// Start the dispatch loops and the alert monitor
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        tasks.extend(self.dispatcher.spawn_all(self.shutdown.subscribe()));

        let gate = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gate.settings.alert_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => gate.run_maintenance().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        info!(tasks = tasks.len(), "Background tasks started");
    }

    /// Signal all background tasks to stop and wait for them
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Publish gate stopped");
    }
}
