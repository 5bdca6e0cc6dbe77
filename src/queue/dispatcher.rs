//! Dispatcher
//!
//! Moves ready items from the posting queue to their platform client, one
//! loop per platform. Each iteration is a single [`Dispatcher::step`]:
//! admission first, then the publish call under a timeout, then the state
//! transition that records the outcome.
//!
//! A publish outcome that cannot be recorded because the store is down is
//! held per platform and recorded before anything else on that platform, so
//! an item never stays in `posting` once the store is back.
//!
//! Backoff is applied by rescheduling items, never by sleeping inside a step.
//! The loop itself only sleeps between steps, and never longer than the poll
//! interval, so pausing a platform or shutting down takes effect promptly.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::client::{PlatformClients, PublishError};
use super::item::QueueState;
use super::posting_queue::{FailureKind, PostingQueue};
use super::retry::RetryConfig;
use crate::clock::Clock;
use crate::error::{GateError, GateResult};
use crate::metrics;
use crate::rate_limit::{Admission, RateLimitRegistry};

/// Dispatcher tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub retry: RetryConfig,

    /// Upper bound on one publish call; exceeding it is a retryable failure
    pub publish_timeout: Duration,

    /// Longest sleep between loop iterations
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            publish_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Result of one dispatch step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Platform paused or dispatch halted; nothing was touched
    Paused,

    /// An earlier denial is still in effect, or `acquire` was just denied
    Throttled { retry_after: Duration },

    /// No item is ready; `next_ready_at` is the earliest scheduled one, if any
    Idle { next_ready_at: Option<DateTime<Utc>> },

    /// Item published
    Posted { id: String, remote_id: Option<String> },

    /// Publish failed and the item was rescheduled
    Retrying {
        id: String,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },

    /// Publish failed and the item is now `failed`
    Failed { id: String, attempts: u32 },

    /// Item changed state after admission; the quota was given back
    Released { id: String },
}

impl StepOutcome {
    /// Whether the step moved an item
    pub fn made_progress(&self) -> bool {
        matches!(
            self,
            StepOutcome::Posted { .. }
                | StepOutcome::Retrying { .. }
                | StepOutcome::Failed { .. }
                | StepOutcome::Released { .. }
        )
    }
}

/// How a finished publish call ended
#[derive(Debug, Clone)]
enum Settlement {
    Posted { remote_id: Option<String> },
    Failed { error: String, kind: FailureKind },
}

/// Publish outcome not yet recorded on its item
#[derive(Debug, Clone)]
struct PendingCommit {
    id: String,
    settlement: Settlement,
    elapsed: f64,
}

/// Per-platform dispatch driver
pub struct Dispatcher {
    registry: Arc<RateLimitRegistry>,
    queue: Arc<PostingQueue>,
    clients: PlatformClients,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    throttled_until: DashMap<String, DateTime<Utc>>,
    pending: DashMap<String, PendingCommit>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("clients", &self.clients)
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RateLimitRegistry>,
        queue: Arc<PostingQueue>,
        clients: PlatformClients,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            clients,
            clock,
            config,
            throttled_until: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one dispatch step for `platform`
    pub async fn step(&self, platform: &str) -> GateResult<StepOutcome> {
        if self.queue.halted_reason().await.is_none() {
            if let Some((_, pending)) = self.pending.remove(platform) {
                return self.settle(platform, pending).await;
            }
        }

        if self.queue.is_platform_paused(platform).await {
            return Ok(StepOutcome::Paused);
        }

        let now = self.clock.now();
        let throttled = self.throttled_until.get(platform).map(|u| *u);
        if let Some(until) = throttled {
            if until > now {
                return Ok(StepOutcome::Throttled {
                    retry_after: (until - now).to_std().unwrap_or(Duration::ZERO),
                });
            }
            self.throttled_until.remove(platform);
        }

        let Some(item) = self.queue.next_ready(platform, now).await else {
            return Ok(StepOutcome::Idle {
                next_ready_at: self.queue.next_scheduled(platform).await,
            });
        };

        let client = self
            .clients
            .get(platform)
            .ok_or_else(|| GateError::UnknownPlatform(platform.to_string()))?;

        if let Admission::Denied { retry_after, .. } = self.registry.acquire(platform, 1).await? {
            let wait = chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::zero());
            let until = now + wait;
            self.throttled_until.insert(platform.to_string(), until);
            info!(
                target: "audit",
                event = "queue.rate_limited",
                platform,
                id = %item.id,
                retry_after_ms = retry_after.as_millis() as u64,
                "Dispatch rate limited"
            );
            return Ok(StepOutcome::Throttled { retry_after });
        }

        let item = match self.queue.begin_posting(&item.id).await {
            Ok(item) => item,
            Err(GateError::InvalidTransition { .. }) | Err(GateError::ItemNotFound(_)) => {
                self.registry.release(platform, 1).await?;
                debug!(platform, id = %item.id, "Item changed after admission, quota released");
                return Ok(StepOutcome::Released { id: item.id });
            }
            Err(e) => return Err(e),
        };

        let start = Instant::now();
        let result = match tokio::time::timeout(self.config.publish_timeout, client.publish(&item)).await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Retryable(format!(
                "publish timed out after {}s",
                self.config.publish_timeout.as_secs_f64()
            ))),
        };
        let elapsed = start.elapsed().as_secs_f64();

        let settlement = match result {
            Ok(receipt) => Settlement::Posted {
                remote_id: receipt.remote_id,
            },
            Err(err) => {
                let kind = match err {
                    PublishError::Retryable(_) => FailureKind::Retryable,
                    PublishError::Permanent(_) => FailureKind::Permanent,
                };
                Settlement::Failed {
                    error: err.message().to_string(),
                    kind,
                }
            }
        };
        self.settle(
            platform,
            PendingCommit {
                id: item.id,
                settlement,
                elapsed,
            },
        )
        .await
    }

    /// Record a publish outcome on its item. If the store is unreachable the
    /// outcome is kept and retried on the platform's next step.
    async fn settle(&self, platform: &str, pending: PendingCommit) -> GateResult<StepOutcome> {
        let result = match &pending.settlement {
            Settlement::Posted { remote_id } => {
                self.queue.mark_posted(&pending.id, remote_id.clone()).await
            }
            Settlement::Failed { error, kind } => {
                self.queue
                    .record_failure(&pending.id, error, *kind, &self.config.retry)
                    .await
            }
        };

        let item = match result {
            Ok(item) => item,
            Err(e) => {
                if e.is_store_unavailable() {
                    warn!(
                        platform,
                        id = %pending.id,
                        error = %e,
                        "Publish outcome not recorded, holding until the store is back"
                    );
                    self.pending.insert(platform.to_string(), pending);
                }
                return Err(e);
            }
        };

        let outcome = match item.state {
            QueueState::Posted => {
                metrics::record_publish(platform, "posted", pending.elapsed);
                StepOutcome::Posted {
                    id: item.id,
                    remote_id: item.remote_id,
                }
            }
            QueueState::Failed => {
                metrics::record_publish(platform, "failed", pending.elapsed);
                StepOutcome::Failed {
                    id: item.id,
                    attempts: item.attempts,
                }
            }
            _ => {
                metrics::record_publish(platform, "retry", pending.elapsed);
                StepOutcome::Retrying {
                    id: item.id,
                    attempts: item.attempts,
                    next_attempt_at: item.scheduled_at,
                }
            }
        };
        Ok(outcome)
    }

    /// Record every held publish outcome. Stops at the first store error,
    /// keeping the rest. Returns how many were recorded.
    pub async fn settle_pending(&self) -> GateResult<usize> {
        let platforms: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut settled = 0;
        for platform in platforms {
            if let Some((_, pending)) = self.pending.remove(&platform) {
                self.settle(&platform, pending).await?;
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Number of publish outcomes waiting on the store
    pub fn pending_commits(&self) -> usize {
        self.pending.len()
    }

    /// Sleep before the next step, bounded by the poll interval
    fn delay_after(&self, outcome: &StepOutcome) -> Duration {
        let poll = self.config.poll_interval;
        match outcome {
            StepOutcome::Paused => poll,
            StepOutcome::Throttled { retry_after } => (*retry_after).min(poll),
            StepOutcome::Idle {
                next_ready_at: Some(at),
            } => (*at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(poll),
            StepOutcome::Idle { next_ready_at: None } => poll,
            _ => Duration::ZERO,
        }
    }

    /// [`Dispatcher::step`], halting all dispatch if the store is unreachable
    pub async fn step_or_halt(&self, platform: &str) -> GateResult<StepOutcome> {
        let result = self.step(platform).await;
        if let Err(e) = &result {
            if e.is_store_unavailable() {
                self.halt_on_store_outage(platform, e).await;
            }
        }
        result
    }

    async fn halt_on_store_outage(&self, platform: &str, err: &GateError) {
        let reason = format!("store unavailable: {}", err);
        if self.queue.halt_all(&reason).await {
            metrics::DISPATCH_HALTS_TOTAL.inc();
            metrics::STORE_AVAILABLE.set(0);
            error!(
                target: "audit",
                event = "alert.store_outage",
                platform,
                error = %err,
                "CRITICAL: store unavailable, all dispatch halted until resumed"
            );
        }
    }

    /// Dispatch loop for one platform, until `shutdown` flips to true
    pub async fn run_platform(self: Arc<Self>, platform: String, mut shutdown: watch::Receiver<bool>) {
        info!(platform = %platform, "Dispatch loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.step_or_halt(&platform).await {
                Ok(outcome) => self.delay_after(&outcome),
                Err(e) if e.is_store_unavailable() => self.config.poll_interval,
                Err(e) => {
                    warn!(platform = %platform, error = %e, "Dispatch step failed");
                    self.config.poll_interval
                }
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(platform = %platform, "Dispatch loop stopped");
    }

    /// Start one loop per platform with a registered client
    pub fn spawn_all(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.clients
            .platforms()
            .into_iter()
            .map(|platform| tokio::spawn(Arc::clone(self).run_platform(platform, shutdown.clone())))
            .collect()
    }
}
