//! Posting Queue
//!
//! Holds every queue item plus the per-platform pause flags and the global
//! halt set after a store outage. Item transitions are checked against the
//! state graph in [`QueueState::can_transition_to`], persisted, and only then
//! applied in memory.
//!
//! Items are sharded by platform. Each shard has a writer lock held across
//! the store write, while the item map itself is only locked for the
//! in-memory read or commit. A slow save on one platform does not block
//! reads, or writes to other platforms.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::item::{NewQueueItem, QueueItem, QueueStats, QueueState};
use super::retry::{calculate_retry_delay, RetryConfig, RetryDecision};
use crate::clock::Clock;
use crate::error::{GateError, GateResult};
use crate::store::Store;

/// Error text recorded for items interrupted mid-publish by a restart
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// How a publish attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying after backoff
    Retryable,
    /// Retrying cannot help; fail immediately
    Permanent,
}

/// One platform's items
#[derive(Debug, Default)]
struct Shard {
    /// Held from validation through persist and commit
    writer: Mutex<()>,
    items: RwLock<HashMap<String, QueueItem>>,
}

impl Shard {
    fn get(&self, id: &str) -> Option<QueueItem> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn insert(&self, item: QueueItem) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item.id.clone(), item);
    }

    fn with_items<T>(&self, f: impl FnOnce(&HashMap<String, QueueItem>) -> T) -> T {
        f(&self.items.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Durable per-platform work queue
#[derive(Debug)]
pub struct PostingQueue {
    shards: DashMap<String, Arc<Shard>>,
    /// Item id to platform
    index: DashMap<String, String>,
    paused_platforms: DashSet<String>,
    halted: RwLock<Option<String>>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl PostingQueue {
    /// Create an empty queue
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shards: DashMap::new(),
            index: DashMap::new(),
            paused_platforms: DashSet::new(),
            halted: RwLock::new(None),
            store,
            clock,
        }
    }

    /// Create a queue holding every persisted item
    pub async fn load(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> GateResult<Self> {
        let items = store.load_items().await?;
        let queue = Self::new(store, clock);
        let count = items.len();
        for item in items {
            queue.index.insert(item.id.clone(), item.platform.clone());
            queue.shard(&item.platform).insert(item);
        }
        info!(items = count, "Posting queue loaded");
        Ok(queue)
    }

    fn shard(&self, platform: &str) -> Arc<Shard> {
        if let Some(shard) = self.shards.get(platform) {
            return Arc::clone(shard.value());
        }
        Arc::clone(self.shards.entry(platform.to_string()).or_default().value())
    }

    fn shard_of(&self, id: &str) -> GateResult<Arc<Shard>> {
        let platform = self
            .index
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| GateError::ItemNotFound(id.to_string()))?;
        Ok(self.shard(&platform))
    }

    /// Shards matching `platform`, or all of them
    fn shards_for(&self, platform: Option<&str>) -> Vec<Arc<Shard>> {
        match platform {
            Some(p) => self.shards.get(p).map(|s| Arc::clone(s.value())).into_iter().collect(),
            None => self.shards.iter().map(|s| Arc::clone(s.value())).collect(),
        }
    }

    fn fold_items<T>(&self, init: T, mut f: impl FnMut(T, &QueueItem) -> T) -> T {
        self.shards_for(None).iter().fold(init, |acc, shard| {
            shard.with_items(|items| items.values().fold(acc, &mut f))
        })
    }

    /// Add a new `queued` item
    pub async fn enqueue(&self, request: NewQueueItem) -> GateResult<QueueItem> {
        if request.platform.trim().is_empty() {
            return Err(GateError::invalid("platform must not be empty"));
        }

        let item = QueueItem::new(request, self.clock.now());
        let shard = self.shard(&item.platform);
        {
            let _writer = shard.writer.lock().await;
            self.store.save_item(&item).await?;
            shard.insert(item.clone());
            self.index.insert(item.id.clone(), item.platform.clone());
        }

        info!(
            id = %item.id,
            platform = %item.platform,
            scheduled_at = %item.scheduled_at,
            "Item enqueued"
        );
        Ok(item)
    }

    pub async fn get(&self, id: &str) -> GateResult<QueueItem> {
        self.shard_of(id)?
            .get(id)
            .ok_or_else(|| GateError::ItemNotFound(id.to_string()))
    }

    /// Items filtered by platform and state, oldest first
    pub async fn list(&self, platform: Option<&str>, state: Option<QueueState>) -> Vec<QueueItem> {
        let mut items: Vec<_> = self
            .shards_for(platform)
            .iter()
            .flat_map(|shard| {
                shard.with_items(|items| {
                    items
                        .values()
                        .filter(|i| state.map_or(true, |s| i.state == s))
                        .cloned()
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Earliest-ready queued item for a platform, by `scheduled_at` then `created_at`
    pub async fn next_ready(&self, platform: &str, now: DateTime<Utc>) -> Option<QueueItem> {
        self.shards.get(platform).map(|s| Arc::clone(s.value()))?.with_items(|items| {
            items
                .values()
                .filter(|i| i.is_ready(now))
                .min_by(|a, b| {
                    a.scheduled_at
                        .cmp(&b.scheduled_at)
                        .then_with(|| a.created_at.cmp(&b.created_at))
                        .then_with(|| a.id.cmp(&b.id))
                })
                .cloned()
        })
    }

    /// Earliest `scheduled_at` among a platform's queued items
    pub async fn next_scheduled(&self, platform: &str) -> Option<DateTime<Utc>> {
        self.shards.get(platform).map(|s| Arc::clone(s.value()))?.with_items(|items| {
            items
                .values()
                .filter(|i| i.state == QueueState::Queued)
                .map(|i| i.scheduled_at)
                .min()
        })
    }

    /// Apply `f` to a copy of the item if `from -> to` is allowed, persist, then commit.
    ///
    /// `require` narrows the accepted source state beyond the state graph.
    async fn transition(
        &self,
        id: &str,
        require: Option<QueueState>,
        to: QueueState,
        f: impl FnOnce(&mut QueueItem, DateTime<Utc>),
    ) -> GateResult<QueueItem> {
        let shard = self.shard_of(id)?;
        let _writer = shard.writer.lock().await;
        let current = shard
            .get(id)
            .ok_or_else(|| GateError::ItemNotFound(id.to_string()))?;

        let allowed = require.map_or(true, |s| s == current.state);
        if !allowed || !current.state.can_transition_to(to) {
            return Err(GateError::InvalidTransition {
                id: id.to_string(),
                from: current.state,
                to,
            });
        }

        let now = self.clock.now();
        let mut next = current;
        next.state = to;
        next.updated_at = now;
        f(&mut next, now);

        self.store.save_item(&next).await?;
        shard.insert(next.clone());
        Ok(next)
    }

    /// `queued -> posting`
    pub async fn begin_posting(&self, id: &str) -> GateResult<QueueItem> {
        self.transition(id, None, QueueState::Posting, |_, _| {}).await
    }

    /// `posting -> posted`
    pub async fn mark_posted(&self, id: &str, remote_id: Option<String>) -> GateResult<QueueItem> {
        let item = self
            .transition(id, None, QueueState::Posted, |item, _| {
                item.remote_id = remote_id;
                item.last_error = None;
            })
            .await?;

        info!(
            target: "audit",
            event = "queue.posted",
            id = %item.id,
            platform = %item.platform,
            remote_id = item.remote_id.as_deref().unwrap_or(""),
            attempts = item.attempts,
            "Item posted"
        );
        Ok(item)
    }

    /// Record a failed publish on a `posting` item.
    ///
    /// Increments `attempts`; the item goes back to `queued` with a backoff
    /// delay, or to `failed` once retries are exhausted or the error is
    /// permanent.
    pub async fn record_failure(
        &self,
        id: &str,
        error: &str,
        kind: FailureKind,
        retry: &RetryConfig,
    ) -> GateResult<QueueItem> {
        let attempts = self.get(id).await?.attempts.saturating_add(1);

        let decision = match kind {
            FailureKind::Permanent => RetryDecision::GiveUp,
            FailureKind::Retryable => calculate_retry_delay(attempts, retry),
        };
        let to = match decision {
            RetryDecision::Retry(_) => QueueState::Queued,
            RetryDecision::GiveUp => QueueState::Failed,
        };
        let item = self
            .transition(id, Some(QueueState::Posting), to, |item, now| {
                item.attempts = attempts;
                item.last_error = Some(error.to_string());
                if let RetryDecision::Retry(delay) = &decision {
                    let delay = chrono::Duration::from_std(*delay).unwrap_or(chrono::Duration::MAX);
                    item.scheduled_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
                }
            })
            .await?;

        if item.state == QueueState::Failed {
            warn!(
                target: "audit",
                event = "queue.failed",
                id = %item.id,
                platform = %item.platform,
                attempts = item.attempts,
                error,
                "Item failed"
            );
        } else {
            info!(
                id = %item.id,
                platform = %item.platform,
                attempts = item.attempts,
                next_attempt_at = %item.scheduled_at,
                error,
                "Publish failed, retry scheduled"
            );
        }
        Ok(item)
    }

    /// `queued -> paused`
    pub async fn pause_item(&self, id: &str) -> GateResult<QueueItem> {
        let item = self.transition(id, None, QueueState::Paused, |_, _| {}).await?;
        info!(target: "audit", event = "queue.item_paused", id, "Item paused");
        Ok(item)
    }

    /// `paused -> queued`, keeping the original schedule
    pub async fn resume_item(&self, id: &str) -> GateResult<QueueItem> {
        let item = self
            .transition(id, Some(QueueState::Paused), QueueState::Queued, |_, _| {})
            .await?;
        info!(target: "audit", event = "queue.item_resumed", id, "Item resumed");
        Ok(item)
    }

    /// Operator requeue of a `failed` item: attempts and error are cleared
    pub async fn requeue(&self, id: &str) -> GateResult<QueueItem> {
        let item = self
            .transition(id, Some(QueueState::Failed), QueueState::Queued, |item, now| {
                item.attempts = 0;
                item.last_error = None;
                item.scheduled_at = now;
            })
            .await?;
        info!(target: "audit", event = "queue.requeued", id, "Item requeued");
        Ok(item)
    }

    /// Stop dispatching a platform. Returns false if it was already paused.
    pub async fn pause_platform(&self, platform: &str) -> bool {
        let changed = self.paused_platforms.insert(platform.to_string());
        if changed {
            info!(target: "audit", event = "platform.paused", platform, "Platform paused");
        }
        changed
    }

    /// Resume dispatching a platform. Returns false if it was not paused.
    pub async fn resume_platform(&self, platform: &str) -> bool {
        let changed = self.paused_platforms.remove(platform).is_some();
        if changed {
            info!(target: "audit", event = "platform.resumed", platform, "Platform resumed");
        }
        changed
    }

    /// Paused either individually or through a global halt
    pub async fn is_platform_paused(&self, platform: &str) -> bool {
        self.halted_reason().await.is_some() || self.paused_platforms.contains(platform)
    }

    /// Platforms paused individually, sorted
    pub async fn paused_platforms(&self) -> Vec<String> {
        let mut platforms: Vec<_> = self.paused_platforms.iter().map(|p| p.key().clone()).collect();
        platforms.sort();
        platforms
    }

    /// Stop all dispatch until [`PostingQueue::resume_all`]. The first reason wins.
    pub async fn halt_all(&self, reason: &str) -> bool {
        {
            let mut halted = self.halted.write().unwrap_or_else(PoisonError::into_inner);
            if halted.is_some() {
                return false;
            }
            *halted = Some(reason.to_string());
        }
        warn!(target: "audit", event = "dispatch.halted", reason, "Dispatch halted");
        true
    }

    /// Clear a global halt. Individually paused platforms stay paused.
    pub async fn resume_all(&self) -> bool {
        let cleared = self
            .halted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reason) = &cleared {
            info!(
                target: "audit",
                event = "dispatch.resumed",
                previous_reason = %reason,
                "Dispatch resumed"
            );
        }
        cleared.is_some()
    }

    pub async fn halted_reason(&self) -> Option<String> {
        self.halted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Counts by state
    pub async fn stats(&self) -> QueueStats {
        self.fold_items(QueueStats::default(), |mut stats, item| {
            stats.count(item.state);
            stats
        })
    }

    /// Items in terminal states whose last transition is at or after `since`
    pub async fn terminal_since(&self, since: DateTime<Utc>) -> (usize, usize) {
        self.fold_items((0, 0), |(posted, failed), i| {
            if i.updated_at < since {
                return (posted, failed);
            }
            match i.state {
                QueueState::Posted => (posted + 1, failed),
                QueueState::Failed => (posted, failed + 1),
                _ => (posted, failed),
            }
        })
    }

    /// Oldest `scheduled_at` among all queued items
    pub async fn oldest_queued(&self) -> Option<DateTime<Utc>> {
        self.fold_items(None, |oldest: Option<DateTime<Utc>>, i| {
            if i.state != QueueState::Queued {
                return oldest;
            }
            Some(oldest.map_or(i.scheduled_at, |o| o.min(i.scheduled_at)))
        })
    }

    /// Platforms that have at least one item
    pub async fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<_> = self
            .index
            .iter()
            .map(|e| e.value().clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        platforms.sort();
        platforms
    }

    /// Treat items left in `posting` by a previous process as a failed
    /// retryable attempt. Returns the recovered items.
    pub async fn recover_in_flight(&self, retry: &RetryConfig) -> GateResult<Vec<QueueItem>> {
        let stuck: Vec<String> = self
            .list(None, Some(QueueState::Posting))
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();

        let mut recovered = Vec::with_capacity(stuck.len());
        for id in stuck {
            let item = self
                .record_failure(&id, INTERRUPTED_BY_RESTART, FailureKind::Retryable, retry)
                .await?;
            recovered.push(item);
        }

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Recovered items interrupted mid-publish");
        }
        Ok(recovered)
    }
}
