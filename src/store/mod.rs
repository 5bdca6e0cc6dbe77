//! Durable State Store
//!
//! Windows, overrides, usage events and queue items are persisted through the
//! [`Store`] trait so counters and queue state survive a restart.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local, with outage injection for tests
//! - [`FileStore`]: JSON snapshot on disk, replaced atomically on every write,
//!   plus an append-only usage log

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::queue::QueueItem;
use crate::rate_limit::{BurstOverride, RateLimitWindow};
use crate::usage::UsageEvent;

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Error types for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend cannot be reached
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// Filesystem error
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence capability consumed by the registry, recorder and queue
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// All persisted rate limit windows
    async fn load_windows(&self) -> Result<Vec<RateLimitWindow>, StoreError>;

    /// Insert or replace a window
    async fn save_window(&self, window: &RateLimitWindow) -> Result<(), StoreError>;

    /// All persisted burst overrides
    async fn load_overrides(&self) -> Result<Vec<BurstOverride>, StoreError>;

    /// Insert or replace the override for its platform
    async fn save_override(&self, burst: &BurstOverride) -> Result<(), StoreError>;

    /// Remove the override for a platform, if any
    async fn delete_override(&self, platform: &str) -> Result<(), StoreError>;

    /// Append a usage event
    async fn append_usage(&self, event: &UsageEvent) -> Result<(), StoreError>;

    /// Usage events for a platform with `from <= timestamp <= to`
    async fn usage_between(
        &self,
        platform: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, StoreError>;

    /// Drop usage events older than `before`; returns how many were removed
    async fn prune_usage(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;

    /// All persisted queue items
    async fn load_items(&self) -> Result<Vec<QueueItem>, StoreError>;

    /// Insert or replace a queue item
    async fn save_item(&self, item: &QueueItem) -> Result<(), StoreError>;
}

/// Full persisted state, shared by both backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub windows: BTreeMap<String, RateLimitWindow>,

    #[serde(default)]
    pub overrides: BTreeMap<String, BurstOverride>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usage: Vec<UsageEvent>,

    #[serde(default)]
    pub items: BTreeMap<String, QueueItem>,
}

impl StoreState {
    pub(crate) fn usage_between(
        &self,
        platform: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<UsageEvent> {
        self.usage
            .iter()
            .filter(|e| e.platform == platform && e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect()
    }

    pub(crate) fn prune_usage(&mut self, before: DateTime<Utc>) -> usize {
        let len = self.usage.len();
        self.usage.retain(|e| e.timestamp >= before);
        len - self.usage.len()
    }
}
