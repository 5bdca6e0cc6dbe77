//! In-memory store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use super::{Store, StoreError, StoreState};
use crate::queue::QueueItem;
use crate::rate_limit::{BurstOverride, RateLimitWindow};
use crate::usage::UsageEvent;

/// Process-local store. State is lost on exit.
///
/// [`MemoryStore::set_available`] simulates an outage: while unavailable every
/// call fails with [`StoreError::Unavailable`].
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_state(StoreState::default())
    }

    /// Create a store seeded with existing state
    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated availability
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Copy of the full state
    pub fn snapshot(&self) -> StoreState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T, StoreError> {
        self.check()?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&state))
    }

    fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T, StoreError> {
        self.check()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut state))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_windows(&self) -> Result<Vec<RateLimitWindow>, StoreError> {
        self.read(|s| s.windows.values().cloned().collect())
    }

    async fn save_window(&self, window: &RateLimitWindow) -> Result<(), StoreError> {
        self.write(|s| {
            s.windows.insert(window.platform.clone(), window.clone());
        })
    }

    async fn load_overrides(&self) -> Result<Vec<BurstOverride>, StoreError> {
        self.read(|s| s.overrides.values().cloned().collect())
    }

    async fn save_override(&self, burst: &BurstOverride) -> Result<(), StoreError> {
        self.write(|s| {
            s.overrides.insert(burst.platform.clone(), burst.clone());
        })
    }

    async fn delete_override(&self, platform: &str) -> Result<(), StoreError> {
        self.write(|s| {
            s.overrides.remove(platform);
        })
    }

    async fn append_usage(&self, event: &UsageEvent) -> Result<(), StoreError> {
        self.write(|s| s.usage.push(event.clone()))
    }

    async fn usage_between(
        &self,
        platform: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        self.read(|s| s.usage_between(platform, from, to))
    }

    async fn prune_usage(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.write(|s| s.prune_usage(before))
    }

    async fn load_items(&self) -> Result<Vec<QueueItem>, StoreError> {
        self.read(|s| s.items.values().cloned().collect())
    }

    async fn save_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        self.write(|s| {
            s.items.insert(item.id.clone(), item.clone());
        })
    }
}
