//! Rate Limit Registry
//!
//! Owns one quota window (plus an optional burst override) per platform.
//!
//! Each platform slot has its own async admission lock, so mutations on one
//! platform never wait on another. The slot also publishes a snapshot of its
//! state behind a short-lived `RwLock`, which the read-only accessors use
//! without touching the admission lock.
//!
//! Every mutation is persisted to the [`Store`] before the new snapshot is
//! published. If the store rejects the write the slot keeps its previous state
//! and the caller gets [`GateError::StoreUnavailable`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::burst::{self, BurstOverride};
use super::window::{RateLimitWindow, DEFAULT_MAX_ACTIONS, DEFAULT_WINDOW_SECONDS};
use crate::clock::Clock;
use crate::error::{GateError, GateResult};
use crate::metrics;
use crate::store::Store;
use crate::usage::UsageRecorder;

/// Window parameters applied to platforms created lazily by `acquire`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDefaults {
    pub window_seconds: u64,
    pub max_actions: u32,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_WINDOW_SECONDS,
            max_actions: DEFAULT_MAX_ACTIONS,
        }
    }
}

/// Outcome of an admission request. A denial is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Quota was consumed
    Granted { used_actions: u32, effective_max: u32 },

    /// Quota exhausted until the current window ends
    Denied {
        retry_after: Duration,
        used_actions: u32,
        effective_max: u32,
    },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }

    /// Wait until the window resets; `None` when granted
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Granted { .. } => None,
            Admission::Denied { retry_after, .. } => Some(*retry_after),
        }
    }
}

#[derive(Debug, Clone)]
struct PlatformState {
    window: RateLimitWindow,
    burst: Option<BurstOverride>,
}

#[derive(Debug)]
struct PlatformSlot {
    admission: Mutex<()>,
    state: RwLock<PlatformState>,
}

impl PlatformSlot {
    fn new(window: RateLimitWindow, burst: Option<BurstOverride>) -> Self {
        Self {
            admission: Mutex::new(()),
            state: RwLock::new(PlatformState { window, burst }),
        }
    }

    fn snapshot(&self) -> PlatformState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, next: PlatformState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

/// Per-platform quota windows with atomic admission
#[derive(Debug)]
pub struct RateLimitRegistry {
    slots: DashMap<String, Arc<PlatformSlot>>,
    creating: Mutex<()>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    recorder: UsageRecorder,
    defaults: LimitDefaults,
}

impl RateLimitRegistry {
    /// Create an empty registry
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        recorder: UsageRecorder,
        defaults: LimitDefaults,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            creating: Mutex::new(()),
            store,
            clock,
            recorder,
            defaults,
        }
    }

    /// Create a registry populated from persisted windows and overrides
    pub async fn load(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        recorder: UsageRecorder,
        defaults: LimitDefaults,
    ) -> GateResult<Self> {
        let registry = Self::new(Arc::clone(&store), clock, recorder, defaults);

        let windows = store.load_windows().await?;
        let mut overrides = store.load_overrides().await?;

        for window in windows {
            let burst = overrides
                .iter()
                .position(|o| o.platform == window.platform)
                .map(|i| overrides.swap_remove(i));
            registry.slots.insert(
                window.platform.clone(),
                Arc::new(PlatformSlot::new(window, burst)),
            );
        }
        for orphan in overrides {
            warn!(platform = %orphan.platform, "Ignoring persisted override without a window");
        }

        info!(platforms = registry.slots.len(), "Rate limit registry loaded");
        Ok(registry)
    }

    /// Defaults used for lazily created platforms
    pub fn defaults(&self) -> LimitDefaults {
        self.defaults
    }

    fn slot(&self, platform: &str) -> Option<Arc<PlatformSlot>> {
        self.slots.get(platform).map(|s| Arc::clone(s.value()))
    }

    fn known_slot(&self, platform: &str) -> GateResult<Arc<PlatformSlot>> {
        self.slot(platform)
            .ok_or_else(|| GateError::UnknownPlatform(platform.to_string()))
    }

    /// Look up a slot, creating and persisting a fresh window if missing.
    ///
    /// Returns the slot and whether it was created by this call.
    async fn slot_or_create(
        &self,
        platform: &str,
        window_seconds: u64,
        max_actions: u32,
    ) -> GateResult<(Arc<PlatformSlot>, bool)> {
        if let Some(slot) = self.slot(platform) {
            return Ok((slot, false));
        }

        let _creating = self.creating.lock().await;
        if let Some(slot) = self.slot(platform) {
            return Ok((slot, false));
        }

        let window = RateLimitWindow::new(platform, window_seconds, max_actions, self.clock.now());
        self.store.save_window(&window).await?;

        let slot = Arc::new(PlatformSlot::new(window, None));
        self.slots.insert(platform.to_string(), Arc::clone(&slot));
        debug!(platform, window_seconds, max_actions, "Created rate limit window");
        Ok((slot, true))
    }

    /// Insert or update a platform's window parameters.
    ///
    /// The current count is kept, even if it now exceeds the new limit.
    pub async fn configure(
        &self,
        platform: &str,
        window_seconds: u64,
        max_actions: u32,
    ) -> GateResult<RateLimitWindow> {
        if platform.trim().is_empty() {
            return Err(GateError::invalid("platform must not be empty"));
        }
        if window_seconds == 0 {
            return Err(GateError::invalid("window_seconds must be > 0"));
        }
        if max_actions == 0 {
            return Err(GateError::invalid("max_actions must be > 0"));
        }

        let (slot, created) = self
            .slot_or_create(platform, window_seconds, max_actions)
            .await?;

        let window = if created {
            slot.snapshot().window
        } else {
            let _guard = slot.admission.lock().await;
            let mut next = slot.snapshot();
            next.window.window_seconds = window_seconds;
            next.window.max_actions = max_actions;
            next.window.updated_at = self.clock.now();

            self.store.save_window(&next.window).await?;
            let window = next.window.clone();
            slot.publish(next);
            window
        };

        info!(
            target: "audit",
            event = "rate_limit.updated",
            platform,
            window_seconds,
            max_actions,
            "Rate limit updated"
        );
        Ok(window)
    }

    /// Atomically admit `n` actions for `platform`.
    ///
    /// Rolls the window over if it has elapsed and drops an expired override
    /// before evaluating the effective quota. Never waits for quota.
    pub async fn acquire(&self, platform: &str, n: u32) -> GateResult<Admission> {
        if n == 0 {
            return Err(GateError::invalid("acquire count must be > 0"));
        }

        let (slot, _) = self
            .slot_or_create(platform, self.defaults.window_seconds, self.defaults.max_actions)
            .await?;

        let (admission, now, saturation) = {
            let _guard = slot.admission.lock().await;
            let now = self.clock.now();
            let mut next = slot.snapshot();

            let rolled = next.window.roll_over_if_elapsed(now);
            let expired = next.burst.as_ref().is_some_and(|b| b.is_expired(now));
            if expired {
                next.burst = None;
            }

            let factor = burst::effective_factor(next.burst.as_ref(), now);
            let effective_max = next.window.effective_max(factor);
            let granted = next.window.has_room(n, effective_max);

            if granted {
                next.window.used_actions += n;
                next.window.updated_at = now;
            }

            if expired {
                self.store.delete_override(platform).await?;
            }
            if granted || rolled {
                self.store.save_window(&next.window).await?;
            }

            let used_actions = next.window.used_actions;
            let admission = if granted {
                Admission::Granted {
                    used_actions,
                    effective_max,
                }
            } else {
                Admission::Denied {
                    retry_after: next.window.retry_after(now),
                    used_actions,
                    effective_max,
                }
            };
            let saturation = saturation_pct(used_actions, effective_max);

            if expired || granted || rolled {
                slot.publish(next);
            }
            (admission, now, saturation)
        };

        metrics::record_decision(platform, admission.is_granted());
        metrics::set_saturation(platform, saturation);

        if let Err(e) = self
            .recorder
            .record(platform, now, n, admission.is_granted())
            .await
        {
            warn!(platform, error = %e, "Failed to record usage event");
        }

        if let Admission::Denied { retry_after, .. } = &admission {
            debug!(
                platform,
                n,
                retry_after_ms = retry_after.as_millis() as u64,
                "Admission denied"
            );
        }
        Ok(admission)
    }

    /// Give back `n` actions admitted earlier, flooring at zero
    pub async fn release(&self, platform: &str, n: u32) -> GateResult<RateLimitWindow> {
        let slot = self.known_slot(platform)?;
        let _guard = slot.admission.lock().await;
        let now = self.clock.now();

        let mut next = slot.snapshot();
        next.window.roll_over_if_elapsed(now);
        next.window.used_actions = next.window.used_actions.saturating_sub(n);
        next.window.updated_at = now;

        self.store.save_window(&next.window).await?;
        let window = next.window.clone();
        slot.publish(next);

        debug!(platform, n, used_actions = window.used_actions, "Released quota");
        Ok(window)
    }

    /// Zero the counter and start a new window now. The override is untouched.
    pub async fn reset(&self, platform: &str) -> GateResult<RateLimitWindow> {
        let slot = self.known_slot(platform)?;
        let _guard = slot.admission.lock().await;

        let mut next = slot.snapshot();
        next.window.restart(self.clock.now());

        self.store.save_window(&next.window).await?;
        let window = next.window.clone();
        slot.publish(next);

        info!(target: "audit", event = "rate_limit.reset", platform, "Rate limit reset");
        Ok(window)
    }

    /// Install a burst override, replacing any existing one
    pub async fn set_override(
        &self,
        platform: &str,
        factor: f64,
        minutes: u32,
    ) -> GateResult<BurstOverride> {
        burst::validate(factor, minutes)?;

        let (slot, _) = self
            .slot_or_create(platform, self.defaults.window_seconds, self.defaults.max_actions)
            .await?;
        let _guard = slot.admission.lock().await;

        let burst = BurstOverride::new(platform, factor, minutes, self.clock.now())?;
        self.store.save_override(&burst).await?;

        let mut next = slot.snapshot();
        next.burst = Some(burst.clone());
        slot.publish(next);

        info!(
            target: "audit",
            event = "rate_limit.override_set",
            platform,
            factor,
            minutes,
            "Burst override set"
        );
        Ok(burst)
    }

    /// Remove a platform's override. Returns whether one was present.
    pub async fn clear_override(&self, platform: &str) -> GateResult<bool> {
        let Some(slot) = self.slot(platform) else {
            return Ok(false);
        };
        let _guard = slot.admission.lock().await;

        let mut next = slot.snapshot();
        if next.burst.take().is_none() {
            return Ok(false);
        }

        self.store.delete_override(platform).await?;
        slot.publish(next);

        info!(
            target: "audit",
            event = "rate_limit.override_cleared",
            platform,
            "Burst override cleared"
        );
        Ok(true)
    }

    /// Snapshot of a platform's window
    pub fn window(&self, platform: &str) -> Option<RateLimitWindow> {
        self.slot(platform).map(|s| s.snapshot().window)
    }

    /// Snapshots of all windows, sorted by platform
    pub fn windows(&self) -> Vec<RateLimitWindow> {
        let mut windows: Vec<_> = self
            .slots
            .iter()
            .map(|entry| entry.value().snapshot().window)
            .collect();
        windows.sort_by(|a, b| a.platform.cmp(&b.platform));
        windows
    }

    /// Known platform keys, sorted
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<_> = self.slots.iter().map(|e| e.key().clone()).collect();
        platforms.sort();
        platforms
    }

    /// The override for a platform, if one is set and still in effect
    pub fn override_for(&self, platform: &str) -> Option<BurstOverride> {
        let now = self.clock.now();
        self.slot(platform)
            .and_then(|s| s.snapshot().burst)
            .filter(|b| !b.is_expired(now))
    }

    /// Multiplier in effect for `platform` at `now`
    pub fn effective_factor(&self, platform: &str, now: DateTime<Utc>) -> f64 {
        let burst = self.slot(platform).and_then(|s| s.snapshot().burst);
        burst::effective_factor(burst.as_ref(), now)
    }

    /// Scaled quota for `platform` at `now`
    pub fn effective_max(&self, platform: &str, now: DateTime<Utc>) -> Option<u32> {
        self.slot(platform).map(|s| {
            let state = s.snapshot();
            state
                .window
                .effective_max(burst::effective_factor(state.burst.as_ref(), now))
        })
    }

    /// Percent of the effective quota used right now. An elapsed window reads as 0.
    pub fn saturation(&self, platform: &str) -> Option<u32> {
        let now = self.clock.now();
        self.slot(platform).map(|s| {
            let state = s.snapshot();
            let effective_max = state
                .window
                .effective_max(burst::effective_factor(state.burst.as_ref(), now));
            saturation_pct(state.window.used_at(now), effective_max)
        })
    }

    /// Saturation for every platform, sorted by platform
    pub fn saturations(&self) -> Vec<(String, u32)> {
        self.platforms()
            .into_iter()
            .filter_map(|p| self.saturation(&p).map(|pct| (p, pct)))
            .collect()
    }
}

fn saturation_pct(used: u32, effective_max: u32) -> u32 {
    if effective_max == 0 {
        return 0;
    }
    (used as f64 / effective_max as f64 * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    fn registry() -> (RateLimitRegistry, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new());
        let recorder = UsageRecorder::new(store.clone(), clock.clone());
        let registry = RateLimitRegistry::new(
            store.clone(),
            clock.clone(),
            recorder,
            LimitDefaults::default(),
        );
        (registry, clock, store)
    }

    #[tokio::test]
    async fn test_configure_validation() {
        let (registry, _, store) = registry();
        assert!(matches!(
            registry.configure("x", 0, 10).await,
            Err(GateError::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.configure("x", 60, 0).await,
            Err(GateError::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.configure("  ", 60, 10).await,
            Err(GateError::InvalidConfig(_))
        ));
        assert!(registry.window("x").is_none());
        assert!(store.snapshot().windows.is_empty());
    }

    #[tokio::test]
    async fn test_configure_keeps_used_actions() {
        let (registry, _, _) = registry();
        registry.configure("x", 60, 10).await.unwrap();
        registry.acquire("x", 4).await.unwrap();

        let window = registry.configure("x", 120, 3).await.unwrap();
        assert_eq!(window.used_actions, 4);
        assert_eq!(window.window_seconds, 120);
        assert_eq!(window.max_actions, 3);

        // over the new limit: denied until the window rolls over
        assert!(!registry.acquire("x", 1).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_acquire_creates_default_window() {
        let (registry, _, store) = registry();
        let admission = registry.acquire("fresh", 1).await.unwrap();
        assert!(admission.is_granted());

        let window = registry.window("fresh").unwrap();
        assert_eq!(window.window_seconds, DEFAULT_WINDOW_SECONDS);
        assert_eq!(window.max_actions, DEFAULT_MAX_ACTIONS);
        assert_eq!(window.used_actions, 1);
        assert_eq!(store.snapshot().windows["fresh"].used_actions, 1);
    }

    #[tokio::test]
    async fn test_acquire_zero_is_invalid() {
        let (registry, _, _) = registry();
        assert!(matches!(
            registry.acquire("x", 0).await,
            Err(GateError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_denial_reports_retry_after() {
        let (registry, clock, _) = registry();
        registry.configure("x", 60, 2).await.unwrap();
        registry.acquire("x", 2).await.unwrap();

        clock.advance(ChronoDuration::seconds(20));
        let admission = registry.acquire("x", 1).await.unwrap();
        assert_eq!(admission.retry_after(), Some(Duration::from_secs(40)));
        assert_eq!(registry.window("x").unwrap().used_actions, 2);
    }

    #[tokio::test]
    async fn test_rollover_after_window() {
        let (registry, clock, _) = registry();
        registry.configure("x", 60, 2).await.unwrap();
        registry.acquire("x", 2).await.unwrap();

        clock.advance(ChronoDuration::seconds(61));
        assert!(registry.acquire("x", 1).await.unwrap().is_granted());
        assert_eq!(registry.window("x").unwrap().used_actions, 1);
    }

    #[tokio::test]
    async fn test_override_decay() {
        let (registry, clock, _) = registry();
        registry.configure("x", 3600, 100).await.unwrap();
        registry.set_override("x", 2.0, 30).await.unwrap();

        assert_eq!(registry.effective_max("x", clock.now()), Some(200));
        clock.advance(ChronoDuration::minutes(15));
        assert_eq!(registry.effective_max("x", clock.now()), Some(150));
        clock.advance(ChronoDuration::minutes(15));
        assert_eq!(registry.effective_max("x", clock.now()), Some(100));
        assert!(registry.override_for("x").is_none());
    }

    #[tokio::test]
    async fn test_expired_override_dropped_on_acquire() {
        let (registry, clock, store) = registry();
        registry.configure("x", 60, 10).await.unwrap();
        registry.set_override("x", 2.0, 1).await.unwrap();
        assert_eq!(store.snapshot().overrides.len(), 1);

        clock.advance(ChronoDuration::minutes(2));
        registry.acquire("x", 1).await.unwrap();
        assert!(store.snapshot().overrides.is_empty());
    }

    #[tokio::test]
    async fn test_clear_override() {
        let (registry, clock, _) = registry();
        registry.configure("x", 60, 100).await.unwrap();
        registry.set_override("x", 3.0, 60).await.unwrap();

        assert!(registry.clear_override("x").await.unwrap());
        assert_eq!(registry.effective_max("x", clock.now()), Some(100));
        assert!(!registry.clear_override("x").await.unwrap());
        assert!(!registry.clear_override("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_override_validation() {
        let (registry, _, _) = registry();
        assert!(registry.set_override("x", 0.5, 10).await.is_err());
        assert!(registry.set_override("x", 2.0, 0).await.is_err());
        assert!(registry.set_override("x", 2.0, 241).await.is_err());
        assert!(registry.window("x").is_none());
    }

    #[tokio::test]
    async fn test_reset() {
        let (registry, _, _) = registry();
        assert!(matches!(
            registry.reset("nope").await,
            Err(GateError::UnknownPlatform(_))
        ));

        registry.configure("x", 60, 5).await.unwrap();
        registry.set_override("x", 2.0, 10).await.unwrap();
        registry.acquire("x", 5).await.unwrap();

        let window = registry.reset("x").await.unwrap();
        assert_eq!(window.used_actions, 0);
        assert!(registry.override_for("x").is_some());
    }

    #[tokio::test]
    async fn test_release_floors_at_zero() {
        let (registry, _, _) = registry();
        registry.configure("x", 60, 5).await.unwrap();
        registry.acquire("x", 2).await.unwrap();

        assert_eq!(registry.release("x", 1).await.unwrap().used_actions, 1);
        assert_eq!(registry.release("x", 10).await.unwrap().used_actions, 0);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_state_unchanged() {
        let (registry, _, store) = registry();
        registry.configure("x", 60, 5).await.unwrap();
        registry.acquire("x", 1).await.unwrap();

        store.set_available(false);
        assert!(matches!(
            registry.acquire("x", 1).await,
            Err(GateError::StoreUnavailable(_))
        ));
        assert!(registry.reset("x").await.is_err());
        assert!(registry.set_override("x", 2.0, 10).await.is_err());
        assert_eq!(registry.window("x").unwrap().used_actions, 1);
        assert!(registry.override_for("x").is_none());

        store.set_available(true);
        assert!(registry.acquire("x", 1).await.unwrap().is_granted());
        assert_eq!(registry.window("x").unwrap().used_actions, 2);
    }

    #[tokio::test]
    async fn test_saturation() {
        let (registry, clock, _) = registry();
        registry.configure("x", 60, 3).await.unwrap();
        registry.acquire("x", 2).await.unwrap();
        assert_eq!(registry.saturation("x"), Some(67));

        // elapsed window reads as empty without being mutated
        clock.advance(ChronoDuration::seconds(60));
        assert_eq!(registry.saturation("x"), Some(0));
        assert_eq!(registry.window("x").unwrap().used_actions, 2);
    }

    #[tokio::test]
    async fn test_denied_acquire_is_recorded() {
        let (registry, _, store) = registry();
        registry.configure("x", 60, 1).await.unwrap();
        registry.acquire("x", 1).await.unwrap();
        registry.acquire("x", 1).await.unwrap();

        let usage = store.snapshot().usage;
        assert_eq!(usage.len(), 2);
        assert!(usage[0].granted);
        assert!(!usage[1].granted);
    }

    #[tokio::test]
    async fn test_load_restores_state() {
        let (registry, clock, store) = registry();
        registry.configure("b", 60, 5).await.unwrap();
        registry.configure("a", 900, 300).await.unwrap();
        registry.acquire("a", 7).await.unwrap();
        registry.set_override("a", 1.5, 30).await.unwrap();

        let recorder = UsageRecorder::new(store.clone(), clock.clone());
        let reloaded = RateLimitRegistry::load(store, clock, recorder, LimitDefaults::default())
            .await
            .unwrap();

        let windows = reloaded.windows();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].platform, "a");
        assert_eq!(windows[0].used_actions, 7);
        assert!(reloaded.override_for("a").is_some());
    }
}
