//! Quota Window
//!
//! Fixed-window quota record for a single platform and the arithmetic that
//! operates on it. Nothing in here locks or persists; the registry owns that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default window length for lazily created platforms
pub const DEFAULT_WINDOW_SECONDS: u64 = 60;

/// Default base quota for lazily created platforms
pub const DEFAULT_MAX_ACTIONS: u32 = 60;

/// Per-platform fixed-window quota record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    /// Platform key
    pub platform: String,

    /// Window length in seconds
    pub window_seconds: u64,

    /// Base quota per window (before burst scaling)
    pub max_actions: u32,

    /// Actions admitted in the current window
    pub used_actions: u32,

    /// Start of the current window
    pub window_started_at: DateTime<Utc>,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl RateLimitWindow {
    /// Create a fresh window starting at `now`
    pub fn new(platform: &str, window_seconds: u64, max_actions: u32, now: DateTime<Utc>) -> Self {
        Self {
            platform: platform.to_string(),
            window_seconds,
            max_actions,
            used_actions: 0,
            window_started_at: now,
            updated_at: now,
        }
    }

    /// Whether the current window has fully elapsed at `now`
    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        (now - self.window_started_at).num_milliseconds()
            >= (self.window_seconds as i64).saturating_mul(1000)
    }

    /// Start a new window if the current one has elapsed.
    ///
    /// Returns true if a rollover happened.
    pub fn roll_over_if_elapsed(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_elapsed(now) {
            self.restart(now);
            true
        } else {
            false
        }
    }

    /// Zero the counter and start a new window at `now`
    pub fn restart(&mut self, now: DateTime<Utc>) {
        self.used_actions = 0;
        self.window_started_at = now;
        self.updated_at = now;
    }

    /// Base quota scaled by `factor`, floored
    pub fn effective_max(&self, factor: f64) -> u32 {
        let scaled = (self.max_actions as f64 * factor.max(1.0)).floor();
        if scaled >= u32::MAX as f64 {
            u32::MAX
        } else {
            scaled as u32
        }
    }

    /// Whether `n` more actions fit under `effective_max`
    pub fn has_room(&self, n: u32, effective_max: u32) -> bool {
        self.used_actions as u64 + n as u64 <= effective_max as u64
    }

    /// Time until the current window ends, never negative
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        let ends_at = self.window_started_at + chrono::Duration::seconds(self.window_seconds as i64);
        (ends_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Used actions as seen at `now`: an elapsed window reads as empty
    pub fn used_at(&self, now: DateTime<Utc>) -> u32 {
        if self.is_elapsed(now) {
            0
        } else {
            self.used_actions
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn window(window_seconds: u64, max_actions: u32) -> (RateLimitWindow, DateTime<Utc>) {
        let now = Utc::now();
        (RateLimitWindow::new("x", window_seconds, max_actions, now), now)
    }

    #[test]
    fn test_window_creation() {
        let (w, now) = window(60, 10);
        assert_eq!(w.used_actions, 0);
        assert_eq!(w.window_started_at, now);
        assert_eq!(w.updated_at, now);
    }

    #[test]
    fn test_rollover_boundary() {
        let (mut w, now) = window(60, 10);
        w.used_actions = 10;

        assert!(!w.roll_over_if_elapsed(now + ChronoDuration::seconds(59)));
        assert_eq!(w.used_actions, 10);

        // now - started == window_seconds counts as elapsed
        let boundary = now + ChronoDuration::seconds(60);
        assert!(w.roll_over_if_elapsed(boundary));
        assert_eq!(w.used_actions, 0);
        assert_eq!(w.window_started_at, boundary);
    }

    #[test]
    fn test_effective_max_floors() {
        let (w, _) = window(60, 100);
        assert_eq!(w.effective_max(1.0), 100);
        assert_eq!(w.effective_max(1.5), 150);
        assert_eq!(w.effective_max(1.999), 199);
        // factors below 1 never shrink the base quota
        assert_eq!(w.effective_max(0.5), 100);
    }

    #[test]
    fn test_has_room() {
        let (mut w, _) = window(60, 10);
        w.used_actions = 9;
        assert!(w.has_room(1, 10));
        assert!(!w.has_room(2, 10));
        assert!(w.has_room(u32::MAX - 9, u32::MAX));
    }

    #[test]
    fn test_retry_after() {
        let (w, now) = window(900, 300);
        assert_eq!(w.retry_after(now), Duration::from_secs(900));
        assert_eq!(
            w.retry_after(now + ChronoDuration::seconds(899)),
            Duration::from_secs(1)
        );
        // past the end of the window the wait is zero, never negative
        assert_eq!(w.retry_after(now + ChronoDuration::seconds(1000)), Duration::ZERO);
    }

    #[test]
    fn test_used_at_elapsed_window() {
        let (mut w, now) = window(60, 10);
        w.used_actions = 7;
        assert_eq!(w.used_at(now + ChronoDuration::seconds(30)), 7);
        assert_eq!(w.used_at(now + ChronoDuration::seconds(61)), 0);
        // reading does not mutate
        assert_eq!(w.used_actions, 7);
    }
}
