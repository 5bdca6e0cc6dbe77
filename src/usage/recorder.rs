//! Usage Recorder
//!
//! Append-only log of admission outcomes, queried back as bucketed series.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::series::{self, UsageBucket, UsageWindow};
use crate::clock::Clock;
use crate::error::GateResult;
use crate::store::Store;

/// One admission outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Platform key
    pub platform: String,

    /// When the decision was made
    pub timestamp: DateTime<Utc>,

    /// Actions requested
    pub delta: u32,

    /// Whether quota was granted
    pub granted: bool,
}

impl UsageEvent {
    /// Event for a granted admission
    pub fn granted(platform: &str, timestamp: DateTime<Utc>, delta: u32) -> Self {
        Self {
            platform: platform.to_string(),
            timestamp,
            delta,
            granted: true,
        }
    }

    /// Event for a denied admission
    pub fn denied(platform: &str, timestamp: DateTime<Utc>, delta: u32) -> Self {
        Self {
            granted: false,
            ..Self::granted(platform, timestamp, delta)
        }
    }
}

/// Usage series for one platform and window, ready for charting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSeries {
    pub platform: String,
    pub window: UsageWindow,
    pub buckets: Vec<UsageBucket>,
    pub moving_average: Vec<f64>,
}

/// Records usage events and aggregates them into bucket series
#[derive(Debug, Clone)]
pub struct UsageRecorder {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl UsageRecorder {
    /// Create a recorder over `store`
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append one usage event
    pub async fn record(
        &self,
        platform: &str,
        timestamp: DateTime<Utc>,
        delta: u32,
        granted: bool,
    ) -> GateResult<()> {
        let event = UsageEvent {
            platform: platform.to_string(),
            timestamp,
            delta,
            granted,
        };
        self.store.append_usage(&event).await?;
        Ok(())
    }

    /// Raw events for a platform within the trailing `span`
    pub async fn events(&self, platform: &str, span: Duration) -> GateResult<Vec<UsageEvent>> {
        let now = self.clock.now();
        Ok(self.store.usage_between(platform, now - span, now).await?)
    }

    /// Contiguous zero-filled bucket series for `window`, ending now
    pub async fn bucketize(&self, platform: &str, window: UsageWindow) -> GateResult<Vec<UsageBucket>> {
        let now = self.clock.now();
        let events = self
            .store
            .usage_between(platform, now - window.span(), now)
            .await?;
        Ok(series::bucketize(platform, &events, window, now))
    }

    /// Bucket series plus its trailing moving average
    pub async fn series(&self, platform: &str, window: UsageWindow) -> GateResult<UsageSeries> {
        let buckets = self.bucketize(platform, window).await?;
        let moving_average = series::moving_average(&buckets, window.granularity().smoothing());
        Ok(UsageSeries {
            platform: platform.to_string(),
            window,
            buckets,
            moving_average,
        })
    }

    /// Series rendered as CSV text
    pub async fn export_csv(&self, platform: &str, window: UsageWindow) -> GateResult<String> {
        let series = self.series(platform, window).await?;
        Ok(series::to_csv(&series.buckets, &series.moving_average))
    }

    /// Drop events older than `retention`
    pub async fn prune(&self, retention: Duration) -> GateResult<usize> {
        let cutoff = self.clock.now() - retention;
        let removed = self.store.prune_usage(cutoff).await?;
        if removed > 0 {
            debug!(removed, cutoff = %cutoff, "Pruned usage events");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn recorder() -> (UsageRecorder, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new());
        (UsageRecorder::new(store.clone(), clock.clone()), clock, store)
    }

    #[tokio::test]
    async fn test_series_sum_matches_granted_events() {
        let (recorder, clock, _) = recorder();
        let now = clock.now();

        for minutes_ago in [0, 10, 70, 200, 1430, 1500] {
            recorder
                .record("x", now - Duration::minutes(minutes_ago), 1, true)
                .await
                .unwrap();
        }
        recorder.record("x", now, 1, false).await.unwrap();

        let buckets = recorder.bucketize("x", UsageWindow::TwentyFourHours).await.unwrap();
        assert_eq!(buckets.len(), 24);
        let total: u64 = buckets.iter().map(|b| b.total).sum();
        // 1500 minutes ago falls outside the 24h window; the denied call never counts
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_series_has_moving_average_per_bucket() {
        let (recorder, clock, _) = recorder();
        recorder.record("x", clock.now(), 1, true).await.unwrap();

        let series = recorder.series("x", UsageWindow::SevenDays).await.unwrap();
        assert_eq!(series.buckets.len(), 7);
        assert_eq!(series.moving_average.len(), 7);
        assert_eq!(series.moving_average[6], 0.5);
    }

    #[tokio::test]
    async fn test_export_csv_line_count() {
        let (recorder, _, _) = recorder();
        let csv = recorder.export_csv("x", UsageWindow::SixHours).await.unwrap();
        assert_eq!(csv.lines().count(), 7);
    }

    #[tokio::test]
    async fn test_prune() {
        let (recorder, clock, store) = recorder();
        let now = clock.now();
        recorder.record("x", now - Duration::days(9), 1, true).await.unwrap();
        recorder.record("x", now - Duration::days(1), 1, true).await.unwrap();

        let removed = recorder.prune(Duration::days(8)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.snapshot().usage.len(), 1);
    }
}
