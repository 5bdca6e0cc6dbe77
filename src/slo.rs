//! SLO Aggregation
//!
//! Derives health indicators from the current queue and registry state:
//! error rate over a trailing window, age of the oldest queued item, and per
//! platform quota saturation. Everything is computed on demand from snapshot
//! reads; nothing here takes an admission lock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

use crate::clock::Clock;
use crate::queue::PostingQueue;
use crate::rate_limit::RateLimitRegistry;

/// Error rate (percent) above which health is critical
pub const ERROR_RATE_CRITICAL_PCT: f64 = 5.0;
/// Error rate (percent) above which health is degraded
pub const ERROR_RATE_DEGRADED_PCT: f64 = 2.0;
/// Queue age (minutes) above which health is critical
pub const QUEUE_AGE_CRITICAL_MINUTES: f64 = 30.0;
/// Queue age (minutes) above which health is degraded
pub const QUEUE_AGE_DEGRADED_MINUTES: f64 = 15.0;
/// Saturation (percent) above which a platform raises an alert
pub const SATURATION_ALERT_PCT: u32 = 90;

/// Default trailing window for the error rate
pub const DEFAULT_ERROR_RATE_WINDOW_MINUTES: u32 = 60;

/// Health classification, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

pub fn classify_error_rate(pct: f64) -> HealthStatus {
    if pct > ERROR_RATE_CRITICAL_PCT {
        HealthStatus::Critical
    } else if pct > ERROR_RATE_DEGRADED_PCT {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

pub fn classify_queue_age(minutes: f64) -> HealthStatus {
    if minutes > QUEUE_AGE_CRITICAL_MINUTES {
        HealthStatus::Critical
    } else if minutes > QUEUE_AGE_DEGRADED_MINUTES {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSaturation {
    pub platform: String,
    pub pct: u32,
}

/// Point-in-time health view for dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SloSnapshot {
    /// Percent of completed items that failed in the trailing window
    pub error_rate: f64,
    pub error_rate_window_minutes: u32,

    /// Minutes the oldest queued item has been due
    pub queue_age: f64,

    pub rate_limit_saturation: Vec<PlatformSaturation>,

    pub error_rate_status: HealthStatus,
    pub queue_age_status: HealthStatus,

    /// Worst of the error rate and queue age classifications
    pub status: HealthStatus,

    /// Reason dispatch is halted, if it is
    pub dispatch_halted: Option<String>,

    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ErrorRate,
    QueueAge,
    Saturation,
    StoreOutage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub message: String,
}

/// Alerts raised by a snapshot
pub fn evaluate_alerts(snapshot: &SloSnapshot) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if let Some(reason) = &snapshot.dispatch_halted {
        alerts.push(Alert {
            kind: AlertKind::StoreOutage,
            severity: AlertSeverity::Critical,
            platform: None,
            message: format!("dispatch halted: {}", reason),
        });
    }
    if snapshot.error_rate_status == HealthStatus::Critical {
        alerts.push(Alert {
            kind: AlertKind::ErrorRate,
            severity: AlertSeverity::Critical,
            platform: None,
            message: format!(
                "error rate {:.1}% over the last {} minutes",
                snapshot.error_rate, snapshot.error_rate_window_minutes
            ),
        });
    }
    if snapshot.queue_age_status == HealthStatus::Critical {
        alerts.push(Alert {
            kind: AlertKind::QueueAge,
            severity: AlertSeverity::Critical,
            platform: None,
            message: format!("oldest queued item is {:.0} minutes overdue", snapshot.queue_age),
        });
    }
    for sat in &snapshot.rate_limit_saturation {
        if sat.pct > SATURATION_ALERT_PCT {
            alerts.push(Alert {
                kind: AlertKind::Saturation,
                severity: AlertSeverity::Warning,
                platform: Some(sat.platform.clone()),
                message: format!("{} is at {}% of its rate limit", sat.platform, sat.pct),
            });
        }
    }

    alerts
}

/// Emit alerts on the log at warn / error level
pub fn log_alerts(alerts: &[Alert]) {
    for alert in alerts {
        match alert.severity {
            AlertSeverity::Critical => error!(
                target: "audit",
                event = "alert.raised",
                kind = ?alert.kind,
                platform = alert.platform.as_deref().unwrap_or(""),
                "CRITICAL: {}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                target: "audit",
                event = "alert.raised",
                kind = ?alert.kind,
                platform = alert.platform.as_deref().unwrap_or(""),
                "{}",
                alert.message
            ),
        }
    }
}

/// Computes SLO indicators from queue and registry snapshots
#[derive(Debug, Clone)]
pub struct SloAggregator {
    queue: Arc<PostingQueue>,
    registry: Arc<RateLimitRegistry>,
    clock: Arc<dyn Clock>,
    error_rate_window_minutes: u32,
}

impl SloAggregator {
    pub fn new(
        queue: Arc<PostingQueue>,
        registry: Arc<RateLimitRegistry>,
        clock: Arc<dyn Clock>,
        error_rate_window_minutes: u32,
    ) -> Self {
        Self {
            queue,
            registry,
            clock,
            error_rate_window_minutes,
        }
    }

    /// `100 * failed / (failed + posted)` over items finished in the trailing window
    pub async fn error_rate(&self, window_minutes: u32) -> f64 {
        let since = self.clock.now() - Duration::minutes(window_minutes as i64);
        let (posted, failed) = self.queue.terminal_since(since).await;
        let completed = posted + failed;
        if completed == 0 {
            0.0
        } else {
            failed as f64 / completed as f64 * 100.0
        }
    }

    /// How long the oldest queued item has been due; zero if none is overdue
    pub async fn queue_age(&self) -> Duration {
        match self.queue.oldest_queued().await {
            Some(scheduled_at) => (self.clock.now() - scheduled_at).max(Duration::zero()),
            None => Duration::zero(),
        }
    }

    /// Quota saturation for one platform
    pub fn saturation(&self, platform: &str) -> Option<u32> {
        self.registry.saturation(platform)
    }

    pub async fn snapshot(&self) -> SloSnapshot {
        let error_rate = self.error_rate(self.error_rate_window_minutes).await;
        let queue_age = self.queue_age().await.num_seconds() as f64 / 60.0;
        let error_rate_status = classify_error_rate(error_rate);
        let queue_age_status = classify_queue_age(queue_age);

        SloSnapshot {
            error_rate,
            error_rate_window_minutes: self.error_rate_window_minutes,
            queue_age,
            rate_limit_saturation: self
                .registry
                .saturations()
                .into_iter()
                .map(|(platform, pct)| PlatformSaturation { platform, pct })
                .collect(),
            error_rate_status,
            queue_age_status,
            status: error_rate_status.max(queue_age_status),
            dispatch_halted: self.queue.halted_reason().await,
            generated_at: self.clock.now(),
        }
    }

    /// Current alerts
    pub async fn alerts(&self) -> Vec<Alert> {
        evaluate_alerts(&self.snapshot().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::{FailureKind, NewQueueItem, RetryConfig};
    use crate::rate_limit::LimitDefaults;
    use crate::store::MemoryStore;
    use crate::usage::UsageRecorder;
    use serde_json::json;

    #[test]
    fn test_error_rate_thresholds() {
        assert_eq!(classify_error_rate(6.0), HealthStatus::Critical);
        assert_eq!(classify_error_rate(3.0), HealthStatus::Degraded);
        assert_eq!(classify_error_rate(1.0), HealthStatus::Healthy);
        // cutoffs are strict
        assert_eq!(classify_error_rate(5.0), HealthStatus::Degraded);
        assert_eq!(classify_error_rate(2.0), HealthStatus::Healthy);
    }

    #[test]
    fn test_queue_age_thresholds() {
        assert_eq!(classify_queue_age(31.0), HealthStatus::Critical);
        assert_eq!(classify_queue_age(16.0), HealthStatus::Degraded);
        assert_eq!(classify_queue_age(15.0), HealthStatus::Healthy);
        assert_eq!(classify_queue_age(0.0), HealthStatus::Healthy);
    }

    struct Fixture {
        slo: SloAggregator,
        queue: Arc<PostingQueue>,
        registry: Arc<RateLimitRegistry>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new());
        let recorder = UsageRecorder::new(store.clone(), clock.clone());
        let registry = Arc::new(RateLimitRegistry::new(
            store.clone(),
            clock.clone(),
            recorder,
            LimitDefaults::default(),
        ));
        let queue = Arc::new(PostingQueue::new(store, clock.clone()));
        let slo = SloAggregator::new(queue.clone(), registry.clone(), clock.clone(), 60);
        Fixture {
            slo,
            queue,
            registry,
            clock,
        }
    }

    async fn finish(queue: &PostingQueue, posted: bool) {
        let item = queue.enqueue(NewQueueItem::new("x", json!({}))).await.unwrap();
        queue.begin_posting(&item.id).await.unwrap();
        if posted {
            queue.mark_posted(&item.id, None).await.unwrap();
        } else {
            queue
                .record_failure(&item.id, "boom", FailureKind::Permanent, &RetryConfig::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_error_rate_over_window() {
        let f = fixture();
        assert_eq!(f.slo.error_rate(60).await, 0.0);

        for _ in 0..3 {
            finish(&f.queue, true).await;
        }
        finish(&f.queue, false).await;
        assert_eq!(f.slo.error_rate(60).await, 25.0);

        // completions age out of the trailing window
        f.clock.advance(Duration::minutes(61));
        assert_eq!(f.slo.error_rate(60).await, 0.0);
    }

    #[tokio::test]
    async fn test_six_percent_is_critical() {
        let f = fixture();
        for i in 0..50 {
            finish(&f.queue, i >= 3).await;
        }
        let snapshot = f.slo.snapshot().await;
        assert_eq!(snapshot.error_rate, 6.0);
        assert_eq!(snapshot.error_rate_status, HealthStatus::Critical);
        assert_eq!(snapshot.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_queue_age() {
        let f = fixture();
        assert_eq!(f.slo.queue_age().await, Duration::zero());

        let now = f.clock.now();
        f.queue
            .enqueue(NewQueueItem::new("x", json!({})).scheduled_at(now - Duration::minutes(20)))
            .await
            .unwrap();
        f.queue
            .enqueue(NewQueueItem::new("x", json!({})).scheduled_at(now + Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(f.slo.queue_age().await, Duration::minutes(20));
        let snapshot = f.slo.snapshot().await;
        assert_eq!(snapshot.queue_age_status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_future_only_queue_has_zero_age() {
        let f = fixture();
        let later = f.clock.now() + Duration::hours(2);
        f.queue
            .enqueue(NewQueueItem::new("x", json!({})).scheduled_at(later))
            .await
            .unwrap();
        assert_eq!(f.slo.queue_age().await, Duration::zero());
    }

    #[tokio::test]
    async fn test_alerts() {
        let f = fixture();
        f.registry.configure("hot", 60, 10).await.unwrap();
        f.registry.acquire("hot", 10).await.unwrap();
        f.registry.configure("cold", 60, 10).await.unwrap();
        f.queue.halt_all("store unavailable").await;

        let alerts = f.slo.alerts().await;
        assert!(alerts
            .iter()
            .any(|a| a.kind == AlertKind::StoreOutage && a.severity == AlertSeverity::Critical));
        let saturation: Vec<_> = alerts
            .iter()
            .filter(|a| a.kind == AlertKind::Saturation)
            .collect();
        assert_eq!(saturation.len(), 1);
        assert_eq!(saturation[0].platform.as_deref(), Some("hot"));
    }

    #[tokio::test]
    async fn test_snapshot_serializes_camel_case() {
        let f = fixture();
        f.registry.configure("x", 60, 4).await.unwrap();
        f.registry.acquire("x", 1).await.unwrap();

        let value = serde_json::to_value(f.slo.snapshot().await).unwrap();
        assert_eq!(value["errorRate"], json!(0.0));
        assert_eq!(value["queueAge"], json!(0.0));
        assert_eq!(
            value["rateLimitSaturation"],
            json!([{"platform": "x", "pct": 25}])
        );
        assert_eq!(value["status"], json!("healthy"));
    }
}
