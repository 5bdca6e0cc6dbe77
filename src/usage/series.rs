//! Usage Series
//!
//! Pure aggregation of usage events into contiguous, zero-filled buckets plus
//! display helpers (moving average, CSV). None of this feeds back into
//! admission.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;

use super::UsageEvent;
use crate::error::GateError;

/// Bucket width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    /// Width of one bucket
    pub fn width(&self) -> Duration {
        match self {
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
        }
    }

    /// Trailing moving-average length used for charts
    pub fn smoothing(&self) -> usize {
        match self {
            Granularity::Hour => 3,
            Granularity::Day => 2,
        }
    }
}

/// Supported query windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UsageWindow {
    #[serde(rename = "6h")]
    SixHours,
    #[default]
    #[serde(rename = "24h")]
    TwentyFourHours,
    #[serde(rename = "7d")]
    SevenDays,
}

impl UsageWindow {
    /// Total span covered by the series
    pub fn span(&self) -> Duration {
        match self {
            UsageWindow::SixHours => Duration::hours(6),
            UsageWindow::TwentyFourHours => Duration::hours(24),
            UsageWindow::SevenDays => Duration::days(7),
        }
    }

    /// Bucket width for this window
    pub fn granularity(&self) -> Granularity {
        match self {
            UsageWindow::SevenDays => Granularity::Day,
            _ => Granularity::Hour,
        }
    }

    /// Number of buckets in the series (`span / width`)
    pub fn bucket_count(&self) -> usize {
        (self.span().num_seconds() / self.granularity().width().num_seconds()) as usize
    }

    /// Wire label (`6h`, `24h`, `7d`)
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageWindow::SixHours => "6h",
            UsageWindow::TwentyFourHours => "24h",
            UsageWindow::SevenDays => "7d",
        }
    }
}

impl std::fmt::Display for UsageWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageWindow {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "6h" => Ok(UsageWindow::SixHours),
            "24h" => Ok(UsageWindow::TwentyFourHours),
            "7d" => Ok(UsageWindow::SevenDays),
            other => Err(GateError::invalid(format!(
                "unsupported usage window '{}', expected 6h, 24h or 7d",
                other
            ))),
        }
    }
}

/// Granted actions within one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub platform: String,
    pub bucket_start: DateTime<Utc>,
    pub granularity: Granularity,
    pub total: u64,
}

/// Roll granted events into `window.bucket_count()` buckets ending at `now`.
///
/// Bucket `i` covers `[now - span + i*width, now - span + (i+1)*width)`; the
/// last bucket also includes `now` itself. Events outside `[now - span, now]`
/// and denied events are ignored.
pub fn bucketize(
    platform: &str,
    events: &[UsageEvent],
    window: UsageWindow,
    now: DateTime<Utc>,
) -> Vec<UsageBucket> {
    let granularity = window.granularity();
    let width = granularity.width();
    let count = window.bucket_count();
    let start = now - window.span();

    let mut buckets: Vec<UsageBucket> = (0..count)
        .map(|i| UsageBucket {
            platform: platform.to_string(),
            bucket_start: start + width * i as i32,
            granularity,
            total: 0,
        })
        .collect();

    let width_ms = width.num_milliseconds();
    for event in events {
        if !event.granted || event.platform != platform {
            continue;
        }
        if event.timestamp < start || event.timestamp > now {
            continue;
        }
        let offset_ms = (event.timestamp - start).num_milliseconds();
        let index = ((offset_ms / width_ms) as usize).min(count.saturating_sub(1));
        if let Some(bucket) = buckets.get_mut(index) {
            bucket.total += event.delta as u64;
        }
    }

    buckets
}

/// Trailing mean over the last `k` buckets, shrinking at the start of the series
pub fn moving_average(buckets: &[UsageBucket], k: usize) -> Vec<f64> {
    let k = k.max(1);
    let mut out = Vec::with_capacity(buckets.len());
    let mut running: u64 = 0;

    for (i, bucket) in buckets.iter().enumerate() {
        running += bucket.total;
        if i >= k {
            running -= buckets[i - k].total;
        }
        let len = (i + 1).min(k);
        out.push(running as f64 / len as f64);
    }

    out
}

/// Render a series as `bucket_start,total,moving_average` CSV
pub fn to_csv(buckets: &[UsageBucket], averages: &[f64]) -> String {
    let mut csv = String::from("bucket_start,total,moving_average\n");
    for (i, bucket) in buckets.iter().enumerate() {
        let avg = averages.get(i).copied().unwrap_or(0.0);
        // Writing into a String cannot fail
        let _ = writeln!(
            csv,
            "{},{},{:.2}",
            bucket.bucket_start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            bucket.total,
            avg
        );
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(total: u64) -> UsageBucket {
        UsageBucket {
            platform: "x".to_string(),
            bucket_start: Utc::now(),
            granularity: Granularity::Hour,
            total,
        }
    }

    #[test]
    fn test_window_parsing() {
        assert_eq!("6h".parse::<UsageWindow>().unwrap(), UsageWindow::SixHours);
        assert_eq!("24h".parse::<UsageWindow>().unwrap(), UsageWindow::TwentyFourHours);
        assert_eq!("7d".parse::<UsageWindow>().unwrap(), UsageWindow::SevenDays);
        assert!("1h".parse::<UsageWindow>().is_err());
    }

    #[test]
    fn test_bucket_counts() {
        assert_eq!(UsageWindow::SixHours.bucket_count(), 6);
        assert_eq!(UsageWindow::TwentyFourHours.bucket_count(), 24);
        assert_eq!(UsageWindow::SevenDays.bucket_count(), 7);
        assert_eq!(UsageWindow::SevenDays.granularity(), Granularity::Day);
    }

    #[test]
    fn test_bucketize_zero_fills() {
        let now = Utc::now();
        let buckets = bucketize("x", &[], UsageWindow::TwentyFourHours, now);
        assert_eq!(buckets.len(), 24);
        assert!(buckets.iter().all(|b| b.total == 0));
        assert_eq!(buckets[0].bucket_start, now - Duration::hours(24));
        assert_eq!(buckets[23].bucket_start, now - Duration::hours(1));
    }

    #[test]
    fn test_bucketize_places_events() {
        let now = Utc::now();
        let events = vec![
            UsageEvent::granted("x", now, 1),
            UsageEvent::granted("x", now - Duration::minutes(30), 2),
            UsageEvent::granted("x", now - Duration::minutes(330), 1),
            UsageEvent::granted("x", now - Duration::hours(6), 1),
            UsageEvent::denied("x", now - Duration::minutes(10), 1),
            UsageEvent::granted("x", now - Duration::hours(7), 5),
            UsageEvent::granted("y", now, 9),
        ];

        let buckets = bucketize("x", &events, UsageWindow::SixHours, now);
        assert_eq!(buckets.len(), 6);
        // the event exactly at `now` lands in the last bucket
        assert_eq!(buckets[5].total, 3);
        // [now-6h, now-5h) holds the boundary event and the 5.5h-old one
        assert_eq!(buckets[0].total, 2);
        let sum: u64 = buckets.iter().map(|b| b.total).sum();
        assert_eq!(sum, 5);
    }

    #[test]
    fn test_moving_average_shrinks_at_start() {
        let buckets: Vec<_> = [3, 6, 9, 0, 0].iter().map(|&t| bucket(t)).collect();
        let avg = moving_average(&buckets, 3);
        assert_eq!(avg, vec![3.0, 4.5, 6.0, 5.0, 3.0]);
    }

    #[test]
    fn test_moving_average_degenerate_k() {
        let buckets: Vec<_> = [4, 8].iter().map(|&t| bucket(t)).collect();
        assert_eq!(moving_average(&buckets, 0), vec![4.0, 8.0]);
        assert!(moving_average(&[], 3).is_empty());
    }

    #[test]
    fn test_csv_format() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let buckets = vec![
            UsageBucket {
                platform: "x".to_string(),
                bucket_start: start,
                granularity: Granularity::Hour,
                total: 4,
            },
            UsageBucket {
                platform: "x".to_string(),
                bucket_start: start + Duration::hours(1),
                granularity: Granularity::Hour,
                total: 1,
            },
        ];
        let csv = to_csv(&buckets, &moving_average(&buckets, 3));
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "bucket_start,total,moving_average");
        assert_eq!(lines[1], "2023-11-14T22:13:20Z,4,4.00");
        assert_eq!(lines[2], "2023-11-14T23:13:20Z,1,2.50");
    }
}
