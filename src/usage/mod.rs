//! Usage Recording and Aggregation
//!
//! Every admission decision is logged as a [`UsageEvent`]. Events are rolled
//! into hourly or daily buckets for the 6h / 24h / 7d dashboard views, with a
//! trailing moving average and CSV export.

pub mod recorder;
pub mod series;

pub use recorder::{UsageEvent, UsageRecorder, UsageSeries};
pub use series::{bucketize, moving_average, to_csv, Granularity, UsageBucket, UsageWindow};
