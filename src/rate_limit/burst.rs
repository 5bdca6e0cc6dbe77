//! Burst Overrides
//!
//! A burst override temporarily raises a platform's quota by `factor` and
//! tapers linearly back to 1.0 over its duration. The effective factor is a
//! pure function of the stored override and the current time, so there is no
//! background timer to drift.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// Upper bound on override duration accepted from operators
pub const MAX_OVERRIDE_MINUTES: u32 = 240;

/// Temporary quota multiplier for one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstOverride {
    /// Platform key
    pub platform: String,

    /// Initial multiplier (>= 1.0)
    pub factor: f64,

    /// When the override was set
    pub started_at: DateTime<Utc>,

    /// How long the override takes to decay back to 1.0
    pub duration_minutes: u32,
}

impl BurstOverride {
    /// Validate and build an override starting at `now`
    pub fn new(platform: &str, factor: f64, minutes: u32, now: DateTime<Utc>) -> GateResult<Self> {
        validate(factor, minutes)?;
        Ok(Self {
            platform: platform.to_string(),
            factor,
            started_at: now,
            duration_minutes: minutes,
        })
    }

    /// Total decay duration
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes as i64)
    }

    /// Instant at which the factor reaches 1.0
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.started_at + self.duration()
    }

    /// Whether the override no longer has any effect at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Check operator-supplied override parameters
pub fn validate(factor: f64, minutes: u32) -> GateResult<()> {
    if !factor.is_finite() || factor < 1.0 {
        return Err(GateError::invalid(format!(
            "override factor must be a finite number >= 1, got {}",
            factor
        )));
    }
    if minutes == 0 {
        return Err(GateError::invalid("override minutes must be > 0"));
    }
    if minutes > MAX_OVERRIDE_MINUTES {
        return Err(GateError::invalid(format!(
            "override minutes must be <= {}, got {}",
            MAX_OVERRIDE_MINUTES, minutes
        )));
    }
    Ok(())
}

/// Currently effective multiplier for an optional override.
///
/// `1 + (factor - 1) * (1 - elapsed / duration)` with `elapsed` clamped to
/// `[0, duration]`; 1.0 when there is no override or it has expired.
pub fn effective_factor(burst: Option<&BurstOverride>, now: DateTime<Utc>) -> f64 {
    let Some(burst) = burst else {
        return 1.0;
    };
    if burst.is_expired(now) || burst.factor <= 1.0 {
        return 1.0;
    }

    let total_ms = burst.duration().num_milliseconds().max(1) as f64;
    let elapsed_ms = (now - burst.started_at)
        .num_milliseconds()
        .clamp(0, total_ms as i64) as f64;

    1.0 + (burst.factor - 1.0) * (1.0 - elapsed_ms / total_ms)
}
