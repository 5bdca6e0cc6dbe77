//! Publish Gate Library
//!
//! Admission control and a retrying posting queue for outbound calls to
//! rate-limited third-party platforms: per-platform quota windows with
//! decaying burst overrides, usage history, SLO health and an admin API.

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod server;
pub mod slo;
pub mod store;
pub mod usage;

pub use error::{GateError, GateResult};
pub use gate::{GateSettings, PublishGate};
