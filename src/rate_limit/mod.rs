//! Rate Limiting
//!
//! Fixed-window quotas per platform with temporary burst overrides.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Rate Limit Registry                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐         │
//! │  │ platform A  │  │ platform B  │  │ platform C  │  ...    │
//! │  │ window+burst│  │ window+burst│  │ window+burst│         │
//! │  └─────────────┘  └─────────────┘  └─────────────┘         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │          Store (persist, then publish snapshot)      │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod burst;
pub mod registry;
pub mod window;

pub use burst::{effective_factor, BurstOverride, MAX_OVERRIDE_MINUTES};
pub use registry::{Admission, LimitDefaults, RateLimitRegistry};
pub use window::{RateLimitWindow, DEFAULT_MAX_ACTIONS, DEFAULT_WINDOW_SECONDS};
