//! Error Types
//!
//! Typed errors returned across the component boundary. Quota denial is not an
//! error; see [`crate::rate_limit::Admission`].

use crate::queue::QueueState;

/// Result alias for gate operations
pub type GateResult<T> = Result<T, GateError>;

/// Error types for admission, queue and store operations
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Rejected configuration or argument; no state was mutated
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No rate limit window or platform client is known for this platform
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// Queue item not found
    #[error("Queue item not found: {0}")]
    ItemNotFound(String),

    /// Requested queue state change is not an edge of the state graph
    #[error("Invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: QueueState,
        to: QueueState,
    },

    /// Durable store is unreachable; state was left unchanged
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl GateError {
    /// Shorthand for an `InvalidConfig` error
    pub fn invalid(msg: impl Into<String>) -> Self {
        GateError::InvalidConfig(msg.into())
    }

    /// Whether this error means the durable store could not be reached
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, GateError::StoreUnavailable(_))
    }
}

impl From<crate::store::StoreError> for GateError {
    fn from(err: crate::store::StoreError) -> Self {
        GateError::StoreUnavailable(err.to_string())
    }
}
