//! Posting Queue and Dispatcher
//!
//! Items move through `queued -> posting -> {posted | queued (retry) | failed}`,
//! with `queued <-> paused` at any time and an operator-only `failed -> queued`
//! requeue. Delivery is at-least-once with bounded retries.

pub mod client;
pub mod dispatcher;
pub mod item;
pub mod posting_queue;
pub mod retry;

pub use client::{
    is_retryable_status, HttpClientConfig, HttpPlatformClient, PlatformClient, PlatformClients,
    PublishError, PublishReceipt,
};
pub use dispatcher::{Dispatcher, DispatcherConfig, StepOutcome};
pub use item::{NewQueueItem, QueueItem, QueueStats, QueueState};
pub use posting_queue::{FailureKind, PostingQueue, INTERRUPTED_BY_RESTART};
pub use retry::{calculate_retry_delay, RetryConfig, RetryDecision};
