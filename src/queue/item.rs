//! Queue items and their state graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::GateError;

/// Lifecycle state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Queued,
    Posting,
    Posted,
    Failed,
    Paused,
}

impl QueueState {
    /// Whether `self -> to` is an edge of the state graph.
    ///
    /// `Failed -> Queued` is only reachable through an operator requeue.
    pub fn can_transition_to(&self, to: QueueState) -> bool {
        use QueueState::*;
        matches!(
            (self, to),
            (Queued, Posting)
                | (Queued, Paused)
                | (Paused, Queued)
                | (Posting, Posted)
                | (Posting, Queued)
                | (Posting, Failed)
                | (Failed, Queued)
        )
    }

    /// No further automatic transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueState::Posted | QueueState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Queued => "queued",
            QueueState::Posting => "posting",
            QueueState::Posted => "posted",
            QueueState::Failed => "failed",
            QueueState::Paused => "paused",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueState::Queued),
            "posting" => Ok(QueueState::Posting),
            "posted" => Ok(QueueState::Posted),
            "failed" => Ok(QueueState::Failed),
            "paused" => Ok(QueueState::Paused),
            other => Err(GateError::invalid(format!("unknown queue state '{}'", other))),
        }
    }
}

/// Unit of outbound work for one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub platform: String,

    /// Opaque content handed to the platform client
    pub payload: serde_json::Value,

    pub state: QueueState,

    /// Earliest time the item may be dispatched
    pub scheduled_at: DateTime<Utc>,

    /// Publish attempts that ended in failure
    pub attempts: u32,

    pub last_error: Option<String>,

    /// Identifier returned by the platform on success
    pub remote_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Build a fresh `queued` item
    pub fn new(request: NewQueueItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            platform: request.platform,
            payload: request.payload,
            state: QueueState::Queued,
            scheduled_at: request.scheduled_at.unwrap_or(now),
            attempts: 0,
            last_error: None,
            remote_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Queued and due at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == QueueState::Queued && self.scheduled_at <= now
    }
}

/// Enqueue request from an upstream producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub platform: String,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewQueueItem {
    pub fn new(platform: &str, payload: serde_json::Value) -> Self {
        Self {
            platform: platform.to_string(),
            payload,
            scheduled_at: None,
        }
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Item counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub posting: usize,
    pub posted: usize,
    pub failed: usize,
    pub paused: usize,
}

impl QueueStats {
    pub(crate) fn count(&mut self, state: QueueState) {
        self.total += 1;
        match state {
            QueueState::Queued => self.queued += 1,
            QueueState::Posting => self.posting += 1,
            QueueState::Posted => self.posted += 1,
            QueueState::Failed => self.failed += 1,
            QueueState::Paused => self.paused += 1,
        }
    }
}
