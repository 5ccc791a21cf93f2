use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// A message received from a queue, owned by whoever is currently handling it.
///
/// `visibility_deadline` is monotonic (tokio clock) so that visibility
/// bookkeeping is immune to wall-clock jumps; `received_at` is wall-clock and
/// only used for reporting.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Broker message id (stable across redeliveries)
    pub id: String,
    /// Token used for delete/change-visibility; changes on every receive
    pub receipt_handle: String,
    /// Identifier of the queue this message was received from
    pub queue: String,
    pub body: Bytes,
    /// Message and system attributes, flattened to strings
    pub attributes: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
    pub visibility_deadline: Instant,
}

impl InboundMessage {
    /// Body as UTF-8, if it is valid UTF-8
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Time left before the message becomes visible to other consumers
    pub fn remaining_visibility(&self) -> Duration {
        self.visibility_deadline.saturating_duration_since(Instant::now())
    }

    /// Number of times the broker has delivered this message, when reported
    pub fn receive_count(&self) -> Option<u32> {
        self.attribute(APPROXIMATE_RECEIVE_COUNT)
            .and_then(|v| v.parse().ok())
    }
}

/// System attribute carrying the broker's delivery counter
pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

// ============================================================================
// Deletion Policy
// ============================================================================

/// Decides whether a processed message is removed from its queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Delete after processing, whatever the outcome
    Always,
    /// Never delete; the handler acknowledges explicitly
    Never,
    /// Delete only when the handler succeeded
    #[default]
    OnSuccess,
}

impl DeletionPolicy {
    /// Whether the container deletes a message that finished with the given result
    pub fn deletes_on(self, success: bool) -> bool {
        match self {
            DeletionPolicy::Always => true,
            DeletionPolicy::Never => false,
            DeletionPolicy::OnSuccess => success,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionPolicy::Always => "always",
            DeletionPolicy::Never => "never",
            DeletionPolicy::OnSuccess => "on_success",
        }
    }
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "always" => Ok(DeletionPolicy::Always),
            "never" => Ok(DeletionPolicy::Never),
            "on_success" => Ok(DeletionPolicy::OnSuccess),
            other => Err(format!("unknown deletion policy: {}", other)),
        }
    }
}
