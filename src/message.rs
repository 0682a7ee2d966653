//! Control messages accepted from the application layer.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

use crate::net::Request;
use crate::sync::ReplaySummary;

/// Message sent by the application, tagged by `type`:
///
/// ```json
/// {"type": "CLEAR_CACHE", "name": "api"}
/// {"type": "QUEUE_REQUEST", "queueName": "match-join-queue", "request": {...}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
  tag = "type",
  rename_all = "SCREAMING_SNAKE_CASE",
  rename_all_fields = "camelCase"
)]
pub enum ControlMessage {
  /// Activate a waiting generation now
  SkipWaiting,
  /// Persist a request for later replay
  QueueRequest { queue_name: String, request: Request },
  /// Pre-warm the dynamic cache; relative URLs resolve against the origin
  CacheUrls { urls: Vec<String> },
  /// Wipe a logical cache of the active generation
  ClearCache { name: String },
  /// Retry every queue now
  ReplayQueues,
  /// Drop a queue's items without replaying them
  ClearQueue { name: String },
  GetVersion,
}

impl ControlMessage {
  pub fn from_json(input: &str) -> Result<Self> {
    serde_json::from_str(input).map_err(|e| eyre!("Invalid control message: {}", e))
  }
}

/// Answer to a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageReply {
  /// `version` is None when no generation was waiting
  Activated { version: Option<u32> },
  Queued { queue: String, id: i64 },
  Warmed { cached: usize, failed: usize },
  CacheCleared { name: String, removed: usize },
  Replayed { summaries: Vec<ReplaySummary> },
  QueueCleared { name: String, removed: usize },
  Version { active: Option<u32>, waiting: Option<u32> },
}
