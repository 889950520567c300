//! Shared view of every sync stream's progress.
//!
//! Supervisors write their own entry after each cycle; the status API reads
//! the whole board.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use twinhub_types::EntityKind;

/// Coarse health derived from checkpoint lag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncHealth {
    /// Lag within the warning offset.
    Healthy,
    /// Lag above the warning offset.
    Warning,
    /// Lag above the error offset.
    Error,
}

/// Classify a lag against the outdated offsets.
pub const fn classify(lag_ms: u64, warning_ms: u64, error_ms: u64) -> SyncHealth {
    if lag_ms > error_ms {
        SyncHealth::Error
    } else if lag_ms > warning_ms {
        SyncHealth::Warning
    } else {
        SyncHealth::Healthy
    }
}

/// Progress of one sync stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    /// Stream id, also the checkpoint key.
    pub stream_id: String,
    /// Entity kind the stream follows.
    pub kind: EntityKind,
    /// Last stored checkpoint, if any.
    pub checkpoint: Option<DateTime<Utc>>,
    /// Milliseconds between the checkpoint and the last cycle.
    pub lag_ms: u64,
    /// Health derived from `lag_ms`.
    pub health: SyncHealth,
    /// Failed windows since the last success.
    pub consecutive_failures: u32,
    /// Message of the most recent failure, cleared on success.
    pub last_error: Option<String>,
    /// Tags published by the last successful window.
    pub last_window_tags: usize,
    /// When the last cycle ran.
    pub updated_at: DateTime<Utc>,
}

/// Board of stream statuses keyed by stream id.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    streams: Arc<RwLock<BTreeMap<String, StreamStatus>>>,
}

impl StatusBoard {
    /// An empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `status.stream_id`.
    pub async fn update(&self, status: StreamStatus) {
        self.streams
            .write()
            .await
            .insert(status.stream_id.clone(), status);
    }

    /// The entry for `stream_id`.
    pub async fn get(&self, stream_id: &str) -> Option<StreamStatus> {
        self.streams.read().await.get(stream_id).cloned()
    }

    /// Every entry, ordered by stream id.
    pub async fn all(&self) -> Vec<StreamStatus> {
        self.streams.read().await.values().cloned().collect()
    }
}
