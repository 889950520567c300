//! Status API endpoint handlers.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness plus a per-health stream count |
//! | `GET` | `/api/streams` | Every sync stream's status |
//! | `GET` | `/api/streams/{stream_id}` | One sync stream's status |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Serialize;
use twinhub_sync::{StreamStatus, SyncHealth};

use crate::error::ObserverError;
use crate::state::AppState;

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests.
    pub status: &'static str,
    /// Seconds since start.
    pub uptime_secs: i64,
    /// Streams within the warning offset.
    pub healthy_streams: usize,
    /// Streams past the warning offset.
    pub warning_streams: usize,
    /// Streams past the error offset.
    pub error_streams: usize,
}

/// Liveness. Stream lag is reported, never turned into a failing health check.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let streams = state.board.all().await;
    let count = |health: SyncHealth| streams.iter().filter(|s| s.health == health).count();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: Utc::now()
            .signed_duration_since(state.started_at)
            .num_seconds(),
        healthy_streams: count(SyncHealth::Healthy),
        warning_streams: count(SyncHealth::Warning),
        error_streams: count(SyncHealth::Error),
    })
}

/// All streams, ordered by stream id.
pub async fn list_streams(State(state): State<Arc<AppState>>) -> Json<Vec<StreamStatus>> {
    Json(state.board.all().await)
}

/// One stream by id.
///
/// # Errors
///
/// Returns [`ObserverError::NotFound`] if no supervisor has reported under
/// `stream_id`.
pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamStatus>, ObserverError> {
    state
        .board
        .get(&stream_id)
        .await
        .map(Json)
        .ok_or_else(|| ObserverError::NotFound(format!("stream {stream_id} not found")))
}
