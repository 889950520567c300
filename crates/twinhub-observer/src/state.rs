//! Shared state for the status API.

use chrono::{DateTime, Utc};
use twinhub_sync::StatusBoard;

/// What the handlers read from.
///
/// The board is shared with the sync supervisors, which write their own
/// entries after every cycle. Handlers only read.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Progress of every sync stream.
    pub board: StatusBoard,
    /// When the engine started serving.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// State over `board`, started now.
    pub fn new(board: StatusBoard) -> Self {
        Self {
            board,
            started_at: Utc::now(),
        }
    }
}
