//! Sync stream checkpoints.
//!
//! A checkpoint is the timestamp up to which a sync stream has delivered
//! every notification. Exactly one supervisor writes each stream id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::DbError;

/// Durable last-synced timestamp per sync stream.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The stored checkpoint for `stream_id`, or `None` if the stream has
    /// never completed a window.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be read.
    async fn get(&self, stream_id: &str) -> Result<Option<DateTime<Utc>>, DbError>;

    /// Store `timestamp` as the checkpoint for `stream_id`.
    ///
    /// Must be atomic and durable before returning.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails; the previous value stands.
    async fn set(&self, stream_id: &str, timestamp: DateTime<Utc>) -> Result<(), DbError>;
}

/// Checkpoints in the `sync_checkpoints` table.
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Create a checkpoint store bound to a connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, stream_id: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as(r"SELECT last_synced FROM sync_checkpoints WHERE stream_id = $1")
                .bind(stream_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(ts,)| ts))
    }

    /// Upsert with `GREATEST`, so a stale writer can never move the
    /// checkpoint backwards.
    async fn set(&self, stream_id: &str, timestamp: DateTime<Utc>) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO sync_checkpoints (stream_id, last_synced, updated_at)
              VALUES ($1, $2, now())
              ON CONFLICT (stream_id) DO UPDATE SET
                last_synced = GREATEST(sync_checkpoints.last_synced, EXCLUDED.last_synced),
                updated_at = now()",
        )
        .bind(stream_id)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        tracing::debug!(stream_id, %timestamp, "Stored checkpoint");
        Ok(())
    }
}
