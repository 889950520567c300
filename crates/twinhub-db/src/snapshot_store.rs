//! Snapshot persistence for entity state.
//!
//! A snapshot is the serialized [`Entity`] at some revision. Recovery loads
//! the newest one and replays only the events after it.

use sqlx::PgPool;
use twinhub_types::{Entity, EntityId};

use crate::error::{DbError, revision_to_db};

/// Operations on the `entity_snapshots` table.
pub struct SnapshotStore<'a> {
    pool: &'a PgPool,
}

impl<'a> SnapshotStore<'a> {
    /// Create a snapshot store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert the snapshot for `entity` at its current revision.
    ///
    /// Uses `ON CONFLICT` so rewriting the same revision is idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if serialization or the insert fails.
    pub async fn insert(&self, entity: &Entity) -> Result<(), DbError> {
        let snapshot = serde_json::to_value(entity)?;

        sqlx::query(
            r"INSERT INTO entity_snapshots (kind, entity_key, revision, snapshot)
              VALUES ($1, $2, $3, $4)
              ON CONFLICT (kind, entity_key, revision) DO UPDATE SET
                snapshot = EXCLUDED.snapshot,
                created_at = now()",
        )
        .bind(entity.id.kind.as_str())
        .bind(&entity.id.key)
        .bind(revision_to_db(entity.revision)?)
        .bind(&snapshot)
        .execute(self.pool)
        .await?;

        tracing::debug!(entity_id = %entity.id, revision = entity.revision, "Inserted snapshot");
        Ok(())
    }

    /// The snapshot with the highest revision for `entity_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the stored JSON does not
    /// decode.
    pub async fn latest(&self, entity_id: &EntityId) -> Result<Option<Entity>, DbError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            r"SELECT snapshot FROM entity_snapshots
              WHERE kind = $1 AND entity_key = $2
              ORDER BY revision DESC
              LIMIT 1",
        )
        .bind(entity_id.kind.as_str())
        .bind(&entity_id.key)
        .fetch_optional(self.pool)
        .await?;

        row.map(|(json,)| serde_json::from_value(json).map_err(DbError::from))
            .transpose()
    }
}
