//! `PostgreSQL`-backed entity journal.
//!
//! Events live in `journal_events`, one row per `(kind, entity_key,
//! revision)`. The append statement inserts only when the previous revision
//! exists, so gaps and duplicates are both refused by the database itself.
//!
//! Besides the [`EntityJournal`] operations, the journal answers the two
//! queries the sync streams need: which entities of a kind changed inside a
//! time window, and which things are currently bound to a policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use twinhub_types::{
    ChangeRecord, Entity, EntityId, EntityKind, Event, EventPayload, EventType, Revision,
};

use crate::error::{DbError, JournalError, revision_from_db, revision_to_db};
use crate::journal::EntityJournal;
use crate::snapshot_store::SnapshotStore;

/// Event types that set or clear a thing's policy binding.
const BINDING_EVENT_TYPES: [EventType; 4] = [
    EventType::ThingCreated,
    EventType::ThingModified,
    EventType::PolicyIdModified,
    EventType::ThingDeleted,
];

/// Journal stored in `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PgJournal {
    pool: PgPool,
}

impl PgJournal {
    /// Create a journal bound to a connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Highest stored revision for `entity_id`, 0 if the log is empty.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn highest_revision(&self, entity_id: &EntityId) -> Result<Revision, DbError> {
        let (max,): (i64,) = sqlx::query_as(
            r"SELECT COALESCE(MAX(revision), 0) FROM journal_events
              WHERE kind = $1 AND entity_key = $2",
        )
        .bind(entity_id.kind.as_str())
        .bind(&entity_id.key)
        .fetch_one(&self.pool)
        .await?;
        revision_from_db(max)
    }

    /// Entities of `kind` with an event in `(after, until]`.
    ///
    /// One record per entity, carrying its latest revision inside the
    /// window, ordered by timestamp ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row cannot be decoded.
    pub async fn changes_between(
        &self,
        kind: EntityKind,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, DbError> {
        let rows: Vec<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            r"SELECT entity_key, revision, created_at FROM (
                SELECT DISTINCT ON (entity_key) entity_key, revision, created_at
                FROM journal_events
                WHERE kind = $1 AND created_at > $2 AND created_at <= $3
                ORDER BY entity_key, revision DESC
              ) latest
              ORDER BY created_at, entity_key",
        )
        .bind(kind.as_str())
        .bind(after)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, revision, created_at)| {
                Ok(ChangeRecord {
                    entity_id: EntityId::new(kind, key),
                    timestamp: created_at,
                    revision: revision_from_db(revision)?,
                })
            })
            .collect()
    }

    /// Things whose latest binding event points at `policy_key`.
    ///
    /// This is a point-in-time read; a binding that changes right after the
    /// query is picked up by the thing's own stream.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn things_bound_to(&self, policy_key: &str) -> Result<Vec<EntityId>, DbError> {
        let event_types: Vec<&str> = BINDING_EVENT_TYPES.iter().map(|t| t.as_str()).collect();
        let rows: Vec<(String,)> = sqlx::query_as(
            r"SELECT entity_key FROM (
                SELECT DISTINCT ON (entity_key) entity_key, event_type,
                       COALESCE(payload -> 'thing' ->> 'policy_id', payload ->> 'policy_id') AS policy_id
                FROM journal_events
                WHERE kind = 'thing' AND event_type = ANY($2)
                ORDER BY entity_key, revision DESC
              ) latest
              WHERE event_type <> 'thing_deleted' AND policy_id = $1
              ORDER BY entity_key",
        )
        .bind(policy_key)
        .bind(&event_types)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(key,)| EntityId::thing(key)).collect())
    }
}

/// A row from `journal_events`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    /// Entity kind name.
    pub kind: String,
    /// Entity key.
    pub entity_key: String,
    /// Event revision.
    pub revision: i64,
    /// Serialized [`EventPayload`].
    pub payload: serde_json::Value,
    /// Persist timestamp.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = DbError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let kind: EntityKind = row.kind.parse()?;
        let payload: EventPayload = serde_json::from_value(row.payload)?;
        Ok(Self {
            entity_id: EntityId::new(kind, row.entity_key),
            revision: revision_from_db(row.revision)?,
            timestamp: row.created_at,
            payload,
        })
    }
}

#[async_trait]
impl EntityJournal for PgJournal {
    async fn append(&self, event: &Event) -> Result<(), JournalError> {
        let revision = revision_to_db(event.revision)?;
        let payload = serde_json::to_value(&event.payload)?;

        let result = sqlx::query(
            r"INSERT INTO journal_events (kind, entity_key, revision, event_type, payload, created_at)
              SELECT $1, $2, $3, $4, $5, $6
              WHERE $3 = 1 OR EXISTS (
                SELECT 1 FROM journal_events
                WHERE kind = $1 AND entity_key = $2 AND revision = $3 - 1
              )",
        )
        .bind(event.entity_id.kind.as_str())
        .bind(&event.entity_id.key)
        .bind(revision)
        .bind(event.event_type().as_str())
        .bind(&payload)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await;

        let conflict = match result {
            Ok(done) if done.rows_affected() == 1 => false,
            Ok(_) => true,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => true,
            Err(e) => return Err(e.into()),
        };

        if conflict {
            let current = self.highest_revision(&event.entity_id).await?;
            return Err(JournalError::RevisionConflict {
                entity_id: event.entity_id.clone(),
                attempted: event.revision,
                current,
            });
        }

        tracing::debug!(
            entity_id = %event.entity_id,
            revision = event.revision,
            event_type = %event.event_type(),
            "Appended event"
        );
        Ok(())
    }

    async fn read_from(
        &self,
        entity_id: &EntityId,
        from: Revision,
    ) -> Result<Vec<Event>, JournalError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r"SELECT kind, entity_key, revision, payload, created_at
              FROM journal_events
              WHERE kind = $1 AND entity_key = $2 AND revision >= $3
              ORDER BY revision",
        )
        .bind(entity_id.kind.as_str())
        .bind(&entity_id.key)
        .bind(revision_to_db(from)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Event::try_from(row).map_err(JournalError::from))
            .collect()
    }

    async fn write_snapshot(&self, entity: &Entity) -> Result<(), JournalError> {
        SnapshotStore::new(&self.pool).insert(entity).await?;
        Ok(())
    }

    async fn latest_snapshot(&self, entity_id: &EntityId) -> Result<Option<Entity>, JournalError> {
        Ok(SnapshotStore::new(&self.pool).latest(entity_id).await?)
    }
}
