//! The entity journal interface.
//!
//! The journal is the source of truth: an append-only, per-entity event log
//! plus snapshots keyed by revision. Entity actors are its only writers and
//! each actor writes only its own entity, so implementations never see two
//! concurrent appends for the same id in normal operation. They still reject
//! any append that is not exactly `current + 1`.

use async_trait::async_trait;
use twinhub_types::{Entity, EntityId, Event, Revision};

use crate::error::JournalError;

/// Durable per-entity event log with snapshotting.
#[async_trait]
pub trait EntityJournal: Send + Sync {
    /// Append `event` at `event.revision`.
    ///
    /// The write is acknowledged only once durable.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::RevisionConflict`] if `event.revision` is not
    /// exactly one past the highest stored revision for the entity, and
    /// [`JournalError::Unavailable`] if the write was not acknowledged.
    async fn append(&self, event: &Event) -> Result<(), JournalError>;

    /// Read events for `entity_id` with revision `>= from`, in revision order.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the log cannot be read or decoded.
    async fn read_from(&self, entity_id: &EntityId, from: Revision)
    -> Result<Vec<Event>, JournalError>;

    /// Persist `entity` as the snapshot for its current revision.
    ///
    /// Writing the same revision twice overwrites the earlier snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the snapshot cannot be stored.
    async fn write_snapshot(&self, entity: &Entity) -> Result<(), JournalError>;

    /// The snapshot with the highest revision for `entity_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the snapshot store cannot be read.
    async fn latest_snapshot(&self, entity_id: &EntityId) -> Result<Option<Entity>, JournalError>;
}
