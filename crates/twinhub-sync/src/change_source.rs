//! Where a sync stream learns which entities changed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use twinhub_db::{DbError, MemoryJournal, PgJournal};
use twinhub_types::{ChangeRecord, EntityKind};

/// Answers "which entities of this kind changed in a time window".
///
/// Results must be restartable from any earlier bound: asking for the same
/// window twice returns the same entities, and overlapping windows repeat
/// entities rather than skip them.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Entities of `kind` with a change in `(after, until]`, one record per
    /// entity carrying its latest revision in the window, ordered by
    /// timestamp ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the backing store cannot be queried.
    async fn changes_between(
        &self,
        kind: EntityKind,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, DbError>;
}

#[async_trait]
impl ChangeSource for PgJournal {
    async fn changes_between(
        &self,
        kind: EntityKind,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, DbError> {
        Self::changes_between(self, kind, after, until).await
    }
}

#[async_trait]
impl ChangeSource for MemoryJournal {
    async fn changes_between(
        &self,
        kind: EntityKind,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, DbError> {
        Self::changes_between(self, kind, after, until).await
    }
}
