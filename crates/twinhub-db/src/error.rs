//! Error types for the storage layer.
//!
//! Backend failures are wrapped in [`DbError`]. The journal surfaces the
//! narrower [`JournalError`], which separates revision conflicts (a caller
//! bug or a lost race) from the journal being unavailable or unreadable.

use twinhub_types::{EntityId, IdError, Revision};

/// Errors that can occur in the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored identifier could not be parsed.
    #[error("Invalid identifier: {0}")]
    Id(#[from] IdError),

    /// A stored value is out of range or malformed.
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    /// The backend is switched off (in-memory stores only).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors returned by an [`EntityJournal`](crate::EntityJournal).
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The revision slot is taken or would leave a gap.
    #[error("revision conflict for {entity_id}: attempted {attempted}, journal is at {current}")]
    RevisionConflict {
        /// The entity whose log rejected the append.
        entity_id: EntityId,
        /// The revision the caller tried to write.
        attempted: Revision,
        /// The highest revision already in the log.
        current: Revision,
    },

    /// The journal could not be reached or the write was not acknowledged.
    #[error("journal unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be decoded.
    #[error("journal data corrupt: {0}")]
    Corrupt(String),
}

impl From<DbError> for JournalError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Serialization(e) => Self::Corrupt(e.to_string()),
            DbError::Id(e) => Self::Corrupt(e.to_string()),
            DbError::InvalidValue(msg) => Self::Corrupt(msg),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for JournalError {
    fn from(err: sqlx::Error) -> Self {
        Self::from(DbError::Postgres(err))
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Convert a revision to the signed column type.
pub(crate) fn revision_to_db(revision: Revision) -> Result<i64, DbError> {
    i64::try_from(revision)
        .map_err(|e| DbError::InvalidValue(format!("revision {revision} exceeds BIGINT: {e}")))
}

/// Convert a signed column value back to a revision.
pub(crate) fn revision_from_db(value: i64) -> Result<Revision, DbError> {
    Revision::try_from(value)
        .map_err(|e| DbError::InvalidValue(format!("negative revision {value} in store: {e}")))
}
