//! Error types for the sync streams.

use twinhub_db::DbError;

/// A single tag could not be delivered.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The broker refused or did not acknowledge the message.
    #[error("NATS publish failed: {0}")]
    Nats(String),

    /// The tag could not be encoded.
    #[error("tag serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The downstream index refused the tag.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// A sync window failed. The checkpoint stays where it was.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The checkpoint could not be read or written.
    #[error("checkpoint store failed: {0}")]
    Checkpoint(#[source] DbError),

    /// The change query failed.
    #[error("change query failed: {0}")]
    ChangeSource(#[source] DbError),

    /// Dependent targets could not be resolved.
    #[error("dependency resolution failed: {0}")]
    Resolve(#[source] DbError),

    /// Some tags in the window were not acknowledged.
    #[error("{failed} of {total} tags not acknowledged, first error: {first}")]
    Publish {
        /// Tags that failed.
        failed: usize,
        /// Tags in the window.
        total: usize,
        /// The first failure seen.
        #[source]
        first: PublishError,
    },

    /// A window bound fell outside the representable time range.
    #[error("window bound out of range: {0}")]
    Clock(String),
}
