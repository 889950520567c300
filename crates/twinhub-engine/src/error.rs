//! Error types for the engine binary.

/// Top-level error for the engine binary.
///
/// Every startup step maps its failure here so `main` can propagate with
/// `?`. Failures after startup are isolated to their entity or stream and
/// never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: twinhub_core::ConfigError,
    },

    /// A storage backend could not be reached or migrated.
    #[error("storage error: {source}")]
    Storage {
        /// The underlying storage error.
        #[from]
        source: twinhub_db::DbError,
    },

    /// NATS connection or subscription failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },

    /// The reference tag stream could not be set up.
    #[error("publisher error: {source}")]
    Publisher {
        /// The underlying publish error.
        #[from]
        source: twinhub_sync::PublishError,
    },

    /// The status API failed to start or serve.
    #[error("observer error: {source}")]
    Observer {
        /// The underlying server error.
        #[from]
        source: twinhub_observer::ServerError,
    },
}
