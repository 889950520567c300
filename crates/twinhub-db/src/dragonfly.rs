//! `Dragonfly` (Redis-compatible) key-value operations.
//!
//! `Dragonfly` is an optional checkpoint backend for deployments that want
//! sync progress outside `PostgreSQL`.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `sync:checkpoint:{stream_id}` | String | RFC 3339 last-synced timestamp |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fred::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::checkpoint_store::CheckpointStore;
use crate::error::DbError;

/// Key prefix for sync checkpoints.
const CHECKPOINT_PREFIX: &str = "sync:checkpoint:";

/// Connection handle to a `Dragonfly` instance.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at `url` (`redis://host:port[/db]`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed and
    /// [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    /// Serialize `value` as JSON and store it at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if serialization or the write fails.
    pub async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), DbError> {
        let json = serde_json::to_string(value)?;
        let _: () = self.client.set(key, json.as_str(), None, None, false).await?;
        Ok(())
    }

    /// Read the JSON value at `key`, `None` if the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read or deserialization fails.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DbError> {
        let value: Option<String> = self.client.get(key).await?;
        value
            .map(|s| serde_json::from_str(&s).map_err(DbError::from))
            .transpose()
    }

    /// Delete `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), DbError> {
        let _: u32 = self.client.del(key).await?;
        Ok(())
    }

    /// A checkpoint store on this connection.
    pub fn checkpoints(&self) -> DragonflyCheckpointStore {
        DragonflyCheckpointStore { pool: self.clone() }
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the quit command fails.
    pub async fn close(&self) -> Result<(), DbError> {
        self.client.quit().await?;
        tracing::info!("Dragonfly connection closed");
        Ok(())
    }
}

/// Checkpoints stored as `sync:checkpoint:{stream_id}` strings.
#[derive(Clone)]
pub struct DragonflyCheckpointStore {
    pool: DragonflyPool,
}

fn checkpoint_key(stream_id: &str) -> String {
    format!("{CHECKPOINT_PREFIX}{stream_id}")
}

#[async_trait]
impl CheckpointStore for DragonflyCheckpointStore {
    async fn get(&self, stream_id: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let value: Option<String> = self.pool.get_json(&checkpoint_key(stream_id)).await?;
        value
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|e| DbError::InvalidValue(format!("checkpoint {stream_id}: {e}")))
            })
            .transpose()
    }

    /// Single writer per stream, so a plain `SET` is enough; the supervisor
    /// only ever moves its own checkpoint forward.
    async fn set(&self, stream_id: &str, timestamp: DateTime<Utc>) -> Result<(), DbError> {
        self.pool
            .set_json(&checkpoint_key(stream_id), &timestamp.to_rfc3339())
            .await?;
        tracing::debug!(stream_id, %timestamp, "Stored checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_keys_are_namespaced() {
        assert_eq!(checkpoint_key("things"), "sync:checkpoint:things");
    }
}
