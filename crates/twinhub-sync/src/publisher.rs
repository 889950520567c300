//! Reference tag delivery.
//!
//! Tags for index entries of kind `k` go to `{prefix}.reference-tags.{k}` on
//! a `JetStream` stream. The tag's dedupe key travels as the message id so the
//! broker drops a redelivery that lands inside its duplicate window; the
//! indexer is idempotent for everything older.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_nats::jetstream;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};
use twinhub_types::{EntityId, ReferenceTag, Revision};

use crate::error::PublishError;

/// How long the broker remembers message ids.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// At-least-once delivery of reference tags.
///
/// `Ok` means the tag is durably accepted downstream. No ordering across
/// tags is promised.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver one tag.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the tag was not acknowledged. It may
    /// still have been delivered.
    async fn publish(&self, tag: &ReferenceTag) -> Result<(), PublishError>;
}

/// Publishes tags to NATS `JetStream` and waits for the stream ack.
pub struct NatsPublisher {
    context: jetstream::Context,
    prefix: String,
}

impl NatsPublisher {
    /// Wrap `client` and make sure the tag stream exists.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Nats`] if the stream cannot be created.
    pub async fn new(client: async_nats::Client, prefix: &str) -> Result<Self, PublishError> {
        let context = jetstream::new(client);
        let stream_name = format!("{}_REFERENCE_TAGS", prefix.to_uppercase().replace('.', "_"));
        let subjects = format!("{prefix}.reference-tags.>");
        context
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.clone(),
                subjects: vec![subjects.clone()],
                duplicate_window: DUPLICATE_WINDOW,
                ..Default::default()
            })
            .await
            .map_err(|e| PublishError::Nats(format!("failed to ensure stream {stream_name}: {e}")))?;
        info!(stream = %stream_name, subjects = %subjects, "reference tag stream ready");
        Ok(Self {
            context,
            prefix: prefix.to_owned(),
        })
    }

    /// Subject a tag is published on.
    pub fn subject_for(&self, tag: &ReferenceTag) -> String {
        format!("{}.reference-tags.{}", self.prefix, tag.target.kind)
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, tag: &ReferenceTag) -> Result<(), PublishError> {
        let subject = self.subject_for(tag);
        let payload = serde_json::to_vec(tag)?;
        let dedupe_key = tag.dedupe_key();
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(async_nats::header::NATS_MESSAGE_ID, dedupe_key.as_str());

        debug!(subject = %subject, tag = %dedupe_key, "publishing reference tag");
        self.context
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| PublishError::Nats(format!("failed to publish to {subject}: {e}")))?
            .await
            .map_err(|e| PublishError::Nats(format!("no ack from {subject}: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for NatsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsPublisher")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Recorded {
    deliveries: Vec<ReferenceTag>,
    /// target -> cause -> highest cause revision seen.
    index: BTreeMap<EntityId, BTreeMap<EntityId, Revision>>,
    failing: BTreeSet<EntityId>,
}

/// In-memory publisher that models an idempotent downstream index.
///
/// Every accepted delivery is logged. The modeled index keeps, per target,
/// the highest revision seen from each cause, so redelivering a tag leaves
/// it unchanged. Tags caused by an entity passed to
/// [`fail_for`](Self::fail_for) are refused until [`heal`](Self::heal).
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    inner: Mutex<Recorded>,
}

impl RecordingPublisher {
    /// An empty publisher that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse tags caused by `cause`.
    pub async fn fail_for(&self, cause: EntityId) {
        self.inner.lock().await.failing.insert(cause);
    }

    /// Accept tags caused by `cause` again.
    pub async fn heal(&self, cause: &EntityId) {
        self.inner.lock().await.failing.remove(cause);
    }

    /// Every accepted delivery, in arrival order.
    pub async fn deliveries(&self) -> Vec<ReferenceTag> {
        self.inner.lock().await.deliveries.clone()
    }

    /// The modeled index state.
    pub async fn index(&self) -> BTreeMap<EntityId, BTreeMap<EntityId, Revision>> {
        self.inner.lock().await.index.clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, tag: &ReferenceTag) -> Result<(), PublishError> {
        let mut inner = self.inner.lock().await;
        if inner.failing.contains(&tag.cause) {
            return Err(PublishError::Rejected(format!(
                "injected failure for {}",
                tag.dedupe_key()
            )));
        }
        inner.deliveries.push(tag.clone());
        let seen = inner
            .index
            .entry(tag.target.clone())
            .or_default()
            .entry(tag.cause.clone())
            .or_default();
        *seen = (*seen).max(tag.cause_revision);
        Ok(())
    }
}
