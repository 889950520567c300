//! Catch-up sync streams for the twinhub search index.
//!
//! The downstream index is fed asynchronously and can miss or reorder
//! updates. A [`SyncStreamSupervisor`] per entity kind walks the journal's
//! change timestamps in windows, turns each change into
//! [`ReferenceTag`](twinhub_types::ReferenceTag)s for every index entry it
//! invalidates, and publishes them at least once. The stream's checkpoint
//! only moves past a window whose tags were all acknowledged.
//!
//! # Modules
//!
//! - [`change_source`] -- Which entities changed in a time window
//! - [`resolver`] -- Mapping a change to the index entries it invalidates
//! - [`publisher`] -- `JetStream` and in-memory tag delivery
//! - [`supervisor`] -- The per-kind window loop
//! - [`backoff`] -- Retry delays for failed windows
//! - [`status`] -- Shared stream status board
//! - [`error`] -- Sync and publish errors

pub mod backoff;
pub mod change_source;
pub mod error;
pub mod publisher;
pub mod resolver;
pub mod status;
pub mod supervisor;

pub use backoff::Backoff;
pub use change_source::ChangeSource;
pub use error::{PublishError, SyncError};
pub use publisher::{NatsPublisher, Publisher, RecordingPublisher};
pub use resolver::{
    BindingIndex, DependencyResolver, PolicyBindingResolver, SelfReference, resolver_for,
};
pub use status::{StatusBoard, StreamStatus, SyncHealth, classify};
pub use supervisor::{CycleOutcome, StreamSettings, SyncStreamSupervisor, stream_id_for};
