//! Storage layer for twinhub: the entity journal, snapshots and sync
//! checkpoints.
//!
//! `PostgreSQL` is the durable home for all three. `Dragonfly` can hold the
//! checkpoints instead, and the in-memory stores back tests and single-node
//! runs.
//!
//! ```text
//! EntityActor ---- append / read_from / snapshots ----> EntityJournal
//!                                                        |-- PgJournal
//!                                                        +-- MemoryJournal
//! SyncStreamSupervisor -- get / set --> CheckpointStore
//!                                        |-- PgCheckpointStore
//!                                        |-- DragonflyCheckpointStore
//!                                        +-- MemoryCheckpointStore
//! ```
//!
//! # Modules
//!
//! - [`journal`] -- the [`EntityJournal`] contract
//! - [`event_store`] -- `PostgreSQL` journal and change queries
//! - [`snapshot_store`] -- snapshot persistence
//! - [`checkpoint_store`] -- the [`CheckpointStore`] contract and its `PostgreSQL` impl
//! - [`dragonfly`] -- `Dragonfly` connection and checkpoint store
//! - [`memory`] -- in-memory journal and checkpoint store
//! - [`postgres`] -- connection pool and migrations
//! - [`error`] -- shared error types

pub mod checkpoint_store;
pub mod dragonfly;
pub mod error;
pub mod event_store;
pub mod journal;
pub mod memory;
pub mod postgres;
pub mod snapshot_store;

pub use checkpoint_store::{CheckpointStore, PgCheckpointStore};
pub use dragonfly::{DragonflyCheckpointStore, DragonflyPool};
pub use error::{DbError, JournalError};
pub use event_store::{EventRow, PgJournal};
pub use journal::EntityJournal;
pub use memory::{MemoryCheckpointStore, MemoryJournal};
pub use postgres::{PostgresConfig, PostgresPool};
pub use snapshot_store::SnapshotStore;
