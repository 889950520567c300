//! Shared type definitions for the twinhub persistence and sync core.
//!
//! This crate is the single source of truth for the data exchanged between
//! the journal, the entity actors and the sync streams.
//!
//! # Modules
//!
//! - [`ids`] -- Entity kinds, identifiers and revisions
//! - [`state`] -- Connection, policy and thing state plus the [`Entity`] envelope
//! - [`events`] -- Journal events and their discriminants
//! - [`commands`] -- Commands, actions, responses and rejections
//! - [`tags`] -- Change records and reference tags for the sync streams

pub mod commands;
pub mod events;
pub mod ids;
pub mod state;
pub mod tags;

// Re-export all public types at crate root for convenience.
pub use commands::{
    Action, Command, CommandPayload, CommandType, Rejection, RejectionKind, Response,
    ResponseBody,
};
pub use events::{Event, EventPayload, EventType};
pub use ids::{EntityId, EntityKind, IdError, Revision, validate_key};
pub use state::{
    Connection, ConnectionStatus, ConnectionType, Entity, EntityState, Lifecycle, Policy,
    PolicyEntry, ResourcePermissions, Thing,
};
pub use tags::{ChangeRecord, ReferenceTag};
