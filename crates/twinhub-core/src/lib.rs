//! Command processing core for twinhub.
//!
//! Commands enter through the [`EntityRouter`], which hands each one to the
//! single actor serving the target entity. The actor resolves a command
//! strategy, persists the resulting event to the journal and applies it
//! through the event strategy registry.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `twinhub-config.yaml` into
//!   strongly-typed structs.
//! - [`strategy`] -- Command and event strategy registries and the built-in
//!   strategies for connections, policies and things.
//! - [`actor`] -- The per-entity actor and its client handle.
//! - [`router`] -- Spawns and routes to entity actors.
//!
//! [`EntityRouter`]: router::EntityRouter

pub mod actor;
pub mod config;
pub mod router;
pub mod strategy;

pub use actor::{ActorHandle, ActorPhase, ActorSettings, EntityActor, RecoveryError};
pub use config::{ConfigError, TwinhubConfig};
pub use router::EntityRouter;
pub use strategy::{ApplyError, CommandRegistry, EventRegistry, Outcome, Strategies};
