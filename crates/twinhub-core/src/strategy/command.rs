//! Command strategies and their registry.
//!
//! A command strategy decides what a command means for an entity in its
//! current state. It never touches storage: the actor persists whatever
//! event the strategy returns.
//!
//! The registry runs the checks shared by every strategy, in this order:
//!
//! 1. resolve the strategy for `(kind, command type)`
//! 2. existence (create needs an absent or deleted entity, everything else
//!    needs a live one)
//! 3. the optional expected revision
//! 4. the strategy itself, which validates the payload shape

use std::collections::BTreeMap;

use twinhub_types::{
    Action, Command, CommandPayload, CommandType, Entity, EntityKind, EventPayload, Rejection,
    RejectionKind, ResponseBody,
};

/// What a command does to an entity, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// The action the command resolved to.
    pub action: Action,
    /// The event to persist, `None` for reads and no-op writes.
    pub event: Option<EventPayload>,
    /// The response body returned to the caller.
    pub result: ResponseBody,
}

impl Outcome {
    /// A state change to persist.
    pub const fn write(action: Action, event: EventPayload) -> Self {
        Self {
            action,
            event: Some(event),
            result: ResponseBody::Done,
        }
    }

    /// A read, or a write that is already satisfied.
    pub const fn unchanged(action: Action, result: ResponseBody) -> Self {
        Self {
            action,
            event: None,
            result,
        }
    }
}

/// Whether a command needs the entity to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The entity must be live.
    Exists,
    /// The entity must never have existed or be deleted.
    Absent,
}

/// Turns one command type into an [`Outcome`].
pub trait CommandStrategy: Send + Sync {
    /// The action this strategy resolves to.
    fn action(&self) -> Action;

    /// Existence requirement checked before [`apply`](Self::apply).
    fn precondition(&self) -> Precondition {
        Precondition::Exists
    }

    /// Validate `payload` against `entity` and describe the transition.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] if the payload is invalid for the entity.
    fn apply(&self, payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection>;
}

/// Signature of a strategy body.
pub type StrategyFn = fn(&CommandPayload, &Entity) -> Result<Outcome, Rejection>;

/// A strategy made of an action, a precondition and a plain function.
///
/// All built-in strategies are of this shape.
#[derive(Debug, Clone, Copy)]
pub struct FnStrategy {
    action: Action,
    precondition: Precondition,
    body: StrategyFn,
}

impl FnStrategy {
    /// A strategy that requires a live entity.
    pub const fn new(action: Action, body: StrategyFn) -> Self {
        Self {
            action,
            precondition: Precondition::Exists,
            body,
        }
    }

    /// A strategy that requires an absent or deleted entity.
    pub const fn create(body: StrategyFn) -> Self {
        Self {
            action: Action::Create,
            precondition: Precondition::Absent,
            body,
        }
    }
}

impl CommandStrategy for FnStrategy {
    fn action(&self) -> Action {
        self.action
    }

    fn precondition(&self) -> Precondition {
        self.precondition
    }

    fn apply(&self, payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection> {
        (self.body)(payload, entity)
    }
}

/// Static map from `(kind, command type)` to strategy, built once at startup.
pub struct CommandRegistry {
    strategies: BTreeMap<(EntityKind, CommandType), Box<dyn CommandStrategy>>,
}

impl CommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    /// The registry with every built-in strategy for connections, policies
    /// and things.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        super::connection::register_commands(&mut registry);
        super::policy::register_commands(&mut registry);
        super::thing::register_commands(&mut registry);
        registry
    }

    /// Register `strategy`, replacing any previous one for the same key.
    pub fn register(
        &mut self,
        kind: EntityKind,
        command_type: CommandType,
        strategy: impl CommandStrategy + 'static,
    ) {
        self.strategies
            .insert((kind, command_type), Box::new(strategy));
    }

    /// Number of registered strategies.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Whether no strategy is registered.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Look up the strategy for `kind` and `command_type`.
    ///
    /// # Errors
    ///
    /// Returns an `UnsupportedCommand` rejection if none is registered.
    pub fn resolve(
        &self,
        kind: EntityKind,
        command_type: CommandType,
    ) -> Result<&dyn CommandStrategy, Rejection> {
        self.strategies
            .get(&(kind, command_type))
            .map(AsRef::as_ref)
            .ok_or_else(|| {
                Rejection::new(
                    RejectionKind::UnsupportedCommand,
                    format!("{command_type} is not supported for {kind} entities"),
                )
            })
    }

    /// Run `command` against `entity`: resolve, check existence, check the
    /// expected revision, then apply the strategy.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`] any check produces.
    pub fn handle(&self, command: &Command, entity: &Entity) -> Result<Outcome, Rejection> {
        let strategy = self.resolve(command.kind(), command.command_type())?;

        match strategy.precondition() {
            Precondition::Exists if !entity.exists() => {
                return Err(Rejection::not_found(&entity.id));
            }
            Precondition::Absent if entity.exists() => {
                return Err(Rejection::conflict(format!("{} already exists", entity.id)));
            }
            Precondition::Exists | Precondition::Absent => {}
        }

        if let Some(expected) = command
            .expected_revision
            .filter(|expected| *expected != entity.revision)
        {
            return Err(Rejection::conflict(format!(
                "{} is at revision {}, command expected {expected}",
                entity.id, entity.revision
            )));
        }

        strategy.apply(&command.payload, entity)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejection for a payload routed to the wrong strategy.
pub(crate) fn unexpected_payload(payload: &CommandPayload) -> Rejection {
    Rejection::validation(format!(
        "payload {} does not match this strategy",
        payload.command_type()
    ))
}
