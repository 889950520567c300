//! Static command and event dispatch.
//!
//! Both registries are plain maps from a discriminant to a registered
//! strategy, filled once at startup. Dispatch is a lookup; nothing is
//! resolved by type at runtime.

pub mod command;
pub mod connection;
pub mod event;
pub mod policy;
pub mod thing;

pub use command::{CommandRegistry, CommandStrategy, FnStrategy, Outcome, Precondition};
pub use event::{ApplyError, EventRegistry, TransitionFn};

/// The pair of registries every entity actor shares.
pub struct Strategies {
    /// Command dispatch.
    pub commands: CommandRegistry,
    /// Event dispatch.
    pub events: EventRegistry,
}

impl Strategies {
    /// Both registries with every built-in strategy.
    pub fn standard() -> Self {
        Self {
            commands: CommandRegistry::standard(),
            events: EventRegistry::standard(),
        }
    }
}
