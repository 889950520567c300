//! Commands, actions, responses and rejections.
//!
//! A [`Command`] is an intent addressed to one entity. Command strategies
//! turn it into an [`Action`] (what kind of transition it is), at most one
//! event, and a [`ResponseBody`]; or they refuse it with a [`Rejection`].

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, EntityKind, Revision};
use crate::state::{Connection, ConnectionStatus, EntityState, Policy, PolicyEntry, Thing};

/// Discriminant of a [`CommandPayload`], the command strategy dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Create a connection.
    CreateConnection,
    /// Replace a connection definition.
    ModifyConnection,
    /// Open a connection.
    OpenConnection,
    /// Close a connection.
    CloseConnection,
    /// Delete a connection.
    DeleteConnection,
    /// Read a connection.
    RetrieveConnection,
    /// Read a connection's status.
    RetrieveConnectionStatus,
    /// Create a policy.
    CreatePolicy,
    /// Create or replace a policy entry.
    ModifyPolicyEntry,
    /// Remove a policy entry.
    DeletePolicyEntry,
    /// Delete a policy.
    DeletePolicy,
    /// Read a policy.
    RetrievePolicy,
    /// Create a thing.
    CreateThing,
    /// Replace a thing.
    ModifyThing,
    /// Set one thing attribute.
    ModifyAttribute,
    /// Rebind a thing to another policy.
    ModifyPolicyId,
    /// Delete a thing.
    DeleteThing,
    /// Read a thing.
    RetrieveThing,
}

impl CommandType {
    /// Stable name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateConnection => "create_connection",
            Self::ModifyConnection => "modify_connection",
            Self::OpenConnection => "open_connection",
            Self::CloseConnection => "close_connection",
            Self::DeleteConnection => "delete_connection",
            Self::RetrieveConnection => "retrieve_connection",
            Self::RetrieveConnectionStatus => "retrieve_connection_status",
            Self::CreatePolicy => "create_policy",
            Self::ModifyPolicyEntry => "modify_policy_entry",
            Self::DeletePolicyEntry => "delete_policy_entry",
            Self::DeletePolicy => "delete_policy",
            Self::RetrievePolicy => "retrieve_policy",
            Self::CreateThing => "create_thing",
            Self::ModifyThing => "modify_thing",
            Self::ModifyAttribute => "modify_attribute",
            Self::ModifyPolicyId => "modify_policy_id",
            Self::DeleteThing => "delete_thing",
            Self::RetrieveThing => "retrieve_thing",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Create a connection.
    CreateConnection {
        /// Initial definition.
        connection: Connection,
    },
    /// Replace a connection definition.
    ModifyConnection {
        /// New definition. Its `status` is ignored.
        connection: Connection,
    },
    /// Open a connection.
    OpenConnection,
    /// Close a connection.
    CloseConnection,
    /// Delete a connection.
    DeleteConnection,
    /// Read a connection.
    RetrieveConnection,
    /// Read a connection's status.
    RetrieveConnectionStatus,
    /// Create a policy.
    CreatePolicy {
        /// Initial policy.
        policy: Policy,
    },
    /// Create or replace a policy entry.
    ModifyPolicyEntry {
        /// Entry label.
        label: String,
        /// New entry.
        entry: PolicyEntry,
    },
    /// Remove a policy entry.
    DeletePolicyEntry {
        /// Entry label.
        label: String,
    },
    /// Delete a policy.
    DeletePolicy,
    /// Read a policy.
    RetrievePolicy,
    /// Create a thing.
    CreateThing {
        /// Initial thing.
        thing: Thing,
    },
    /// Replace a thing.
    ModifyThing {
        /// New thing.
        thing: Thing,
    },
    /// Set one thing attribute.
    ModifyAttribute {
        /// Attribute name.
        name: String,
        /// New value.
        value: serde_json::Value,
    },
    /// Rebind a thing to another policy.
    ModifyPolicyId {
        /// New policy key.
        policy_id: String,
    },
    /// Delete a thing.
    DeleteThing,
    /// Read a thing.
    RetrieveThing,
}

impl CommandPayload {
    /// The discriminant of this payload.
    pub const fn command_type(&self) -> CommandType {
        match self {
            Self::CreateConnection { .. } => CommandType::CreateConnection,
            Self::ModifyConnection { .. } => CommandType::ModifyConnection,
            Self::OpenConnection => CommandType::OpenConnection,
            Self::CloseConnection => CommandType::CloseConnection,
            Self::DeleteConnection => CommandType::DeleteConnection,
            Self::RetrieveConnection => CommandType::RetrieveConnection,
            Self::RetrieveConnectionStatus => CommandType::RetrieveConnectionStatus,
            Self::CreatePolicy { .. } => CommandType::CreatePolicy,
            Self::ModifyPolicyEntry { .. } => CommandType::ModifyPolicyEntry,
            Self::DeletePolicyEntry { .. } => CommandType::DeletePolicyEntry,
            Self::DeletePolicy => CommandType::DeletePolicy,
            Self::RetrievePolicy => CommandType::RetrievePolicy,
            Self::CreateThing { .. } => CommandType::CreateThing,
            Self::ModifyThing { .. } => CommandType::ModifyThing,
            Self::ModifyAttribute { .. } => CommandType::ModifyAttribute,
            Self::ModifyPolicyId { .. } => CommandType::ModifyPolicyId,
            Self::DeleteThing => CommandType::DeleteThing,
            Self::RetrieveThing => CommandType::RetrieveThing,
        }
    }
}

/// A command addressed to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Target entity.
    pub entity_id: EntityId,
    /// Optimistic-concurrency guard: reject unless the entity is at exactly
    /// this revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_revision: Option<Revision>,
    /// What to do.
    #[serde(flatten)]
    pub payload: CommandPayload,
}

impl Command {
    /// Build a command without a revision guard.
    pub const fn new(entity_id: EntityId, payload: CommandPayload) -> Self {
        Self {
            entity_id,
            expected_revision: None,
            payload,
        }
    }

    /// Require the entity to be at `revision`.
    #[must_use]
    pub const fn expecting(mut self, revision: Revision) -> Self {
        self.expected_revision = Some(revision);
        self
    }

    /// The command discriminant.
    pub const fn command_type(&self) -> CommandType {
        self.payload.command_type()
    }

    /// The kind of the target entity.
    pub const fn kind(&self) -> EntityKind {
        self.entity_id.kind
    }
}

/// The intent a command resolves to, independent of persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Bring an entity into existence.
    Create,
    /// Change an existing entity.
    Modify,
    /// Open a connection.
    Open,
    /// Close a connection.
    Close,
    /// Tombstone an entity.
    Delete,
    /// Read the full state.
    Retrieve,
    /// Read the connection status.
    RetrieveStatus,
}

impl Action {
    /// Whether this action only reads.
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Retrieve | Self::RetrieveStatus)
    }
}

/// Result payload of a successful command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResponseBody {
    /// The transition was applied; nothing to return.
    Done,
    /// The entity state after the command.
    State(EntityState),
    /// A connection status.
    ConnectionStatus(ConnectionStatus),
}

/// Successful command outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Entity revision after the command.
    pub revision: Revision,
    /// The action the command resolved to.
    pub action: Action,
    /// Result payload.
    pub result: ResponseBody,
}

/// Category of a refused command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Malformed or semantically invalid command.
    Validation,
    /// Expected-revision mismatch or create on an existing entity.
    Conflict,
    /// Command against an absent or deleted entity.
    NotFound,
    /// No strategy is registered for the command.
    UnsupportedCommand,
    /// The journal did not accept the event; state is unchanged.
    Persistence,
    /// The entity could not be recovered from its journal.
    Recovery,
    /// The entity's mailbox is full.
    Overloaded,
    /// The entity stopped before answering.
    Unavailable,
}

impl RejectionKind {
    /// Stable name used in logs and envelopes.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::UnsupportedCommand => "unsupported_command",
            Self::Persistence => "persistence",
            Self::Recovery => "recovery",
            Self::Overloaded => "overloaded",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured refusal returned to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Rejection {
    /// Category.
    pub kind: RejectionKind,
    /// Human-readable detail.
    pub message: String,
}

impl Rejection {
    /// Build a rejection.
    pub fn new(kind: RejectionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A [`RejectionKind::Validation`] rejection.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(RejectionKind::Validation, message)
    }

    /// A [`RejectionKind::Conflict`] rejection.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(RejectionKind::Conflict, message)
    }

    /// A [`RejectionKind::NotFound`] rejection for `id`.
    pub fn not_found(id: &EntityId) -> Self {
        Self::new(RejectionKind::NotFound, format!("{id} does not exist"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn command_json_is_flat() {
        let cmd = Command::new(
            EntityId::connection("ns:amqp"),
            CommandPayload::OpenConnection,
        )
        .expecting(3);
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "open_connection");
        assert_eq!(json["expected_revision"], 3);
        assert_eq!(json["entity_id"]["kind"], "connection");

        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn rejection_display_includes_kind() {
        let rejection = Rejection::conflict("expected revision 5, entity is at 3");
        assert_eq!(
            rejection.to_string(),
            "conflict: expected revision 5, entity is at 3"
        );
    }

    #[test]
    fn reads_are_flagged() {
        assert!(Action::RetrieveStatus.is_read());
        assert!(!Action::Open.is_read());
    }
}
