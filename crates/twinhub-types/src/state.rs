//! Kind-specific entity state and the [`Entity`] envelope.
//!
//! State values are plain data. They are only ever produced by event
//! strategies, which keeps them reproducible from the journal alone.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, EntityKind, Revision};

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Protocol family of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    /// AMQP 0.9.1.
    Amqp091,
    /// AMQP 1.0.
    Amqp10,
    /// MQTT 3.1.1.
    Mqtt,
    /// Apache Kafka.
    Kafka,
    /// Outbound HTTP push.
    HttpPush,
}

/// Desired status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// The connection should be established.
    Open,
    /// The connection should be torn down.
    Closed,
    /// The connection failed and awaits operator action.
    Failed,
}

/// A connection to an external messaging system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Human-readable name.
    pub name: String,
    /// Protocol family.
    pub connection_type: ConnectionType,
    /// Endpoint URI (`scheme://host[:port]`).
    pub uri: String,
    /// Current desired status.
    pub status: ConnectionStatus,
    /// Source addresses consumed from.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Target addresses published to.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Number of clients the connection is spread across.
    pub client_count: u32,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Grants and revocations on one resource path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePermissions {
    /// Granted permissions (e.g. `READ`, `WRITE`).
    #[serde(default)]
    pub grant: BTreeSet<String>,
    /// Revoked permissions.
    #[serde(default)]
    pub revoke: BTreeSet<String>,
}

/// A labeled policy entry: who gets which permissions on which resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// Subject identifiers (e.g. `nginx:admin`).
    #[serde(default)]
    pub subjects: BTreeSet<String>,
    /// Resource path (e.g. `thing:/attributes`) to permissions.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourcePermissions>,
}

/// An authorization policy. Only its state is modeled, not its evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Entries keyed by label.
    #[serde(default)]
    pub entries: BTreeMap<String, PolicyEntry>,
}

// ---------------------------------------------------------------------------
// Thing
// ---------------------------------------------------------------------------

/// A digital twin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    /// Key of the policy that governs access to this thing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Free-form attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Feature properties keyed by feature id.
    #[serde(default)]
    pub features: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// State of any entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum EntityState {
    /// Connection state.
    Connection(Connection),
    /// Policy state.
    Policy(Policy),
    /// Thing state.
    Thing(Thing),
}

impl EntityState {
    /// The kind this state belongs to.
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Connection(_) => EntityKind::Connection,
            Self::Policy(_) => EntityKind::Policy,
            Self::Thing(_) => EntityKind::Thing,
        }
    }
}

/// Whether an entity that has state is live or tombstoned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// The entity exists.
    #[default]
    Active,
    /// The entity was deleted; its log is kept.
    Deleted,
}

/// Current materialized view of one entity.
///
/// Also the unit written as a snapshot: a snapshot is simply an `Entity`
/// keyed by its revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identity.
    pub id: EntityId,
    /// Number of events applied so far.
    pub revision: Revision,
    /// Live or tombstoned.
    pub lifecycle: Lifecycle,
    /// State, `None` until the first event.
    pub state: Option<EntityState>,
    /// Timestamp of the last applied event.
    pub modified: Option<DateTime<Utc>>,
}

impl Entity {
    /// An entity at revision 0 with no state.
    pub const fn empty(id: EntityId) -> Self {
        Self {
            id,
            revision: 0,
            lifecycle: Lifecycle::Active,
            state: None,
            modified: None,
        }
    }

    /// Whether the entity has state and is not deleted.
    pub const fn exists(&self) -> bool {
        self.state.is_some() && matches!(self.lifecycle, Lifecycle::Active)
    }

    /// The connection state, if this is an existing connection.
    pub const fn connection(&self) -> Option<&Connection> {
        match &self.state {
            Some(EntityState::Connection(c)) => Some(c),
            _ => None,
        }
    }

    /// The policy state, if this is an existing policy.
    pub const fn policy(&self) -> Option<&Policy> {
        match &self.state {
            Some(EntityState::Policy(p)) => Some(p),
            _ => None,
        }
    }

    /// The thing state, if this is an existing thing.
    pub const fn thing(&self) -> Option<&Thing> {
        match &self.state {
            Some(EntityState::Thing(t)) => Some(t),
            _ => None,
        }
    }
}
