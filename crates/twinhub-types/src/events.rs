//! Journal events.
//!
//! An [`Event`] is an immutable fact about one entity at one revision. The
//! payload is a closed enum so every event that can be written has a known
//! shape; [`EventType`] is its plain discriminant, used as the dispatch key
//! for event strategies and stored alongside the payload.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, EntityKind, Revision};
use crate::state::{Connection, Policy, PolicyEntry, Thing};

/// Discriminant of an [`EventPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A connection was created.
    ConnectionCreated,
    /// A connection definition was replaced.
    ConnectionModified,
    /// A connection was opened.
    ConnectionOpened,
    /// A connection was closed.
    ConnectionClosed,
    /// A connection was deleted.
    ConnectionDeleted,
    /// A policy was created.
    PolicyCreated,
    /// A policy entry was created or replaced.
    PolicyEntryModified,
    /// A policy entry was removed.
    PolicyEntryDeleted,
    /// A policy was deleted.
    PolicyDeleted,
    /// A thing was created.
    ThingCreated,
    /// A thing was replaced.
    ThingModified,
    /// One thing attribute was set.
    AttributeModified,
    /// The policy a thing is bound to changed.
    PolicyIdModified,
    /// A thing was deleted.
    ThingDeleted,
}

impl EventType {
    /// Stable storage name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionCreated => "connection_created",
            Self::ConnectionModified => "connection_modified",
            Self::ConnectionOpened => "connection_opened",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionDeleted => "connection_deleted",
            Self::PolicyCreated => "policy_created",
            Self::PolicyEntryModified => "policy_entry_modified",
            Self::PolicyEntryDeleted => "policy_entry_deleted",
            Self::PolicyDeleted => "policy_deleted",
            Self::ThingCreated => "thing_created",
            Self::ThingModified => "thing_modified",
            Self::AttributeModified => "attribute_modified",
            Self::PolicyIdModified => "policy_id_modified",
            Self::ThingDeleted => "thing_deleted",
        }
    }

    /// The entity kind this event type belongs to.
    pub const fn kind(self) -> EntityKind {
        match self {
            Self::ConnectionCreated
            | Self::ConnectionModified
            | Self::ConnectionOpened
            | Self::ConnectionClosed
            | Self::ConnectionDeleted => EntityKind::Connection,
            Self::PolicyCreated
            | Self::PolicyEntryModified
            | Self::PolicyEntryDeleted
            | Self::PolicyDeleted => EntityKind::Policy,
            Self::ThingCreated
            | Self::ThingModified
            | Self::AttributeModified
            | Self::PolicyIdModified
            | Self::ThingDeleted => EntityKind::Thing,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads.
///
/// Serialized internally tagged by `type`, so the stored JSON reads
/// `{"type": "policy_id_modified", "policy_id": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A connection was created.
    ConnectionCreated {
        /// The initial definition.
        connection: Connection,
    },
    /// A connection definition was replaced.
    ConnectionModified {
        /// The new definition.
        connection: Connection,
    },
    /// A connection was opened.
    ConnectionOpened,
    /// A connection was closed.
    ConnectionClosed,
    /// A connection was deleted.
    ConnectionDeleted,
    /// A policy was created.
    PolicyCreated {
        /// The initial policy.
        policy: Policy,
    },
    /// A policy entry was created or replaced.
    PolicyEntryModified {
        /// Entry label.
        label: String,
        /// The new entry.
        entry: PolicyEntry,
    },
    /// A policy entry was removed.
    PolicyEntryDeleted {
        /// Entry label.
        label: String,
    },
    /// A policy was deleted.
    PolicyDeleted,
    /// A thing was created.
    ThingCreated {
        /// The initial thing.
        thing: Thing,
    },
    /// A thing was replaced.
    ThingModified {
        /// The new thing.
        thing: Thing,
    },
    /// One thing attribute was set.
    AttributeModified {
        /// Attribute name.
        name: String,
        /// New value.
        value: serde_json::Value,
    },
    /// The policy a thing is bound to changed.
    PolicyIdModified {
        /// New policy key.
        policy_id: String,
    },
    /// A thing was deleted.
    ThingDeleted,
}

impl EventPayload {
    /// The discriminant of this payload.
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::ConnectionCreated { .. } => EventType::ConnectionCreated,
            Self::ConnectionModified { .. } => EventType::ConnectionModified,
            Self::ConnectionOpened => EventType::ConnectionOpened,
            Self::ConnectionClosed => EventType::ConnectionClosed,
            Self::ConnectionDeleted => EventType::ConnectionDeleted,
            Self::PolicyCreated { .. } => EventType::PolicyCreated,
            Self::PolicyEntryModified { .. } => EventType::PolicyEntryModified,
            Self::PolicyEntryDeleted { .. } => EventType::PolicyEntryDeleted,
            Self::PolicyDeleted => EventType::PolicyDeleted,
            Self::ThingCreated { .. } => EventType::ThingCreated,
            Self::ThingModified { .. } => EventType::ThingModified,
            Self::AttributeModified { .. } => EventType::AttributeModified,
            Self::PolicyIdModified { .. } => EventType::PolicyIdModified,
            Self::ThingDeleted => EventType::ThingDeleted,
        }
    }
}

/// An immutable, persisted fact about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The entity the event belongs to.
    pub entity_id: EntityId,
    /// Revision this event moves the entity to.
    pub revision: Revision,
    /// When the event was persisted.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub payload: EventPayload,
}

impl Event {
    /// The event discriminant.
    pub const fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn payload_tag_matches_storage_name() {
        let payload = EventPayload::PolicyIdModified {
            policy_id: "ns:policy".to_owned(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], payload.event_type().as_str());
        assert_eq!(json["policy_id"], "ns:policy");
    }

    #[test]
    fn unit_payload_round_trips() {
        let json = serde_json::json!({ "type": "connection_opened" });
        let payload: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload, EventPayload::ConnectionOpened);
    }

    #[test]
    fn event_types_know_their_kind() {
        assert_eq!(EventType::ConnectionOpened.kind(), EntityKind::Connection);
        assert_eq!(EventType::PolicyEntryDeleted.kind(), EntityKind::Policy);
        assert_eq!(EventType::AttributeModified.kind(), EntityKind::Thing);
    }
}
