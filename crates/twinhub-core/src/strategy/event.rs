//! Event strategies: pure state transitions keyed by `(kind, event type)`.
//!
//! Replay and live command handling go through the same registry, which is
//! what makes a recovered entity identical to the one that wrote the events.

use std::collections::BTreeMap;

use twinhub_types::{Entity, EntityId, EntityKind, Event, EventPayload, EventType, Revision};

/// A failure to apply an event. Always a consistency violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// Nothing can interpret this event type for this kind.
    #[error("no event strategy registered for {kind}/{event_type}")]
    Unregistered {
        /// Entity kind.
        kind: EntityKind,
        /// Event type.
        event_type: EventType,
    },

    /// The event does not directly follow the entity's revision.
    #[error("revision gap on {entity_id}: expected {expected}, event carries {actual}")]
    RevisionGap {
        /// The entity being rebuilt.
        entity_id: EntityId,
        /// The revision the next event must carry.
        expected: Revision,
        /// The revision it did carry.
        actual: Revision,
    },

    /// The event belongs to another entity.
    #[error("event for {actual} applied to {expected}")]
    WrongEntity {
        /// The entity being rebuilt.
        expected: EntityId,
        /// The entity named by the event.
        actual: EntityId,
    },

    /// The event cannot apply to the entity's prior state.
    #[error("{event_type} cannot apply to {entity_id}: {reason}")]
    InvalidState {
        /// The entity being rebuilt.
        entity_id: EntityId,
        /// Event type.
        event_type: EventType,
        /// What is missing.
        reason: &'static str,
    },
}

/// Signature of a transition body. Mutates a private copy of the entity.
pub type TransitionFn = fn(&mut Entity, &EventPayload) -> Result<(), ApplyError>;

/// Static map from `(kind, event type)` to transition, built once at startup.
#[derive(Clone)]
pub struct EventRegistry {
    transitions: BTreeMap<(EntityKind, EventType), TransitionFn>,
}

impl EventRegistry {
    /// An empty registry.
    pub const fn new() -> Self {
        Self {
            transitions: BTreeMap::new(),
        }
    }

    /// The registry with every built-in transition.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        super::connection::register_events(&mut registry);
        super::policy::register_events(&mut registry);
        super::thing::register_events(&mut registry);
        registry
    }

    /// Register `transition` for `event_type` on `kind`.
    pub fn register(&mut self, kind: EntityKind, event_type: EventType, transition: TransitionFn) {
        self.transitions.insert((kind, event_type), transition);
    }

    /// Number of registered transitions.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Whether no transition is registered.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Apply one event to `entity`, returning the next entity.
    ///
    /// The event must name the same entity and carry `entity.revision + 1`.
    /// On success the result carries the event's revision and timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError`] on any consistency violation.
    pub fn apply(&self, entity: &Entity, event: &Event) -> Result<Entity, ApplyError> {
        if event.entity_id != entity.id {
            return Err(ApplyError::WrongEntity {
                expected: entity.id.clone(),
                actual: event.entity_id.clone(),
            });
        }

        let expected = entity.revision.saturating_add(1);
        if event.revision != expected {
            return Err(ApplyError::RevisionGap {
                entity_id: entity.id.clone(),
                expected,
                actual: event.revision,
            });
        }

        let event_type = event.event_type();
        let transition = self
            .transitions
            .get(&(entity.id.kind, event_type))
            .ok_or(ApplyError::Unregistered {
                kind: entity.id.kind,
                event_type,
            })?;

        let mut next = entity.clone();
        transition(&mut next, &event.payload)?;
        next.revision = event.revision;
        next.modified = Some(event.timestamp);
        Ok(next)
    }

    /// Apply `events` in order starting from `entity`.
    ///
    /// # Errors
    ///
    /// Stops at the first [`ApplyError`].
    pub fn replay(&self, entity: Entity, events: &[Event]) -> Result<Entity, ApplyError> {
        events
            .iter()
            .try_fold(entity, |current, event| self.apply(&current, event))
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Error for an event the entity's prior state cannot take.
pub(crate) fn wrong_state(
    entity: &Entity,
    payload: &EventPayload,
    reason: &'static str,
) -> ApplyError {
    ApplyError::InvalidState {
        entity_id: entity.id.clone(),
        event_type: payload.event_type(),
        reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use twinhub_types::{Lifecycle, Thing};

    use super::*;

    fn event(id: &EntityId, revision: Revision, payload: EventPayload) -> Event {
        Event {
            entity_id: id.clone(),
            revision,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            payload,
        }
    }

    fn history(id: &EntityId) -> Vec<Event> {
        vec![
            event(id, 1, EventPayload::ThingCreated { thing: Thing::default() }),
            event(
                id,
                2,
                EventPayload::AttributeModified {
                    name: "serial".to_owned(),
                    value: serde_json::json!("A-17"),
                },
            ),
            event(
                id,
                3,
                EventPayload::PolicyIdModified {
                    policy_id: "ns:p".to_owned(),
                },
            ),
            event(id, 4, EventPayload::ThingDeleted),
        ]
    }

    #[test]
    fn standard_registry_covers_every_event_type() {
        assert_eq!(EventRegistry::standard().len(), 14);
    }

    #[test]
    fn replay_equals_incremental_application() {
        let registry = EventRegistry::standard();
        let id = EntityId::thing("ns:t");
        let events = history(&id);

        let replayed = registry.replay(Entity::empty(id.clone()), &events).unwrap();

        let mut incremental = Entity::empty(id);
        for e in &events {
            incremental = registry.apply(&incremental, e).unwrap();
        }

        assert_eq!(replayed, incremental);
        assert_eq!(replayed.revision, 4);
        assert_eq!(replayed.lifecycle, Lifecycle::Deleted);
        assert_eq!(
            replayed.thing().unwrap().policy_id.as_deref(),
            Some("ns:p")
        );
    }

    #[test]
    fn replay_is_deterministic() {
        let registry = EventRegistry::standard();
        let id = EntityId::thing("ns:t");
        let events = history(&id);
        let a = registry.replay(Entity::empty(id.clone()), &events).unwrap();
        let b = registry.replay(Entity::empty(id), &events).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn gap_is_a_consistency_violation() {
        let registry = EventRegistry::standard();
        let id = EntityId::thing("ns:t");
        let mut events = history(&id);
        events.remove(1);
        let err = registry.replay(Entity::empty(id), &events).unwrap_err();
        assert!(matches!(
            err,
            ApplyError::RevisionGap { expected: 2, actual: 3, .. }
        ));
    }

    #[test]
    fn foreign_event_is_rejected() {
        let registry = EventRegistry::standard();
        let id = EntityId::thing("ns:t");
        let other = EntityId::thing("ns:other");
        let err = registry
            .apply(
                &Entity::empty(id),
                &event(&other, 1, EventPayload::ThingCreated { thing: Thing::default() }),
            )
            .unwrap_err();
        assert!(matches!(err, ApplyError::WrongEntity { .. }));
    }

    #[test]
    fn unregistered_event_type_is_fatal() {
        let registry = EventRegistry::new();
        let id = EntityId::thing("ns:t");
        let err = registry
            .apply(
                &Entity::empty(id.clone()),
                &event(&id, 1, EventPayload::ThingCreated { thing: Thing::default() }),
            )
            .unwrap_err();
        assert_eq!(
            err,
            ApplyError::Unregistered {
                kind: EntityKind::Thing,
                event_type: EventType::ThingCreated,
            }
        );
    }

    #[test]
    fn event_of_other_kind_is_unregistered_for_this_kind() {
        let registry = EventRegistry::standard();
        let id = EntityId::thing("ns:t");
        let err = registry
            .apply(&Entity::empty(id.clone()), &event(&id, 1, EventPayload::ConnectionOpened))
            .unwrap_err();
        assert!(matches!(err, ApplyError::Unregistered { .. }));
    }
}
