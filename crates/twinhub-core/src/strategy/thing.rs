//! Thing commands and events.
//!
//! A thing's `policy_id` is the edge the policy sync stream follows, so every
//! event that can change it carries the new value in full.

use twinhub_types::{
    Action, CommandPayload, CommandType, Entity, EntityKind, EntityState, EventPayload,
    EventType, Lifecycle, Rejection, ResponseBody, Thing, validate_key,
};

use super::command::{CommandRegistry, FnStrategy, Outcome, unexpected_payload};
use super::event::{ApplyError, EventRegistry, wrong_state};

/// Register every thing command strategy.
pub fn register_commands(registry: &mut CommandRegistry) {
    let kind = EntityKind::Thing;
    registry.register(kind, CommandType::CreateThing, FnStrategy::create(create));
    registry.register(kind, CommandType::ModifyThing, FnStrategy::new(Action::Modify, modify));
    registry.register(
        kind,
        CommandType::ModifyAttribute,
        FnStrategy::new(Action::Modify, modify_attribute),
    );
    registry.register(
        kind,
        CommandType::ModifyPolicyId,
        FnStrategy::new(Action::Modify, modify_policy_id),
    );
    registry.register(kind, CommandType::DeleteThing, FnStrategy::new(Action::Delete, delete));
    registry.register(
        kind,
        CommandType::RetrieveThing,
        FnStrategy::new(Action::Retrieve, retrieve),
    );
}

/// Register every thing event transition.
pub fn register_events(registry: &mut EventRegistry) {
    let kind = EntityKind::Thing;
    registry.register(kind, EventType::ThingCreated, on_created);
    registry.register(kind, EventType::ThingModified, on_modified);
    registry.register(kind, EventType::AttributeModified, on_attribute_modified);
    registry.register(kind, EventType::PolicyIdModified, on_policy_id_modified);
    registry.register(kind, EventType::ThingDeleted, on_deleted);
}

fn validate_policy_id(policy_id: &str) -> Result<(), Rejection> {
    validate_key(policy_id)
        .map_err(|e| Rejection::validation(format!("invalid policy id '{policy_id}': {e}")))
}

fn validate_attribute_name(name: &str) -> Result<(), Rejection> {
    if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(Rejection::validation(format!(
            "attribute name '{name}' must be non-empty without whitespace or '/'"
        )));
    }
    Ok(())
}

fn validate(thing: &Thing) -> Result<(), Rejection> {
    if let Some(policy_id) = &thing.policy_id {
        validate_policy_id(policy_id)?;
    }
    thing
        .attributes
        .keys()
        .try_for_each(|name| validate_attribute_name(name))
}

fn create(payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    let CommandPayload::CreateThing { thing } = payload else {
        return Err(unexpected_payload(payload));
    };
    validate(thing)?;
    Ok(Outcome::write(
        Action::Create,
        EventPayload::ThingCreated {
            thing: thing.clone(),
        },
    ))
}

fn modify(payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    let CommandPayload::ModifyThing { thing } = payload else {
        return Err(unexpected_payload(payload));
    };
    validate(thing)?;
    Ok(Outcome::write(
        Action::Modify,
        EventPayload::ThingModified {
            thing: thing.clone(),
        },
    ))
}

fn modify_attribute(payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    let CommandPayload::ModifyAttribute { name, value } = payload else {
        return Err(unexpected_payload(payload));
    };
    validate_attribute_name(name)?;
    Ok(Outcome::write(
        Action::Modify,
        EventPayload::AttributeModified {
            name: name.clone(),
            value: value.clone(),
        },
    ))
}

fn modify_policy_id(payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    let CommandPayload::ModifyPolicyId { policy_id } = payload else {
        return Err(unexpected_payload(payload));
    };
    validate_policy_id(policy_id)?;
    Ok(Outcome::write(
        Action::Modify,
        EventPayload::PolicyIdModified {
            policy_id: policy_id.clone(),
        },
    ))
}

fn delete(_payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    Ok(Outcome::write(Action::Delete, EventPayload::ThingDeleted))
}

fn retrieve(_payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection> {
    let thing = entity.thing().ok_or_else(|| Rejection::not_found(&entity.id))?;
    Ok(Outcome::unchanged(
        Action::Retrieve,
        ResponseBody::State(EntityState::Thing(thing.clone())),
    ))
}

fn on_created(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    let EventPayload::ThingCreated { thing } = payload else {
        return Err(wrong_state(entity, payload, "payload mismatch"));
    };
    entity.state = Some(EntityState::Thing(thing.clone()));
    entity.lifecycle = Lifecycle::Active;
    Ok(())
}

fn on_modified(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    let EventPayload::ThingModified { thing } = payload else {
        return Err(wrong_state(entity, payload, "payload mismatch"));
    };
    if entity.thing().is_none() {
        return Err(wrong_state(entity, payload, "no thing state"));
    }
    entity.state = Some(EntityState::Thing(thing.clone()));
    Ok(())
}

fn on_attribute_modified(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    let EventPayload::AttributeModified { name, value } = payload else {
        return Err(wrong_state(entity, payload, "payload mismatch"));
    };
    if let Some(EntityState::Thing(thing)) = &mut entity.state {
        thing.attributes.insert(name.clone(), value.clone());
        return Ok(());
    }
    Err(wrong_state(entity, payload, "no thing state"))
}

fn on_policy_id_modified(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    let EventPayload::PolicyIdModified { policy_id } = payload else {
        return Err(wrong_state(entity, payload, "payload mismatch"));
    };
    if let Some(EntityState::Thing(thing)) = &mut entity.state {
        thing.policy_id = Some(policy_id.clone());
        return Ok(());
    }
    Err(wrong_state(entity, payload, "no thing state"))
}

fn on_deleted(entity: &mut Entity, _payload: &EventPayload) -> Result<(), ApplyError> {
    entity.lifecycle = Lifecycle::Deleted;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use twinhub_types::{Command, EntityId, RejectionKind};

    use super::*;

    fn handle(entity: &Entity, payload: CommandPayload) -> Result<Outcome, Rejection> {
        CommandRegistry::standard().handle(&Command::new(entity.id.clone(), payload), entity)
    }

    fn live_thing() -> Entity {
        let mut entity = Entity::empty(EntityId::thing("plant:pump-7"));
        entity.revision = 1;
        entity.state = Some(EntityState::Thing(Thing::default()));
        entity
    }

    #[test]
    fn create_rejects_malformed_policy_id() {
        let empty = Entity::empty(EntityId::thing("plant:pump-7"));
        let thing = Thing {
            policy_id: Some("no-namespace".to_owned()),
            ..Thing::default()
        };
        let err = handle(&empty, CommandPayload::CreateThing { thing }).unwrap_err();
        assert_eq!(err.kind, RejectionKind::Validation);
    }

    #[test]
    fn modify_policy_id_emits_binding_event() {
        let outcome = handle(
            &live_thing(),
            CommandPayload::ModifyPolicyId {
                policy_id: "plant:default".to_owned(),
            },
        )
        .unwrap();
        assert_eq!(
            outcome.event,
            Some(EventPayload::PolicyIdModified {
                policy_id: "plant:default".to_owned()
            })
        );
    }

    #[test]
    fn attribute_name_is_validated() {
        let err = handle(
            &live_thing(),
            CommandPayload::ModifyAttribute {
                name: "a/b".to_owned(),
                value: serde_json::json!(1),
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, RejectionKind::Validation);
    }

    #[test]
    fn attribute_event_sets_value() {
        let mut entity = live_thing();
        on_attribute_modified(
            &mut entity,
            &EventPayload::AttributeModified {
                name: "rpm".to_owned(),
                value: serde_json::json!(1450),
            },
        )
        .unwrap();
        assert_eq!(
            entity.thing().unwrap().attributes.get("rpm"),
            Some(&serde_json::json!(1450))
        );
    }

    #[test]
    fn delete_then_retrieve_is_not_found() {
        let mut entity = live_thing();
        on_deleted(&mut entity, &EventPayload::ThingDeleted).unwrap();
        let err = handle(&entity, CommandPayload::RetrieveThing).unwrap_err();
        assert_eq!(err.kind, RejectionKind::NotFound);
    }
}
