//! Policy commands and events.
//!
//! Policies are modeled as state only. Nothing here evaluates a grant.

use twinhub_types::{
    Action, CommandPayload, CommandType, Entity, EntityKind, EntityState, EventPayload,
    EventType, Lifecycle, Policy, PolicyEntry, Rejection, RejectionKind, ResponseBody,
};

use super::command::{CommandRegistry, FnStrategy, Outcome, unexpected_payload};
use super::event::{ApplyError, EventRegistry, wrong_state};

/// Register every policy command strategy.
pub fn register_commands(registry: &mut CommandRegistry) {
    let kind = EntityKind::Policy;
    registry.register(kind, CommandType::CreatePolicy, FnStrategy::create(create));
    registry.register(
        kind,
        CommandType::ModifyPolicyEntry,
        FnStrategy::new(Action::Modify, modify_entry),
    );
    registry.register(
        kind,
        CommandType::DeletePolicyEntry,
        FnStrategy::new(Action::Modify, delete_entry),
    );
    registry.register(kind, CommandType::DeletePolicy, FnStrategy::new(Action::Delete, delete));
    registry.register(
        kind,
        CommandType::RetrievePolicy,
        FnStrategy::new(Action::Retrieve, retrieve),
    );
}

/// Register every policy event transition.
pub fn register_events(registry: &mut EventRegistry) {
    let kind = EntityKind::Policy;
    registry.register(kind, EventType::PolicyCreated, on_created);
    registry.register(kind, EventType::PolicyEntryModified, on_entry_modified);
    registry.register(kind, EventType::PolicyEntryDeleted, on_entry_deleted);
    registry.register(kind, EventType::PolicyDeleted, on_deleted);
}

fn validate_label(label: &str) -> Result<(), Rejection> {
    if label.is_empty() || label.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(Rejection::validation(format!(
            "policy entry label '{label}' must be non-empty without whitespace or '/'"
        )));
    }
    Ok(())
}

fn validate_entry(label: &str, entry: &PolicyEntry) -> Result<(), Rejection> {
    validate_label(label)?;
    if entry.subjects.is_empty() {
        return Err(Rejection::validation(format!(
            "policy entry '{label}' needs at least one subject"
        )));
    }
    if let Some(path) = entry
        .resources
        .iter()
        .find(|(_, perms)| !perms.grant.is_disjoint(&perms.revoke))
        .map(|(path, _)| path)
    {
        return Err(Rejection::validation(format!(
            "policy entry '{label}' grants and revokes the same permission on '{path}'"
        )));
    }
    Ok(())
}

fn current(entity: &Entity) -> Result<&Policy, Rejection> {
    entity.policy().ok_or_else(|| Rejection::not_found(&entity.id))
}

fn create(payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    let CommandPayload::CreatePolicy { policy } = payload else {
        return Err(unexpected_payload(payload));
    };
    for (label, entry) in &policy.entries {
        validate_entry(label, entry)?;
    }
    Ok(Outcome::write(
        Action::Create,
        EventPayload::PolicyCreated {
            policy: policy.clone(),
        },
    ))
}

fn modify_entry(payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    let CommandPayload::ModifyPolicyEntry { label, entry } = payload else {
        return Err(unexpected_payload(payload));
    };
    validate_entry(label, entry)?;
    Ok(Outcome::write(
        Action::Modify,
        EventPayload::PolicyEntryModified {
            label: label.clone(),
            entry: entry.clone(),
        },
    ))
}

fn delete_entry(payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection> {
    let CommandPayload::DeletePolicyEntry { label } = payload else {
        return Err(unexpected_payload(payload));
    };
    if !current(entity)?.entries.contains_key(label) {
        return Err(Rejection::new(
            RejectionKind::NotFound,
            format!("{} has no entry '{label}'", entity.id),
        ));
    }
    Ok(Outcome::write(
        Action::Modify,
        EventPayload::PolicyEntryDeleted {
            label: label.clone(),
        },
    ))
}

fn delete(_payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    Ok(Outcome::write(Action::Delete, EventPayload::PolicyDeleted))
}

fn retrieve(_payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection> {
    Ok(Outcome::unchanged(
        Action::Retrieve,
        ResponseBody::State(EntityState::Policy(current(entity)?.clone())),
    ))
}

fn on_created(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    let EventPayload::PolicyCreated { policy } = payload else {
        return Err(wrong_state(entity, payload, "payload mismatch"));
    };
    entity.state = Some(EntityState::Policy(policy.clone()));
    entity.lifecycle = Lifecycle::Active;
    Ok(())
}

fn on_entry_modified(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    let EventPayload::PolicyEntryModified { label, entry } = payload else {
        return Err(wrong_state(entity, payload, "payload mismatch"));
    };
    if let Some(EntityState::Policy(policy)) = &mut entity.state {
        policy.entries.insert(label.clone(), entry.clone());
        return Ok(());
    }
    Err(wrong_state(entity, payload, "no policy state"))
}

fn on_entry_deleted(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    let EventPayload::PolicyEntryDeleted { label } = payload else {
        return Err(wrong_state(entity, payload, "payload mismatch"));
    };
    if let Some(EntityState::Policy(policy)) = &mut entity.state {
        policy.entries.remove(label);
        return Ok(());
    }
    Err(wrong_state(entity, payload, "no policy state"))
}

fn on_deleted(entity: &mut Entity, _payload: &EventPayload) -> Result<(), ApplyError> {
    entity.lifecycle = Lifecycle::Deleted;
    Ok(())
}
