//! Connection commands and events.
//!
//! Open and close are idempotent: opening an open connection (or closing a
//! closed one) answers at the current revision without writing an event.
//! They are also the only way to change a connection's status; a modify
//! keeps whatever status the connection already has.

use twinhub_types::{
    Action, CommandPayload, CommandType, Connection, ConnectionStatus, Entity, EntityKind,
    EntityState, EventPayload, EventType, Lifecycle, Rejection, ResponseBody,
};

use super::command::{CommandRegistry, FnStrategy, Outcome, unexpected_payload};
use super::event::{ApplyError, EventRegistry, wrong_state};

/// Register every connection command strategy.
pub fn register_commands(registry: &mut CommandRegistry) {
    let kind = EntityKind::Connection;
    registry.register(kind, CommandType::CreateConnection, FnStrategy::create(create));
    registry.register(
        kind,
        CommandType::ModifyConnection,
        FnStrategy::new(Action::Modify, modify),
    );
    registry.register(kind, CommandType::OpenConnection, FnStrategy::new(Action::Open, open));
    registry.register(
        kind,
        CommandType::CloseConnection,
        FnStrategy::new(Action::Close, close),
    );
    registry.register(
        kind,
        CommandType::DeleteConnection,
        FnStrategy::new(Action::Delete, delete),
    );
    registry.register(
        kind,
        CommandType::RetrieveConnection,
        FnStrategy::new(Action::Retrieve, retrieve),
    );
    registry.register(
        kind,
        CommandType::RetrieveConnectionStatus,
        FnStrategy::new(Action::RetrieveStatus, retrieve_status),
    );
}

/// Register every connection event transition.
pub fn register_events(registry: &mut EventRegistry) {
    let kind = EntityKind::Connection;
    registry.register(kind, EventType::ConnectionCreated, on_created);
    registry.register(kind, EventType::ConnectionModified, on_modified);
    registry.register(kind, EventType::ConnectionOpened, on_opened);
    registry.register(kind, EventType::ConnectionClosed, on_closed);
    registry.register(kind, EventType::ConnectionDeleted, on_deleted);
}

// =============================================================================
// Validation
// =============================================================================

fn validate(connection: &Connection) -> Result<(), Rejection> {
    if connection.name.trim().is_empty() {
        return Err(Rejection::validation("connection name must not be empty"));
    }
    let host = connection
        .uri
        .split_once("://")
        .map(|(scheme, rest)| (scheme, rest.split('/').next().unwrap_or_default()));
    match host {
        Some((scheme, host)) if !scheme.is_empty() && !host.is_empty() => {}
        _ => {
            return Err(Rejection::validation(format!(
                "connection uri '{}' must look like scheme://host[:port]",
                connection.uri
            )));
        }
    }
    if connection.client_count == 0 {
        return Err(Rejection::validation("client_count must be at least 1"));
    }
    if connection.sources.iter().chain(&connection.targets).any(|a| a.trim().is_empty()) {
        return Err(Rejection::validation("source and target addresses must not be empty"));
    }
    Ok(())
}

fn current(entity: &Entity) -> Result<&Connection, Rejection> {
    entity.connection().ok_or_else(|| Rejection::not_found(&entity.id))
}

// =============================================================================
// Command strategies
// =============================================================================

fn create(payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    let CommandPayload::CreateConnection { connection } = payload else {
        return Err(unexpected_payload(payload));
    };
    validate(connection)?;
    Ok(Outcome::write(
        Action::Create,
        EventPayload::ConnectionCreated {
            connection: connection.clone(),
        },
    ))
}

fn modify(payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection> {
    let CommandPayload::ModifyConnection { connection } = payload else {
        return Err(unexpected_payload(payload));
    };
    validate(connection)?;
    let status = current(entity)?.status;
    Ok(Outcome::write(
        Action::Modify,
        EventPayload::ConnectionModified {
            connection: Connection {
                status,
                ..connection.clone()
            },
        },
    ))
}

fn open(_payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection> {
    if current(entity)?.status == ConnectionStatus::Open {
        return Ok(Outcome::unchanged(Action::Open, ResponseBody::Done));
    }
    Ok(Outcome::write(Action::Open, EventPayload::ConnectionOpened))
}

fn close(_payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection> {
    if current(entity)?.status == ConnectionStatus::Closed {
        return Ok(Outcome::unchanged(Action::Close, ResponseBody::Done));
    }
    Ok(Outcome::write(Action::Close, EventPayload::ConnectionClosed))
}

fn delete(_payload: &CommandPayload, _entity: &Entity) -> Result<Outcome, Rejection> {
    Ok(Outcome::write(Action::Delete, EventPayload::ConnectionDeleted))
}

fn retrieve(_payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection> {
    let connection = current(entity)?;
    Ok(Outcome::unchanged(
        Action::Retrieve,
        ResponseBody::State(EntityState::Connection(connection.clone())),
    ))
}

fn retrieve_status(_payload: &CommandPayload, entity: &Entity) -> Result<Outcome, Rejection> {
    let connection = current(entity)?;
    Ok(Outcome::unchanged(
        Action::RetrieveStatus,
        ResponseBody::ConnectionStatus(connection.status),
    ))
}

// =============================================================================
// Event transitions
// =============================================================================

fn on_created(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    let EventPayload::ConnectionCreated { connection } = payload else {
        return Err(wrong_state(entity, payload, "payload mismatch"));
    };
    entity.state = Some(EntityState::Connection(connection.clone()));
    entity.lifecycle = Lifecycle::Active;
    Ok(())
}

fn on_modified(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    let EventPayload::ConnectionModified { connection } = payload else {
        return Err(wrong_state(entity, payload, "payload mismatch"));
    };
    if entity.connection().is_none() {
        return Err(wrong_state(entity, payload, "no connection state"));
    }
    entity.state = Some(EntityState::Connection(connection.clone()));
    Ok(())
}

fn set_status(
    entity: &mut Entity,
    payload: &EventPayload,
    status: ConnectionStatus,
) -> Result<(), ApplyError> {
    if let Some(EntityState::Connection(connection)) = &mut entity.state {
        connection.status = status;
        return Ok(());
    }
    Err(wrong_state(entity, payload, "no connection state"))
}

fn on_opened(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    set_status(entity, payload, ConnectionStatus::Open)
}

fn on_closed(entity: &mut Entity, payload: &EventPayload) -> Result<(), ApplyError> {
    set_status(entity, payload, ConnectionStatus::Closed)
}

fn on_deleted(entity: &mut Entity, _payload: &EventPayload) -> Result<(), ApplyError> {
    entity.lifecycle = Lifecycle::Deleted;
    Ok(())
}
