//! Per-entity actors.
//!
//! Each entity id is served by one task that owns the entity's in-memory
//! state and is the only writer of its journal. Commands arrive on a
//! bounded mailbox and are processed strictly one at a time:
//!
//! ```text
//! RECOVERING --(snapshot + replay)--> READY --(event)--> PERSISTING --> READY
//!     |                                 |
//!     +--(journal unreadable)-----------+--(idle / deleted)--> STOPPED
//! ```
//!
//! A command's event is applied to a copy of the entity first, then
//! appended, and only after the journal acknowledges is the copy adopted.
//! Nothing has to be rolled back: a failed append leaves the entity as it
//! was, and a crash after the append is repaired by recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use twinhub_db::{EntityJournal, JournalError};
use twinhub_types::{
    Command, Entity, EntityId, Event, Lifecycle, Rejection, RejectionKind, Response, Revision,
};

use crate::config::ActorsConfig;
use crate::strategy::{ApplyError, Strategies};

/// Lifecycle phase of an entity actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorPhase {
    /// Loading the snapshot and replaying the journal.
    Recovering,
    /// Waiting for commands.
    Ready,
    /// Waiting for the journal to acknowledge an event.
    Persisting,
    /// Finished; the mailbox is closed and drained.
    Stopped,
}

/// Tuning for one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorSettings {
    /// Mailbox capacity.
    pub mailbox_capacity: usize,
    /// Stop after this long without a command.
    pub idle_timeout: Duration,
    /// Snapshot after this many revisions.
    pub snapshot_every: u64,
    /// Snapshot after this long, if the entity changed.
    pub snapshot_interval: Duration,
}

impl From<&ActorsConfig> for ActorSettings {
    fn from(config: &ActorsConfig) -> Self {
        Self {
            mailbox_capacity: config.mailbox_capacity,
            idle_timeout: config.idle_timeout(),
            snapshot_every: config.snapshot_every_revisions,
            snapshot_interval: config.snapshot_interval(),
        }
    }
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self::from(&ActorsConfig::default())
    }
}

/// Why recovery failed.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// The snapshot or the event log could not be read.
    #[error("journal read failed: {0}")]
    Journal(#[from] JournalError),

    /// The stored events do not replay cleanly.
    #[error("replay failed: {0}")]
    Replay(#[from] ApplyError),

    /// The stored snapshot belongs to another entity.
    #[error("snapshot for {found} stored under {expected}")]
    ForeignSnapshot {
        /// The entity being recovered.
        expected: EntityId,
        /// The entity the snapshot names.
        found: EntityId,
    },
}

type Reply = oneshot::Sender<Result<Response, Rejection>>;

struct Envelope {
    command: Command,
    reply: Reply,
}

/// Client side of an entity actor.
#[derive(Clone)]
pub struct ActorHandle {
    entity_id: EntityId,
    sender: mpsc::Sender<Envelope>,
    phase: watch::Receiver<ActorPhase>,
}

impl ActorHandle {
    /// The entity this actor serves.
    pub const fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Current phase.
    pub fn phase(&self) -> ActorPhase {
        *self.phase.borrow()
    }

    /// A receiver that observes phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<ActorPhase> {
        self.phase.clone()
    }

    /// Whether the actor no longer accepts commands. It may still be
    /// draining its mailbox.
    pub fn is_closing(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether the actor has finished, or its task ended without saying so.
    pub fn is_stopped(&self) -> bool {
        self.phase() == ActorPhase::Stopped || self.phase.has_changed().is_err()
    }

    /// Send `command` and wait for the answer.
    ///
    /// Dropping the returned future does not cancel the command: if it has
    /// reached the mailbox it is processed, and a persisted event stands.
    ///
    /// # Errors
    ///
    /// Returns the strategy's [`Rejection`], or `Overloaded` if the mailbox
    /// is full, or `Unavailable` if the actor is stopping or stopped.
    pub async fn send(&self, command: Command) -> Result<Response, Rejection> {
        let (reply, answer) = oneshot::channel();
        self.sender
            .try_send(Envelope { command, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Rejection::new(
                    RejectionKind::Overloaded,
                    format!("mailbox of {} is full", self.entity_id),
                ),
                mpsc::error::TrySendError::Closed(_) => Rejection::new(
                    RejectionKind::Unavailable,
                    format!("actor for {} is stopping", self.entity_id),
                ),
            })?;
        answer.await.map_err(|e| {
            Rejection::new(
                RejectionKind::Unavailable,
                format!("actor for {} stopped before answering: {e}", self.entity_id),
            )
        })?
    }
}

impl std::fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("entity_id", &self.entity_id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Server side of an entity actor. Owned by its task.
pub struct EntityActor {
    entity: Entity,
    journal: Arc<dyn EntityJournal>,
    strategies: Arc<Strategies>,
    settings: ActorSettings,
    phase: watch::Sender<ActorPhase>,
    last_snapshot_revision: Revision,
    last_snapshot_at: Instant,
    stop_requested: bool,
}

/// Start an actor for `entity_id` on the current runtime.
///
/// The actor begins in [`ActorPhase::Recovering`]; commands sent before
/// recovery finishes wait in the mailbox.
pub fn spawn(
    entity_id: EntityId,
    journal: Arc<dyn EntityJournal>,
    strategies: Arc<Strategies>,
    settings: ActorSettings,
) -> (ActorHandle, JoinHandle<()>) {
    let (sender, mailbox) = mpsc::channel(settings.mailbox_capacity.max(1));
    let (phase_tx, phase_rx) = watch::channel(ActorPhase::Recovering);

    let actor = EntityActor {
        entity: Entity::empty(entity_id.clone()),
        journal,
        strategies,
        settings,
        phase: phase_tx,
        last_snapshot_revision: 0,
        last_snapshot_at: Instant::now(),
        stop_requested: false,
    };
    let task = tokio::spawn(actor.run(mailbox));

    let handle = ActorHandle {
        entity_id,
        sender,
        phase: phase_rx,
    };
    (handle, task)
}

impl EntityActor {
    async fn run(mut self, mut mailbox: mpsc::Receiver<Envelope>) {
        if let Err(e) = self.recover().await {
            error!(entity_id = %self.entity.id, error = %e, "entity recovery failed");
            mailbox.close();
            let message = format!("recovery of {} failed: {e}", self.entity.id);
            while let Some(envelope) = mailbox.recv().await {
                let rejection = Rejection::new(RejectionKind::Recovery, message.clone());
                drop(envelope.reply.send(Err(rejection)));
            }
            self.set_phase(ActorPhase::Stopped);
            return;
        }
        self.set_phase(ActorPhase::Ready);

        loop {
            match tokio::time::timeout(self.settings.idle_timeout, mailbox.recv()).await {
                Ok(Some(envelope)) => self.serve(envelope).await,
                Ok(None) => break,
                Err(_elapsed) => {
                    debug!(entity_id = %self.entity.id, "entity actor idle, stopping");
                    break;
                }
            }
            if self.stop_requested {
                break;
            }
        }

        // Whatever raced into the mailbox is still answered by this actor,
        // so no second writer starts before the last event here is durable.
        mailbox.close();
        while let Some(envelope) = mailbox.recv().await {
            self.serve(envelope).await;
        }
        self.set_phase(ActorPhase::Stopped);
        debug!(entity_id = %self.entity.id, revision = self.entity.revision, "entity actor stopped");
    }

    async fn recover(&mut self) -> Result<(), RecoveryError> {
        let id = self.entity.id.clone();
        let base = match self.journal.latest_snapshot(&id).await? {
            Some(snapshot) if snapshot.id != id => {
                return Err(RecoveryError::ForeignSnapshot {
                    expected: id,
                    found: snapshot.id,
                });
            }
            Some(snapshot) => snapshot,
            None => Entity::empty(id.clone()),
        };

        let from = base.revision.saturating_add(1);
        let events = self.journal.read_from(&id, from).await?;
        let replayed = events.len();
        let snapshot_revision = base.revision;
        self.entity = self.strategies.events.replay(base, &events)?;
        self.last_snapshot_revision = snapshot_revision;
        self.last_snapshot_at = Instant::now();

        info!(
            entity_id = %id,
            snapshot_revision,
            replayed,
            revision = self.entity.revision,
            "entity recovered"
        );
        Ok(())
    }

    async fn serve(&mut self, envelope: Envelope) {
        let result = self.handle(envelope.command).await;
        if let Err(rejection) = &result {
            debug!(entity_id = %self.entity.id, kind = %rejection.kind, "command rejected");
        }
        // The caller may have gone away; the outcome stands regardless.
        drop(envelope.reply.send(result));
    }

    async fn handle(&mut self, command: Command) -> Result<Response, Rejection> {
        if command.entity_id != self.entity.id {
            return Err(Rejection::validation(format!(
                "command for {} delivered to {}",
                command.entity_id, self.entity.id
            )));
        }

        let outcome = self.strategies.commands.handle(&command, &self.entity)?;
        let Some(payload) = outcome.event else {
            return Ok(Response {
                revision: self.entity.revision,
                action: outcome.action,
                result: outcome.result,
            });
        };

        let revision = self.entity.revision.checked_add(1).ok_or_else(|| {
            Rejection::new(
                RejectionKind::Persistence,
                format!("{} has exhausted its revision space", self.entity.id),
            )
        })?;
        let event = Event {
            entity_id: self.entity.id.clone(),
            revision,
            // Stored with microsecond precision; truncate so replay matches.
            timestamp: Utc::now().trunc_subsecs(6),
            payload,
        };

        let next = self.strategies.events.apply(&self.entity, &event).map_err(|e| {
            error!(entity_id = %self.entity.id, error = %e, "event does not apply to current state");
            Rejection::new(RejectionKind::Persistence, format!("event not applicable: {e}"))
        })?;

        self.set_phase(ActorPhase::Persisting);
        let appended = self.journal.append(&event).await;
        self.set_phase(ActorPhase::Ready);

        match appended {
            Ok(()) => {}
            Err(JournalError::RevisionConflict { current, .. }) => {
                // Another writer got there first. This state is stale; stop
                // so the next command recovers from the journal.
                warn!(
                    entity_id = %self.entity.id,
                    attempted = revision,
                    current,
                    "stale revision on append"
                );
                self.stop_requested = true;
                return Err(Rejection::conflict(format!(
                    "stale revision: {} is at {current} in the journal, tried {revision}",
                    self.entity.id
                )));
            }
            Err(e) => {
                warn!(entity_id = %self.entity.id, revision, error = %e, "event not persisted");
                return Err(Rejection::new(RejectionKind::Persistence, e.to_string()));
            }
        }

        self.entity = next;
        debug!(
            entity_id = %self.entity.id,
            revision,
            event_type = %event.event_type(),
            "event persisted"
        );
        self.maybe_snapshot().await;

        if self.entity.lifecycle == Lifecycle::Deleted {
            self.stop_requested = true;
        }

        Ok(Response {
            revision,
            action: outcome.action,
            result: outcome.result,
        })
    }

    async fn maybe_snapshot(&mut self) {
        let since = self
            .entity
            .revision
            .saturating_sub(self.last_snapshot_revision);
        if since == 0 {
            return;
        }
        let due = since >= self.settings.snapshot_every
            || self.last_snapshot_at.elapsed() >= self.settings.snapshot_interval;
        if !due {
            return;
        }

        match self.journal.write_snapshot(&self.entity).await {
            Ok(()) => {
                self.last_snapshot_revision = self.entity.revision;
                self.last_snapshot_at = Instant::now();
                debug!(entity_id = %self.entity.id, revision = self.entity.revision, "snapshot written");
            }
            Err(e) => {
                warn!(entity_id = %self.entity.id, error = %e, "snapshot write failed");
            }
        }
    }

    fn set_phase(&self, phase: ActorPhase) {
        self.phase.send_replace(phase);
    }
}
