//! Routes commands to entity actors, one live actor per entity id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use twinhub_db::EntityJournal;
use twinhub_types::{Command, EntityId, Rejection, Response};

use crate::actor::{self, ActorHandle, ActorPhase, ActorSettings};
use crate::strategy::Strategies;

/// Owns the live actors and spawns them on demand.
///
/// An actor that has stopped (idle, deleted, failed recovery, stale
/// revision) is replaced on the next command for its id. An actor that is
/// still draining its mailbox is waited for first, so two actors never
/// write the same entity at once.
pub struct EntityRouter {
    journal: Arc<dyn EntityJournal>,
    strategies: Arc<Strategies>,
    settings: ActorSettings,
    actors: Mutex<HashMap<EntityId, ActorHandle>>,
}

impl EntityRouter {
    /// Create a router over `journal` with the given strategies.
    pub fn new(
        journal: Arc<dyn EntityJournal>,
        strategies: Arc<Strategies>,
        settings: ActorSettings,
    ) -> Self {
        Self {
            journal,
            strategies,
            settings,
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Validate the target id, then deliver `command` to its actor.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` rejection for a malformed id, otherwise
    /// whatever the actor answers.
    pub async fn dispatch(&self, command: Command) -> Result<Response, Rejection> {
        command
            .entity_id
            .validate()
            .map_err(|e| Rejection::validation(e.to_string()))?;
        let handle = self.handle_for(&command.entity_id).await;
        handle.send(command).await
    }

    /// The live actor for `id`, spawning one if needed.
    pub async fn handle_for(&self, id: &EntityId) -> ActorHandle {
        loop {
            let mut draining = {
                let mut actors = self.actors.lock().await;
                match actors.get(id) {
                    Some(handle) if !handle.is_closing() => return handle.clone(),
                    Some(handle) if !handle.is_stopped() => handle.watch_phase(),
                    _ => {
                        let (handle, _task) = actor::spawn(
                            id.clone(),
                            Arc::clone(&self.journal),
                            Arc::clone(&self.strategies),
                            self.settings,
                        );
                        debug!(entity_id = %id, "spawned entity actor");
                        actors.insert(id.clone(), handle.clone());
                        return handle;
                    }
                }
            };
            // An error means the actor task is gone, which is as good as stopped.
            drop(draining.wait_for(|phase| *phase == ActorPhase::Stopped).await);
        }
    }

    /// Phase of the actor for `id`, if one is registered.
    pub async fn phase_of(&self, id: &EntityId) -> Option<ActorPhase> {
        self.actors.lock().await.get(id).map(ActorHandle::phase)
    }

    /// Forget stopped actors and return how many remain.
    pub async fn prune(&self) -> usize {
        let mut actors = self.actors.lock().await;
        actors.retain(|_, handle| !handle.is_stopped());
        actors.len()
    }

    /// Drop every handle. Actors finish their mailboxes and stop.
    pub async fn shutdown(&self) {
        let mut actors = self.actors.lock().await;
        let count = actors.len();
        actors.clear();
        debug!(count, "released entity actors");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use twinhub_db::MemoryJournal;
    use twinhub_types::{CommandPayload, RejectionKind, Thing};

    use super::*;

    fn router(journal: Arc<MemoryJournal>) -> EntityRouter {
        EntityRouter::new(journal, Arc::new(Strategies::standard()), ActorSettings::default())
    }

    #[tokio::test]
    async fn malformed_id_is_rejected_before_spawning() {
        let router = router(Arc::new(MemoryJournal::new()));
        let command = Command::new(EntityId::thing("no namespace"), CommandPayload::RetrieveThing);
        let err = router.dispatch(command).await.unwrap_err();
        assert_eq!(err.kind, RejectionKind::Validation);
        assert_eq!(router.prune().await, 0);
    }

    #[tokio::test]
    async fn one_actor_per_id() {
        let router = router(Arc::new(MemoryJournal::new()));
        let a = EntityId::thing("ns:a");
        let b = EntityId::thing("ns:b");
        for id in [&a, &b, &a] {
            router
                .dispatch(Command::new(
                    id.clone(),
                    CommandPayload::CreateThing {
                        thing: Thing::default(),
                    },
                ))
                .await
                .ok();
        }
        assert_eq!(router.prune().await, 2);
        assert_eq!(router.phase_of(&a).await, Some(ActorPhase::Ready));
    }

    #[tokio::test]
    async fn deleted_entity_is_served_by_a_fresh_actor() {
        let journal = Arc::new(MemoryJournal::new());
        let router = router(Arc::clone(&journal));
        let id = EntityId::thing("ns:t");
        let create = Command::new(
            id.clone(),
            CommandPayload::CreateThing {
                thing: Thing::default(),
            },
        );

        router.dispatch(create.clone()).await.unwrap();
        router
            .dispatch(Command::new(id.clone(), CommandPayload::DeleteThing))
            .await
            .unwrap();

        let revived = router.dispatch(create).await.unwrap();
        assert_eq!(revived.revision, 3);
        assert_eq!(journal.events(&id).await.len(), 3);
    }
}
