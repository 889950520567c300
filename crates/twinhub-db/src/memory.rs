//! In-memory journal and checkpoint store.
//!
//! Used by tests and single-node setups. Both stores carry an availability
//! switch so callers can exercise the journal-down and checkpoint-down
//! paths without a real backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use twinhub_types::{
    ChangeRecord, Entity, EntityId, EntityKind, Event, EventPayload, Revision,
};

use crate::checkpoint_store::CheckpointStore;
use crate::error::{DbError, JournalError};
use crate::journal::EntityJournal;

#[derive(Debug, Default)]
struct Logs {
    events: BTreeMap<EntityId, Vec<Event>>,
    snapshots: BTreeMap<EntityId, BTreeMap<Revision, Entity>>,
}

/// Journal held in process memory.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    logs: RwLock<Logs>,
    unavailable: AtomicBool,
}

impl MemoryJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the journal on or off. While off every operation fails with
    /// [`JournalError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), JournalError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(JournalError::Unavailable(
                "in-memory journal switched off".to_owned(),
            ));
        }
        Ok(())
    }

    /// All events of `entity_id`, in revision order.
    pub async fn events(&self, entity_id: &EntityId) -> Vec<Event> {
        self.logs
            .read()
            .await
            .events
            .get(entity_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Revisions that have a snapshot for `entity_id`, ascending.
    pub async fn snapshot_revisions(&self, entity_id: &EntityId) -> Vec<Revision> {
        self.logs
            .read()
            .await
            .snapshots
            .get(entity_id)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Entities of `kind` with an event in `(after, until]`.
    ///
    /// Same contract as the `PostgreSQL` journal: one record per entity with
    /// its latest revision in the window, ordered by timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Unavailable`] while switched off.
    pub async fn changes_between(
        &self,
        kind: EntityKind,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, DbError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("in-memory journal switched off".to_owned()));
        }
        let logs = self.logs.read().await;
        let mut changes: Vec<ChangeRecord> = logs
            .events
            .iter()
            .filter(|(id, _)| id.kind == kind)
            .filter_map(|(id, events)| {
                events
                    .iter()
                    .rev()
                    .find(|e| e.timestamp > after && e.timestamp <= until)
                    .map(|e| ChangeRecord {
                        entity_id: id.clone(),
                        timestamp: e.timestamp,
                        revision: e.revision,
                    })
            })
            .collect();
        changes.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        Ok(changes)
    }

    /// Things whose current policy binding is `policy_key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Unavailable`] while switched off.
    pub async fn things_bound_to(&self, policy_key: &str) -> Result<Vec<EntityId>, DbError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("in-memory journal switched off".to_owned()));
        }
        let logs = self.logs.read().await;
        Ok(logs
            .events
            .iter()
            .filter(|(id, _)| id.kind == EntityKind::Thing)
            .filter(|(_, events)| current_binding(events).as_deref() == Some(policy_key))
            .map(|(id, _)| id.clone())
            .collect())
    }
}

/// The policy a thing is bound to after applying `events` in order.
fn current_binding(events: &[Event]) -> Option<String> {
    events.iter().fold(None, |bound, event| match &event.payload {
        EventPayload::ThingCreated { thing } | EventPayload::ThingModified { thing } => {
            thing.policy_id.clone()
        }
        EventPayload::PolicyIdModified { policy_id } => Some(policy_id.clone()),
        EventPayload::ThingDeleted => None,
        _ => bound,
    })
}

#[async_trait]
impl EntityJournal for MemoryJournal {
    async fn append(&self, event: &Event) -> Result<(), JournalError> {
        self.check_available()?;
        let mut logs = self.logs.write().await;
        let log = logs.events.entry(event.entity_id.clone()).or_default();
        let current = log.last().map_or(0, |e| e.revision);
        if Some(event.revision) != current.checked_add(1) {
            return Err(JournalError::RevisionConflict {
                entity_id: event.entity_id.clone(),
                attempted: event.revision,
                current,
            });
        }
        log.push(event.clone());
        Ok(())
    }

    async fn read_from(
        &self,
        entity_id: &EntityId,
        from: Revision,
    ) -> Result<Vec<Event>, JournalError> {
        self.check_available()?;
        let logs = self.logs.read().await;
        Ok(logs
            .events
            .get(entity_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.revision >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write_snapshot(&self, entity: &Entity) -> Result<(), JournalError> {
        self.check_available()?;
        let mut logs = self.logs.write().await;
        logs.snapshots
            .entry(entity.id.clone())
            .or_default()
            .insert(entity.revision, entity.clone());
        Ok(())
    }

    async fn latest_snapshot(&self, entity_id: &EntityId) -> Result<Option<Entity>, JournalError> {
        self.check_available()?;
        let logs = self.logs.read().await;
        Ok(logs
            .snapshots
            .get(entity_id)
            .and_then(|s| s.values().next_back().cloned()))
    }
}

/// Checkpoint store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<BTreeMap<String, DateTime<Utc>>>,
    unavailable: AtomicBool,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the store on or off.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, stream_id: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("checkpoint store switched off".to_owned()));
        }
        Ok(self.checkpoints.read().await.get(stream_id).copied())
    }

    async fn set(&self, stream_id: &str, timestamp: DateTime<Utc>) -> Result<(), DbError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("checkpoint store switched off".to_owned()));
        }
        let mut checkpoints = self.checkpoints.write().await;
        let slot = checkpoints.entry(stream_id.to_owned()).or_insert(timestamp);
        if timestamp > *slot {
            *slot = timestamp;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use chrono::TimeZone;
    use twinhub_types::Thing;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn event(id: &EntityId, revision: Revision, secs: i64, payload: EventPayload) -> Event {
        Event {
            entity_id: id.clone(),
            revision,
            timestamp: at(secs),
            payload,
        }
    }

    fn thing_bound_to(policy: &str) -> EventPayload {
        EventPayload::ThingCreated {
            thing: Thing {
                policy_id: Some(policy.to_owned()),
                ..Thing::default()
            },
        }
    }

    #[tokio::test]
    async fn append_rejects_gaps_and_duplicates() {
        let journal = MemoryJournal::new();
        let id = EntityId::thing("ns:t");

        journal.append(&event(&id, 1, 10, thing_bound_to("ns:p"))).await.unwrap();

        let dup = journal.append(&event(&id, 1, 11, EventPayload::ThingDeleted)).await;
        assert!(matches!(
            dup,
            Err(JournalError::RevisionConflict { attempted: 1, current: 1, .. })
        ));

        let gap = journal.append(&event(&id, 3, 12, EventPayload::ThingDeleted)).await;
        assert!(matches!(
            gap,
            Err(JournalError::RevisionConflict { attempted: 3, current: 1, .. })
        ));

        journal.append(&event(&id, 2, 13, EventPayload::ThingDeleted)).await.unwrap();
        let revisions: Vec<Revision> = journal.events(&id).await.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![1, 2]);
    }

    #[tokio::test]
    async fn first_event_must_be_revision_one() {
        let journal = MemoryJournal::new();
        let id = EntityId::thing("ns:t");
        let result = journal.append(&event(&id, 0, 10, thing_bound_to("ns:p"))).await;
        assert!(matches!(result, Err(JournalError::RevisionConflict { current: 0, .. })));
    }

    #[tokio::test]
    async fn read_from_is_inclusive_and_ordered() {
        let journal = MemoryJournal::new();
        let id = EntityId::thing("ns:t");
        journal.append(&event(&id, 1, 10, thing_bound_to("ns:p"))).await.unwrap();
        for rev in 2..=4 {
            let payload = EventPayload::AttributeModified {
                name: "n".to_owned(),
                value: serde_json::json!(rev),
            };
            journal.append(&event(&id, rev, 10, payload)).await.unwrap();
        }
        let tail = journal.read_from(&id, 3).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.revision).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn latest_snapshot_has_highest_revision() {
        let journal = MemoryJournal::new();
        let id = EntityId::policy("ns:p");
        for revision in [3, 7, 5] {
            let mut entity = Entity::empty(id.clone());
            entity.revision = revision;
            journal.write_snapshot(&entity).await.unwrap();
        }
        let latest = journal.latest_snapshot(&id).await.unwrap().unwrap();
        assert_eq!(latest.revision, 7);
        assert_eq!(journal.snapshot_revisions(&id).await, vec![3, 5, 7]);
    }

    #[tokio::test]
    async fn unavailable_journal_fails_every_operation() {
        let journal = MemoryJournal::new();
        let id = EntityId::thing("ns:t");
        journal.set_available(false);
        assert!(matches!(
            journal.append(&event(&id, 1, 1, thing_bound_to("ns:p"))).await,
            Err(JournalError::Unavailable(_))
        ));
        assert!(journal.read_from(&id, 0).await.is_err());
        assert!(journal.latest_snapshot(&id).await.is_err());
        journal.set_available(true);
        assert!(journal.read_from(&id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn changes_report_latest_revision_in_window() {
        let journal = MemoryJournal::new();
        let a = EntityId::thing("ns:a");
        let b = EntityId::thing("ns:b");
        let p = EntityId::policy("ns:p");
        journal.append(&event(&a, 1, 40, thing_bound_to("ns:p"))).await.unwrap();
        journal.append(&event(&b, 1, 150, thing_bound_to("ns:p"))).await.unwrap();
        journal
            .append(&event(&a, 2, 100, EventPayload::ThingDeleted))
            .await
            .unwrap();
        journal
            .append(&event(&p, 1, 120, EventPayload::PolicyDeleted))
            .await
            .unwrap();

        let changes = journal
            .changes_between(EntityKind::Thing, at(50), at(200))
            .await
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].entity_id, a);
        assert_eq!(changes[0].revision, 2);
        assert_eq!(changes[1].entity_id, b);

        // Upper bound is inclusive, lower bound exclusive.
        let edge = journal
            .changes_between(EntityKind::Thing, at(100), at(150))
            .await
            .unwrap();
        assert_eq!(edge.len(), 1);
        assert_eq!(edge[0].entity_id, b);
    }

    #[tokio::test]
    async fn bindings_follow_latest_binding_event() {
        let journal = MemoryJournal::new();
        let a = EntityId::thing("ns:a");
        let b = EntityId::thing("ns:b");
        let c = EntityId::thing("ns:c");
        journal.append(&event(&a, 1, 1, thing_bound_to("ns:p"))).await.unwrap();
        journal.append(&event(&b, 1, 1, thing_bound_to("ns:p"))).await.unwrap();
        journal.append(&event(&c, 1, 1, thing_bound_to("ns:q"))).await.unwrap();
        journal
            .append(&event(
                &b,
                2,
                2,
                EventPayload::PolicyIdModified {
                    policy_id: "ns:q".to_owned(),
                },
            ))
            .await
            .unwrap();
        journal
            .append(&event(
                &a,
                2,
                3,
                EventPayload::AttributeModified {
                    name: "x".to_owned(),
                    value: serde_json::json!(1),
                },
            ))
            .await
            .unwrap();

        assert_eq!(journal.things_bound_to("ns:p").await.unwrap(), vec![a]);
        assert_eq!(journal.things_bound_to("ns:q").await.unwrap(), vec![b, c]);
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backwards() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.get("things").await.unwrap(), None);
        store.set("things", at(200)).await.unwrap();
        store.set("things", at(100)).await.unwrap();
        assert_eq!(store.get("things").await.unwrap(), Some(at(200)));
    }
}
