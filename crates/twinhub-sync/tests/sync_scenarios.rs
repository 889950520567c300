//! Sync window scenarios against scripted change sources and in-memory
//! stores.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::arithmetic_side_effects
)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use twinhub_db::{
    CheckpointStore, DbError, EntityJournal, MemoryCheckpointStore, MemoryJournal,
};
use twinhub_sync::{
    BindingIndex, ChangeSource, CycleOutcome, Publisher, RecordingPublisher, SelfReference, StatusBoard,
    StreamSettings, SyncError, SyncHealth, SyncStreamSupervisor, resolver_for, stream_id_for,
};
use twinhub_types::{
    ChangeRecord, EntityId, EntityKind, Event, EventPayload, Policy, Revision, Thing,
};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn change(key: &str, secs: i64, revision: Revision) -> ChangeRecord {
    ChangeRecord {
        entity_id: EntityId::thing(key),
        timestamp: at(secs),
        revision,
    }
}

/// Serves a fixed list of changes and remembers every window asked for.
struct ScriptedChanges {
    records: Vec<ChangeRecord>,
    windows: Mutex<Vec<(i64, i64)>>,
}

impl ScriptedChanges {
    fn new(records: Vec<ChangeRecord>) -> Self {
        Self {
            records,
            windows: Mutex::new(Vec::new()),
        }
    }

    fn windows(&self) -> Vec<(i64, i64)> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeSource for ScriptedChanges {
    async fn changes_between(
        &self,
        _kind: EntityKind,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, DbError> {
        self.windows
            .lock()
            .unwrap()
            .push((after.timestamp(), until.timestamp()));
        Ok(self
            .records
            .iter()
            .filter(|r| r.timestamp > after && r.timestamp <= until)
            .cloned()
            .collect())
    }
}

struct Harness {
    changes: Arc<ScriptedChanges>,
    publisher: Arc<RecordingPublisher>,
    checkpoints: Arc<MemoryCheckpointStore>,
    board: StatusBoard,
    supervisor: SyncStreamSupervisor,
}

fn settings() -> StreamSettings {
    StreamSettings {
        grace_period: Duration::from_secs(10),
        backoff_min: Duration::from_millis(100),
        backoff_max: Duration::from_secs(1),
        ..StreamSettings::default()
    }
}

async fn harness(records: Vec<ChangeRecord>, checkpoint: i64, settings: StreamSettings) -> Harness {
    let changes = Arc::new(ScriptedChanges::new(records));
    let publisher = Arc::new(RecordingPublisher::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    checkpoints
        .set(&stream_id_for(EntityKind::Thing), at(checkpoint))
        .await
        .unwrap();
    let board = StatusBoard::new();
    let source: Arc<dyn ChangeSource> = changes.clone();
    let sink: Arc<dyn Publisher> = publisher.clone();
    let store: Arc<dyn CheckpointStore> = checkpoints.clone();
    let supervisor = SyncStreamSupervisor::new(
        EntityKind::Thing,
        source,
        Arc::new(SelfReference),
        sink,
        store,
        board.clone(),
        settings,
    );
    Harness {
        changes,
        publisher,
        checkpoints,
        board,
        supervisor,
    }
}

impl Harness {
    async fn checkpoint(&self) -> i64 {
        self.checkpoints
            .get(&stream_id_for(EntityKind::Thing))
            .await
            .unwrap()
            .unwrap()
            .timestamp()
    }

    async fn delivered_causes(&self) -> Vec<String> {
        self.publisher
            .deliveries()
            .await
            .iter()
            .map(|t| t.cause.key.clone())
            .collect()
    }
}

// =============================================================================
// Windows
// =============================================================================

#[tokio::test]
async fn fully_acknowledged_window_advances_checkpoint() {
    let mut h = harness(
        vec![change("ns:e1", 100, 1), change("ns:e2", 150, 4)],
        50,
        settings(),
    )
    .await;

    let outcome = h.supervisor.run_cycle_at(at(210)).await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Synced {
            from: at(50),
            to: at(200),
            changes: 2,
            tags: 2,
            backlog: false,
        }
    );
    assert_eq!(h.changes.windows(), vec![(50, 200)]);
    assert_eq!(h.checkpoint().await, 200);
    let mut causes = h.delivered_causes().await;
    causes.sort();
    assert_eq!(causes, vec!["ns:e1", "ns:e2"]);
}

#[tokio::test]
async fn failed_publish_freezes_checkpoint_and_retries_whole_window() {
    let mut h = harness(
        vec![change("ns:e1", 100, 1), change("ns:e2", 150, 4)],
        50,
        settings(),
    )
    .await;
    h.publisher.fail_for(EntityId::thing("ns:e2")).await;

    let err = h.supervisor.run_cycle_at(at(210)).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Publish {
            failed: 1,
            total: 2,
            ..
        }
    ));
    assert_eq!(h.checkpoint().await, 50);
    let status = h.board.get("thing-references").await.unwrap();
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.last_error.is_some());
    assert!(h.supervisor.next_delay() >= Duration::from_millis(100));

    h.publisher.heal(&EntityId::thing("ns:e2")).await;
    h.supervisor.run_cycle_at(at(210)).await.unwrap();

    assert_eq!(h.changes.windows(), vec![(50, 200), (50, 200)]);
    assert_eq!(h.checkpoint().await, 200);
    let mut causes = h.delivered_causes().await;
    causes.sort();
    assert_eq!(causes, vec!["ns:e1", "ns:e1", "ns:e2"]);
    let status = h.board.get("thing-references").await.unwrap();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.last_error, None);
}

#[tokio::test]
async fn backlog_is_drained_in_bounded_windows() {
    let settings = StreamSettings {
        max_window: Some(Duration::from_secs(60)),
        ..settings()
    };
    let mut h = harness(
        vec![
            change("ns:a", 70, 1),
            change("ns:b", 130, 1),
            change("ns:c", 190, 1),
        ],
        50,
        settings,
    )
    .await;

    let first = h.supervisor.run_cycle_at(at(210)).await.unwrap();
    assert!(matches!(first, CycleOutcome::Synced { backlog: true, .. }));
    assert_eq!(h.supervisor.next_delay(), Duration::ZERO);
    h.supervisor.run_cycle_at(at(210)).await.unwrap();
    let last = h.supervisor.run_cycle_at(at(210)).await.unwrap();
    assert!(matches!(last, CycleOutcome::Synced { backlog: false, .. }));

    assert_eq!(h.changes.windows(), vec![(50, 110), (110, 170), (170, 200)]);
    assert_eq!(h.checkpoint().await, 200);
    assert_eq!(h.delivered_causes().await, vec!["ns:a", "ns:b", "ns:c"]);
}

#[tokio::test]
async fn caught_up_stream_does_not_query() {
    let mut h = harness(vec![], 200, settings()).await;
    let outcome = h.supervisor.run_cycle_at(at(205)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle { checkpoint: at(200) });
    assert!(h.changes.windows().is_empty());
}

#[tokio::test]
async fn checkpoint_store_outage_keeps_old_checkpoint() {
    let mut h = harness(vec![change("ns:e1", 100, 1)], 50, settings()).await;
    h.checkpoints.set_available(false);

    let err = h.supervisor.run_cycle_at(at(210)).await.unwrap_err();
    assert!(matches!(err, SyncError::Checkpoint(_)));

    h.checkpoints.set_available(true);
    assert_eq!(h.checkpoint().await, 50);
    h.supervisor.run_cycle_at(at(210)).await.unwrap();
    assert_eq!(h.checkpoint().await, 200);
}

#[tokio::test]
async fn lag_beyond_error_offset_is_reported() {
    let settings = StreamSettings {
        outdated_warning: Duration::from_secs(60),
        outdated_error: Duration::from_secs(600),
        ..settings()
    };
    let mut h = harness(vec![change("ns:stuck", 100, 1)], 50, settings).await;
    h.publisher.fail_for(EntityId::thing("ns:stuck")).await;

    h.supervisor.run_cycle_at(at(55)).await.unwrap();
    assert_eq!(
        h.board.get("thing-references").await.unwrap().health,
        SyncHealth::Healthy
    );
    h.supervisor.run_cycle_at(at(500)).await.ok();
    assert_eq!(
        h.board.get("thing-references").await.unwrap().health,
        SyncHealth::Warning
    );
    h.supervisor.run_cycle_at(at(5000)).await.ok();
    let status = h.board.get("thing-references").await.unwrap();
    assert_eq!(status.health, SyncHealth::Error);
    assert_eq!(status.lag_ms, 4_950_000);
    assert_eq!(status.consecutive_failures, 2);
}

#[tokio::test]
async fn unreadable_checkpoint_from_first_cycle_still_ages() {
    let settings = StreamSettings {
        initial_start_offset: Duration::from_secs(60),
        outdated_warning: Duration::from_secs(3_600),
        outdated_error: Duration::from_secs(86_400),
        ..settings()
    };
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    checkpoints.set_available(false);
    let store: Arc<dyn CheckpointStore> = checkpoints.clone();
    let board = StatusBoard::new();
    let mut supervisor = SyncStreamSupervisor::new(
        EntityKind::Thing,
        Arc::new(ScriptedChanges::new(vec![])),
        Arc::new(SelfReference),
        Arc::new(RecordingPublisher::new()),
        store,
        board.clone(),
        settings,
    );

    let day = 86_400;
    let start = 1_000_000;
    let expected = [
        (start, 60_000, SyncHealth::Healthy),
        (start + day, 86_460_000, SyncHealth::Error),
        (start + 2 * day, 172_860_000, SyncHealth::Error),
    ];
    for (failures, (secs, lag_ms, health)) in (1..).zip(expected) {
        let err = supervisor.run_cycle_at(at(secs)).await.unwrap_err();
        assert!(matches!(err, SyncError::Checkpoint(_)));
        let status = board.get("thing-references").await.unwrap();
        assert_eq!(status.lag_ms, lag_ms);
        assert_eq!(status.health, health);
        assert_eq!(status.consecutive_failures, failures);
        assert_eq!(status.checkpoint, None);
    }
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn every_change_at_or_before_checkpoint_was_published() {
    let records: Vec<ChangeRecord> = (1..=20)
        .map(|i| change(&format!("ns:e{i}"), 50 + i * 10, 1))
        .collect();
    let flaky = EntityId::thing("ns:e7");
    let settings = StreamSettings {
        max_window: Some(Duration::from_secs(35)),
        ..settings()
    };
    let mut h = harness(records.clone(), 50, settings).await;
    h.publisher.fail_for(flaky.clone()).await;

    for cycle in 0..12 {
        if cycle == 6 {
            h.publisher.heal(&flaky).await;
        }
        h.supervisor.run_cycle_at(at(400)).await.ok();

        let checkpoint = h.checkpoint().await;
        let delivered = h.delivered_causes().await;
        for record in records.iter().filter(|r| r.timestamp.timestamp() <= checkpoint) {
            assert!(
                delivered.contains(&record.entity_id.key),
                "{} at {} not published but checkpoint is {checkpoint}",
                record.entity_id,
                record.timestamp
            );
        }
    }
    assert_eq!(h.checkpoint().await, 295);
    assert_eq!(h.publisher.index().await.len(), 20);
}

#[tokio::test]
async fn republishing_a_window_leaves_index_unchanged() {
    let mut h = harness(
        vec![change("ns:e1", 100, 3), change("ns:e2", 150, 4)],
        50,
        settings(),
    )
    .await;
    h.supervisor.run_cycle_at(at(210)).await.unwrap();
    let once = h.publisher.index().await;

    let mut replay = harness(
        vec![change("ns:e1", 100, 3), change("ns:e2", 150, 4)],
        50,
        settings(),
    )
    .await;
    replay.supervisor.run_cycle_at(at(210)).await.unwrap();
    for tag in replay.publisher.deliveries().await {
        h.publisher.publish(&tag).await.unwrap();
    }

    assert_eq!(h.publisher.index().await, once);
}

// =============================================================================
// Policy stream over the in-memory journal
// =============================================================================

async fn append(journal: &MemoryJournal, id: EntityId, revision: Revision, secs: i64, payload: EventPayload) {
    journal
        .append(&Event {
            entity_id: id,
            revision,
            timestamp: at(secs),
            payload,
        })
        .await
        .unwrap();
}

fn bound_to(policy: &str) -> EventPayload {
    EventPayload::ThingCreated {
        thing: Thing {
            policy_id: Some(policy.to_owned()),
            ..Thing::default()
        },
    }
}

#[tokio::test]
async fn policy_change_notifies_bound_things() {
    let journal = Arc::new(MemoryJournal::new());
    append(&journal, EntityId::thing("ns:pump"), 1, 60, bound_to("ns:plant")).await;
    append(&journal, EntityId::thing("ns:valve"), 1, 61, bound_to("ns:plant")).await;
    append(&journal, EntityId::thing("ns:other"), 1, 62, bound_to("ns:elsewhere")).await;
    append(
        &journal,
        EntityId::policy("ns:plant"),
        1,
        120,
        EventPayload::PolicyCreated {
            policy: Policy::default(),
        },
    )
    .await;

    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    checkpoints
        .set(&stream_id_for(EntityKind::Policy), at(100))
        .await
        .unwrap();
    let publisher = Arc::new(RecordingPublisher::new());
    let source: Arc<dyn ChangeSource> = journal.clone();
    let index: Arc<dyn BindingIndex> = journal;
    let sink: Arc<dyn Publisher> = publisher.clone();
    let mut supervisor = SyncStreamSupervisor::new(
        EntityKind::Policy,
        source,
        resolver_for(EntityKind::Policy, index),
        sink,
        checkpoints,
        StatusBoard::new(),
        settings(),
    );

    let outcome = supervisor.run_cycle_at(at(300)).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Synced { changes: 1, tags: 2, .. }));

    let deliveries = publisher.deliveries().await;
    let mut targets: Vec<String> = deliveries.iter().map(|t| t.target.to_string()).collect();
    targets.sort();
    assert_eq!(targets, vec!["thing:ns:pump", "thing:ns:valve"]);
    assert!(
        deliveries
            .iter()
            .all(|t| t.cause == EntityId::policy("ns:plant") && t.cause_revision == 1)
    );
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn supervisor_stops_on_shutdown_signal() {
    let h = harness(vec![], 50, settings()).await;
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(h.supervisor.run(rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("supervisor did not stop")
        .unwrap();
    assert!(h.board.get("thing-references").await.is_some());
}
