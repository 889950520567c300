//! One long-lived catch-up stream per entity kind.
//!
//! Each cycle syncs the window `(checkpoint, window_end]`:
//!
//! ```text
//!   checkpoint ──► changes in window ──► resolve tags ──► publish all
//!        ▲                                                     │
//!        └──────────── set to window_end only if every ────────┘
//!                      tag was acknowledged
//! ```
//!
//! A failed window leaves the checkpoint where it was and is retried whole
//! after a backoff, so redelivery is expected and the lag grows visibly
//! instead of changes being skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use twinhub_core::config::SyncConfig;
use twinhub_db::CheckpointStore;
use twinhub_types::{EntityKind, ReferenceTag};

use crate::backoff::Backoff;
use crate::change_source::ChangeSource;
use crate::error::SyncError;
use crate::publisher::Publisher;
use crate::resolver::DependencyResolver;
use crate::status::{StatusBoard, StreamStatus, SyncHealth, classify};

/// Timing and fan-out knobs of one stream.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Wait between cycles when caught up.
    pub poll_interval: Duration,
    /// Margin kept between the window end and now.
    pub grace_period: Duration,
    /// Cap on one window's span, if any.
    pub max_window: Option<Duration>,
    /// Concurrent resolutions and publishes within a window.
    pub max_parallelism: usize,
    /// How far back to start when no checkpoint exists.
    pub initial_start_offset: Duration,
    /// Explicit start overriding `initial_start_offset`.
    pub start_timestamp: Option<DateTime<Utc>>,
    /// First retry delay.
    pub backoff_min: Duration,
    /// Longest retry delay.
    pub backoff_max: Duration,
    /// Lag above which the stream reports a warning.
    pub outdated_warning: Duration,
    /// Lag above which the stream reports an error.
    pub outdated_error: Duration,
}

impl From<&SyncConfig> for StreamSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            grace_period: Duration::from_millis(config.grace_period_ms),
            max_window: config.max_window_ms.map(Duration::from_millis),
            max_parallelism: config.max_parallelism,
            initial_start_offset: Duration::from_millis(config.initial_start_offset_ms),
            start_timestamp: config.start_timestamp,
            backoff_min: Duration::from_millis(config.backoff_min_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            outdated_warning: Duration::from_millis(config.outdated_warning_offset_ms),
            outdated_error: Duration::from_millis(config.outdated_error_offset_ms),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The window was empty after the grace period; nothing to do.
    Idle {
        /// The unchanged checkpoint.
        checkpoint: DateTime<Utc>,
    },
    /// Every tag in the window was acknowledged and the checkpoint moved.
    Synced {
        /// Exclusive lower bound of the window.
        from: DateTime<Utc>,
        /// Inclusive upper bound, now the checkpoint.
        to: DateTime<Utc>,
        /// Changed entities found.
        changes: usize,
        /// Tags published.
        tags: usize,
        /// The window was cut short by `max_window`.
        backlog: bool,
    },
}

/// The stream id used for `kind`'s checkpoint and status entry.
pub fn stream_id_for(kind: EntityKind) -> String {
    format!("{kind}-references")
}

/// Drives the sync stream for one entity kind.
pub struct SyncStreamSupervisor {
    kind: EntityKind,
    stream_id: String,
    changes: Arc<dyn ChangeSource>,
    resolver: Arc<dyn DependencyResolver>,
    publisher: Arc<dyn Publisher>,
    checkpoints: Arc<dyn CheckpointStore>,
    board: StatusBoard,
    settings: StreamSettings,
    backoff: Backoff,
    retention_start: Option<DateTime<Utc>>,
    checkpoint: Option<DateTime<Utc>>,
    next_delay: Duration,
}

impl SyncStreamSupervisor {
    /// Assemble a supervisor. Nothing runs until [`run`](Self::run) or
    /// [`run_cycle_at`](Self::run_cycle_at).
    pub fn new(
        kind: EntityKind,
        changes: Arc<dyn ChangeSource>,
        resolver: Arc<dyn DependencyResolver>,
        publisher: Arc<dyn Publisher>,
        checkpoints: Arc<dyn CheckpointStore>,
        board: StatusBoard,
        settings: StreamSettings,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff_min, settings.backoff_max);
        let next_delay = settings.poll_interval;
        Self {
            kind,
            stream_id: stream_id_for(kind),
            changes,
            resolver,
            publisher,
            checkpoints,
            board,
            settings,
            backoff,
            retention_start: None,
            checkpoint: None,
            next_delay,
        }
    }

    /// This stream's id.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// How long [`run`](Self::run) waits after the most recent cycle.
    pub const fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Cycle until `shutdown` turns true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(stream_id = %self.stream_id, kind = %self.kind, "sync supervisor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Failures are recorded on the board and in the backoff.
            drop(self.run_cycle_at(Utc::now()).await);
            tokio::select! {
                () = tokio::time::sleep(self.next_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(stream_id = %self.stream_id, "sync supervisor stopped");
    }

    /// Run one cycle as if the wall clock read `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] if any step of the window failed. The
    /// checkpoint is unchanged and the next delay is a backoff.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, SyncError> {
        let result = self.sync_window(now).await;
        self.record(now, &result).await;
        result
    }

    async fn sync_window(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, SyncError> {
        let last = self.last_synced(now).await?;

        let mut window_end = shift_back(now, self.settings.grace_period)?.trunc_subsecs(6);
        let mut backlog = false;
        if let Some(max_window) = self.settings.max_window {
            let cap = shift_forward(last, max_window)?;
            if cap < window_end {
                window_end = cap;
                backlog = true;
            }
        }
        if window_end <= last {
            return Ok(CycleOutcome::Idle { checkpoint: last });
        }

        let changes = self
            .changes
            .changes_between(self.kind, last, window_end)
            .await
            .map_err(SyncError::ChangeSource)?;

        let parallelism = self.settings.max_parallelism.max(1);
        let resolver = &self.resolver;
        let resolutions: Vec<_> = changes
            .iter()
            .map(|change| resolver.resolve(change))
            .collect();
        let tags: Vec<ReferenceTag> = stream::iter(resolutions)
            .buffered(parallelism)
            .map_err(SyncError::Resolve)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .flatten()
            .collect();

        let publisher = &self.publisher;
        let publishes: Vec<_> = tags
            .iter()
            .map(|tag| async move {
                let outcome = publisher.publish(tag).await;
                debug!(tag = %tag.dedupe_key(), acked = outcome.is_ok(), "reference tag published");
                outcome
            })
            .collect();
        let results: Vec<_> = stream::iter(publishes)
            .buffer_unordered(parallelism)
            .collect()
            .await;
        let mut failures = results.into_iter().filter_map(Result::err);
        if let Some(first) = failures.next() {
            return Err(SyncError::Publish {
                failed: failures.count().saturating_add(1),
                total: tags.len(),
                first,
            });
        }

        self.checkpoints
            .set(&self.stream_id, window_end)
            .await
            .map_err(SyncError::Checkpoint)?;
        self.checkpoint = Some(window_end);

        Ok(CycleOutcome::Synced {
            from: last,
            to: window_end,
            changes: changes.len(),
            tags: tags.len(),
            backlog,
        })
    }

    /// Stored checkpoint, or the retention start fixed at the first cycle.
    async fn last_synced(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SyncError> {
        let stored = self
            .checkpoints
            .get(&self.stream_id)
            .await
            .map_err(SyncError::Checkpoint)?;
        if let Some(checkpoint) = stored {
            self.checkpoint = Some(checkpoint);
            return Ok(checkpoint);
        }
        self.fix_retention_start(now)
    }

    /// The retention start, computed from `now` the first time it is needed
    /// and fixed from then on.
    fn fix_retention_start(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SyncError> {
        if let Some(start) = self.retention_start {
            return Ok(start);
        }
        let start = match self.settings.start_timestamp {
            Some(start) => start,
            None => shift_back(now, self.settings.initial_start_offset)?,
        };
        debug!(stream_id = %self.stream_id, start = %start, "retention start fixed");
        self.retention_start = Some(start);
        Ok(start)
    }

    async fn record(&mut self, now: DateTime<Utc>, result: &Result<CycleOutcome, SyncError>) {
        // A stream that has never read its checkpoint still ages from the
        // retention start, so a store that is down from the outset shows lag.
        let reference = match self.checkpoint {
            Some(checkpoint) => Some(checkpoint),
            None => self.fix_retention_start(now).ok(),
        };
        let lag_ms = reference
            .and_then(|at| u64::try_from(now.signed_duration_since(at).num_milliseconds()).ok())
            .unwrap_or(0);
        let health = classify(
            lag_ms,
            duration_ms(self.settings.outdated_warning),
            duration_ms(self.settings.outdated_error),
        );

        let previous_tags = self
            .board
            .get(&self.stream_id)
            .await
            .map_or(0, |status| status.last_window_tags);
        let (last_error, last_window_tags) = match result {
            Ok(CycleOutcome::Synced {
                from,
                to,
                changes,
                tags,
                backlog,
            }) => {
                self.backoff.reset();
                self.next_delay = if *backlog {
                    Duration::ZERO
                } else {
                    self.settings.poll_interval
                };
                info!(
                    stream_id = %self.stream_id,
                    from = %from,
                    to = %to,
                    changes,
                    tags,
                    lag_ms,
                    "window synced"
                );
                (None, *tags)
            }
            Ok(CycleOutcome::Idle { .. }) => {
                self.backoff.reset();
                self.next_delay = self.settings.poll_interval;
                (None, previous_tags)
            }
            Err(e) => {
                self.next_delay = self.backoff.record_failure();
                warn!(
                    stream_id = %self.stream_id,
                    error = %e,
                    failures = self.backoff.failures(),
                    retry_in_ms = duration_ms(self.next_delay),
                    "sync window failed, checkpoint kept"
                );
                (Some(e.to_string()), previous_tags)
            }
        };

        match health {
            SyncHealth::Healthy => {}
            SyncHealth::Warning => {
                warn!(stream_id = %self.stream_id, lag_ms, "sync stream is outdated");
            }
            SyncHealth::Error => {
                error!(stream_id = %self.stream_id, lag_ms, "sync stream is badly outdated");
            }
        }

        self.board
            .update(StreamStatus {
                stream_id: self.stream_id.clone(),
                kind: self.kind,
                checkpoint: self.checkpoint,
                lag_ms,
                health,
                consecutive_failures: self.backoff.failures(),
                last_error,
                last_window_tags,
                updated_at: now,
            })
            .await;
    }
}

impl std::fmt::Debug for SyncStreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStreamSupervisor")
            .field("stream_id", &self.stream_id)
            .field("checkpoint", &self.checkpoint)
            .field("failures", &self.backoff.failures())
            .finish_non_exhaustive()
    }
}

fn delta(span: Duration) -> Result<TimeDelta, SyncError> {
    TimeDelta::from_std(span).map_err(|e| SyncError::Clock(format!("{span:?}: {e}")))
}

fn shift_back(at: DateTime<Utc>, span: Duration) -> Result<DateTime<Utc>, SyncError> {
    at.checked_sub_signed(delta(span)?)
        .ok_or_else(|| SyncError::Clock(format!("{at} minus {span:?}")))
}

fn shift_forward(at: DateTime<Utc>, span: Duration) -> Result<DateTime<Utc>, SyncError> {
    at.checked_add_signed(delta(span)?)
        .ok_or_else(|| SyncError::Clock(format!("{at} plus {span:?}")))
}

fn duration_ms(span: Duration) -> u64 {
    u64::try_from(span.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::arithmetic_side_effects)]
mod tests {
    use twinhub_db::{MemoryCheckpointStore, MemoryJournal};

    use super::*;
    use crate::publisher::RecordingPublisher;
    use crate::resolver::SelfReference;

    fn supervisor(settings: StreamSettings) -> (SyncStreamSupervisor, StatusBoard) {
        let board = StatusBoard::new();
        let supervisor = SyncStreamSupervisor::new(
            EntityKind::Thing,
            Arc::new(MemoryJournal::new()),
            Arc::new(SelfReference),
            Arc::new(RecordingPublisher::new()),
            Arc::new(MemoryCheckpointStore::new()),
            board.clone(),
            settings,
        );
        (supervisor, board)
    }

    #[tokio::test]
    async fn retention_start_is_fixed_at_first_cycle() {
        let (mut sup, _) = supervisor(StreamSettings::default());
        let now = Utc::now();
        sup.run_cycle_at(now).await.unwrap();
        let later = now + TimeDelta::seconds(30);
        let outcome = sup.run_cycle_at(later).await.unwrap();
        // The empty first window still set a checkpoint, so the second one
        // starts there and not at a recomputed retention start.
        let CycleOutcome::Synced { from, .. } = outcome else {
            panic!("expected a synced window, got {outcome:?}");
        };
        assert_eq!(from, (now - TimeDelta::seconds(10)).trunc_subsecs(6));
    }

    #[tokio::test]
    async fn window_inside_grace_period_is_idle() {
        let now = Utc::now();
        let settings = StreamSettings {
            start_timestamp: Some(now - TimeDelta::seconds(5)),
            ..StreamSettings::default()
        };
        let (mut sup, board) = supervisor(settings);
        let outcome = sup.run_cycle_at(now).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Idle { .. }));
        assert_eq!(sup.next_delay(), Duration::from_secs(5));
        assert_eq!(board.get("thing-references").await.unwrap().checkpoint, None);
    }

    #[test]
    fn stream_ids_follow_kind() {
        assert_eq!(stream_id_for(EntityKind::Policy), "policy-references");
    }
}
