//! Engine binary for twinhub.
//!
//! Wires the event-sourced entity actors to NATS command intake, starts one
//! catch-up sync supervisor per configured entity kind, and serves the
//! status API. Runs until `Ctrl-C`.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `TWINHUB_CONFIG` or `twinhub-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and run migrations
//! 4. Pick the checkpoint backend (`PostgreSQL` or Dragonfly)
//! 5. Connect to NATS and ensure the reference tag stream
//! 6. Build the entity router and start the command listener
//! 7. Start the sync supervisors and the status API
//! 8. Wait for `Ctrl-C`, then stop everything in reverse order

mod commands;
mod error;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use twinhub_core::config::CheckpointBackend;
use twinhub_core::{ActorSettings, EntityRouter, Strategies, TwinhubConfig};
use twinhub_db::{CheckpointStore, DragonflyPool, PostgresConfig, PostgresPool};
use twinhub_observer::{AppState, ServerConfig};
use twinhub_sync::{
    NatsPublisher, Publisher, StatusBoard, StreamSettings, SyncStreamSupervisor, resolver_for,
};

use crate::commands::CommandListener;
use crate::error::EngineError;

/// Default config file, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "twinhub-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, storage, NATS or the status API
/// cannot be brought up.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, source) = load_config()?;
    logging::init(&config.logging);

    info!(config = %source, "twinhub-engine starting");
    info!(
        kinds = ?config.sync.kinds,
        poll_interval_ms = config.sync.poll_interval_ms,
        grace_period_ms = config.sync.grace_period_ms,
        mailbox_capacity = config.actors.mailbox_capacity,
        checkpoint_backend = ?config.sync.checkpoint_backend,
        "configuration loaded"
    );

    Box::pin(run(config)).await?;

    info!("twinhub-engine shutdown complete");
    Ok(())
}

/// Load the config file named by `TWINHUB_CONFIG`, falling back to
/// [`DEFAULT_CONFIG_PATH`], or defaults when neither exists.
fn load_config() -> Result<(TwinhubConfig, String), EngineError> {
    let path = std::env::var_os("TWINHUB_CONFIG")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    if path.exists() {
        let config = TwinhubConfig::from_file(&path)?;
        return Ok((config, path.display().to_string()));
    }
    let mut config = TwinhubConfig::default();
    config.infrastructure.apply_env_overrides();
    config.validate()?;
    Ok((config, "defaults".to_owned()))
}

#[allow(clippy::too_many_lines)]
async fn run(config: TwinhubConfig) -> Result<(), EngineError> {
    let infra = &config.infrastructure;

    // Storage.
    let pool_config = PostgresConfig::new(&infra.postgres_url)
        .with_max_connections(infra.postgres_max_connections)
        .with_connect_timeout(infra.postgres_connect_timeout());
    let postgres = PostgresPool::connect(&pool_config).await?;
    postgres.run_migrations().await?;
    let journal = Arc::new(postgres.journal());

    let mut dragonfly = None;
    let checkpoints: Arc<dyn CheckpointStore> = match config.sync.checkpoint_backend {
        CheckpointBackend::Postgres => Arc::new(postgres.checkpoints()),
        CheckpointBackend::Dragonfly => {
            let pool = DragonflyPool::connect(&infra.dragonfly_url).await?;
            let store = Arc::new(pool.checkpoints());
            dragonfly = Some(pool);
            store
        }
    };

    // NATS.
    info!(nats_url = %infra.nats_url, "connecting to NATS");
    let nats = async_nats::connect(&infra.nats_url)
        .await
        .map_err(|e| EngineError::Nats {
            message: format!("failed to connect to {}: {e}", infra.nats_url),
        })?;
    let publisher: Arc<dyn Publisher> = Arc::new(
        NatsPublisher::new(nats.clone(), &infra.command_subject_prefix).await?,
    );
    info!("NATS connection established");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Entity actors behind command intake.
    let router = Arc::new(EntityRouter::new(
        journal.clone(),
        Arc::new(Strategies::standard()),
        ActorSettings::from(&config.actors),
    ));
    let listener = CommandListener::new(
        nats.clone(),
        Arc::clone(&router),
        &infra.command_subject_prefix,
    );
    let listener_task = tokio::spawn(listener.run(shutdown_rx.clone()));
    let prune_task = spawn_pruner(
        Arc::clone(&router),
        config.actors.idle_timeout(),
        shutdown_rx.clone(),
    );

    // Sync supervisors.
    let board = StatusBoard::new();
    let settings = StreamSettings::from(&config.sync);
    let supervisors: Vec<JoinHandle<()>> = config
        .sync
        .kinds
        .iter()
        .map(|&kind| {
            let supervisor = SyncStreamSupervisor::new(
                kind,
                journal.clone(),
                resolver_for(kind, journal.clone()),
                Arc::clone(&publisher),
                Arc::clone(&checkpoints),
                board.clone(),
                settings.clone(),
            );
            tokio::spawn(supervisor.run(shutdown_rx.clone()))
        })
        .collect();

    // Status API.
    let server_config = ServerConfig {
        port: infra.status_port,
        ..ServerConfig::default()
    };
    let state = Arc::new(AppState::new(board));
    let mut observer_task = tokio::spawn(async move {
        twinhub_observer::start_server(&server_config, state, shutdown_rx).await
    });

    // Run until Ctrl-C, or until the status API dies on its own.
    let mut observer_result = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for ctrl-c, shutting down");
            }
            info!("shutdown requested");
        }
        result = &mut observer_task => {
            observer_result = Some(result);
        }
    }

    drop(shutdown_tx.send(true));

    for supervisor in supervisors {
        if let Err(e) = supervisor.await {
            error!(error = %e, "sync supervisor task failed");
        }
    }
    match listener_task.await {
        Ok(Err(e)) => error!(error = %e, "command listener failed"),
        Err(e) => error!(error = %e, "command listener task failed"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = prune_task.await {
        error!(error = %e, "actor pruner task failed");
    }
    router.shutdown().await;

    if let Err(e) = nats.flush().await {
        warn!(error = %e, "failed to flush NATS");
    }
    let dragonfly_closed = match &dragonfly {
        Some(pool) => pool.close().await,
        None => Ok(()),
    };
    if let Err(e) = dragonfly_closed {
        warn!(error = %e, "failed to close Dragonfly connection");
    }
    postgres.close().await;

    let observer_result = match observer_result {
        Some(result) => result,
        None => observer_task.await,
    };
    match observer_result {
        Ok(result) => result.map_err(EngineError::from),
        Err(e) => {
            error!(error = %e, "status API task failed");
            Ok(())
        }
    }
}

/// Drop handles of stopped actors every `every`.
fn spawn_pruner(
    router: Arc<EntityRouter>,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let live = router.prune().await;
                    debug!(live, "pruned stopped actors");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
