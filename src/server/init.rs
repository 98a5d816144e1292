//! Server initialization and main run loop
//!
//! Wires the registry refresh loop, the dispatch loop and the worker pool
//! together and tears them down on Ctrl-C / SIGTERM.

use super::components::{build_executor, connect_store, source_connector};
use super::config::AppConfig;
use super::validation::validate_config;
use anyhow::{Context, Result};
use pgsched_core::{JobRegistry, JobRunner, Scheduler, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run the scheduler service until a shutdown signal arrives
pub async fn run(config: AppConfig) -> Result<()> {
    info!("Starting pgsched v{}", env!("CARGO_PKG_VERSION"));
    validate_config(&config)?;

    let store = connect_store(&config).await?;
    store.migrate().await.context("Failed to apply migrations")?;
    Scheduler::recover(store.as_ref())
        .await
        .context("Failed to recover interrupted runs")?;

    let executor = build_executor(&config, store.clone(), source_connector(&config))?;
    let shutdown = CancellationToken::new();

    // ── Registry ─────────────────────────────────────────────────────
    let mut registry = JobRegistry::new(store.clone())
        .with_default_interval_secs(config.scheduler.default_interval_secs);
    let initial = registry
        .refresh()
        .await
        .context("Failed to load job definitions")?;
    info!(
        jobs = initial.jobs.len(),
        rejected = initial.rejected.len(),
        "Job definitions loaded"
    );
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);
    let registry_task = tokio::spawn(registry.run(
        snapshot_tx,
        Duration::from_secs(config.scheduler.reconcile_interval_secs),
        shutdown.clone(),
    ));

    // ── Scheduler + workers ──────────────────────────────────────────
    let scheduler = Scheduler::new(
        config
            .scheduler
            .engine(config.executor.statement_timeout_ms),
    );
    let (queue_tx, queue_rx) = mpsc::channel(scheduler.config().queue_capacity);
    let runner = Arc::new(JobRunner::new(executor, store.clone()));
    let pool = WorkerPool::spawn(
        scheduler.config().workers,
        queue_rx,
        runner,
        scheduler.running(),
        shutdown.clone(),
    );
    let shutdown_grace = scheduler.config().shutdown_grace;
    info!(workers = pool.size(), "Worker pool started");

    let scheduler_task = tokio::spawn(scheduler.run(snapshot_rx, queue_tx, shutdown.clone()));

    if let Err(e) = wait_for_shutdown_signal().await {
        error!("Signal handling failed, shutting down: {:#}", e);
    }
    shutdown.cancel();

    if let Err(e) = scheduler_task.await {
        error!("Scheduler task failed: {}", e);
    }
    if let Err(e) = registry_task.await {
        error!("Registry task failed: {}", e);
    }
    if !pool.join(shutdown_grace).await {
        warn!(
            grace_secs = shutdown_grace.as_secs(),
            "Executions still running after grace period were abandoned"
        );
    }

    info!("pgsched stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to install Ctrl+C handler")?;
                info!("Received Ctrl+C signal");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")?;
        info!("Received Ctrl+C signal");
    }

    Ok(())
}
