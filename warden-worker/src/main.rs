//! Warden Worker
//!
//! An executor process that drives leased pipelines to completion.
//!
//! Architecture:
//! - Configuration: Load settings from the environment
//! - Coordinator: Leases and state tracking in the shared PostgreSQL store
//! - Services: Step execution
//! - Scheduler: Pipeline polling, heartbeats and the step loop
//!
//! Any number of workers may run against the same store; the ownership lease
//! makes sure each pipeline is driven by one of them at a time.

mod config;
mod scheduler;
mod service;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_coordinator::{Coordinator, PgPipelineRepository, db};

use crate::config::Config;
use crate::scheduler::PipelinePoller;
use crate::service::{StepExecutor, TracingStepExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden_worker=info,warden_coordinator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Warden Worker");

    let config = load_config()?;
    info!(
        "Loaded configuration: worker_id={}, project={}, kind={}",
        config.worker_id, config.project_id, config.pipeline_kind
    );
    match config.stale_lease_timeout {
        Some(timeout) => info!("Stale leases are taken over after {:?}", timeout),
        None => info!("Stale lease takeover disabled"),
    }

    let pool = db::create_pool(&config.database_url, config.max_db_connections)
        .await
        .context("Failed to connect to database")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let repository = Arc::new(PgPipelineRepository::new(pool, config.pipeline_kind));
    let coordinator = Coordinator::new(repository);
    let executor: Arc<dyn StepExecutor> = Arc::new(TracingStepExecutor::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = PipelinePoller::new(config.clone(), coordinator, executor, shutdown_rx);

    info!("Worker initialized as {}", poller.owner());
    info!(
        "Poll interval: {:?}, heartbeat interval: {:?}",
        config.poll_interval, config.heartbeat_interval
    );

    let mut run = tokio::spawn(async move { poller.run().await });

    tokio::select! {
        result = &mut run => {
            let result = result.context("Poller task panicked")?;
            if let Err(e) = &result {
                error!("Poller error: {:#}", e);
            }
            return result;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received, releasing held pipelines");
        }
    }

    let _ = shutdown_tx.send(true);
    run.await.context("Poller task panicked")??;

    info!("Worker stopped");
    Ok(())
}

/// Loads and validates configuration from environment variables
fn load_config() -> Result<Config> {
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    Ok(config)
}
