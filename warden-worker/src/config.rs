//! Worker configuration
//!
//! Database connection, tenant, polling and lease timing for one worker
//! process.

use anyhow::Context;
use std::time::Duration;
use uuid::Uuid;
use warden_core::domain::pipeline::PipelineKind;

/// Longest accepted stale lease timeout (30 days)
const MAX_STALE_LEASE_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Readable prefix of this worker's owner IDs
    pub worker_id: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Project whose pipelines this worker drives
    pub project_id: Uuid,

    /// Which pipeline tables to poll
    pub pipeline_kind: PipelineKind,

    /// How often to look for claimable pipelines
    pub poll_interval: Duration,

    /// How often a held lease is renewed
    pub heartbeat_interval: Duration,

    /// Take over leases silent for this long; `None` never takes over
    pub stale_lease_timeout: Option<Duration>,

    /// Pipelines driven at the same time
    pub max_parallel_pipelines: usize,

    /// Retries per step before the step is exhausted
    pub max_step_retries: u32,

    pub max_db_connections: u32,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, database_url: String, project_id: Uuid) -> Self {
        Self {
            worker_id,
            database_url,
            project_id,
            pipeline_kind: PipelineKind::SchemaDiscovery,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            stale_lease_timeout: None,
            max_parallel_pipelines: 2,
            max_step_retries: 3,
            max_db_connections: 10,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DATABASE_URL (required)
    /// - WARDEN_PROJECT_ID (required, UUID)
    /// - WORKER_ID (optional, default: "worker")
    /// - PIPELINE_KIND (optional, "schema_discovery" or "ontology_workflow")
    /// - POLL_INTERVAL (optional, seconds, default: 5)
    /// - HEARTBEAT_INTERVAL (optional, seconds, default: 10)
    /// - WARDEN_STALE_LEASE_TIMEOUT (optional, seconds, unset disables takeover)
    /// - MAX_PARALLEL_PIPELINES (optional, default: 2)
    /// - MAX_STEP_RETRIES (optional, default: 3)
    /// - MAX_DB_CONNECTIONS (optional, default: 10)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;

        let project_id = lookup("WARDEN_PROJECT_ID")
            .ok_or_else(|| anyhow::anyhow!("WARDEN_PROJECT_ID environment variable not set"))?
            .parse::<Uuid>()
            .context("WARDEN_PROJECT_ID must be a UUID")?;

        let worker_id = lookup("WORKER_ID").unwrap_or_else(|| "worker".to_string());
        let mut config = Self::new(worker_id, database_url, project_id);

        if let Some(kind) = lookup("PIPELINE_KIND") {
            config.pipeline_kind = kind.parse().context("Invalid PIPELINE_KIND")?;
        }

        let seconds = |key: &str| -> anyhow::Result<Option<Duration>> {
            lookup(key)
                .map(|s| {
                    s.parse::<u64>()
                        .map(Duration::from_secs)
                        .with_context(|| format!("{} must be a number of seconds", key))
                })
                .transpose()
        };

        if let Some(interval) = seconds("POLL_INTERVAL")? {
            config.poll_interval = interval;
        }
        if let Some(interval) = seconds("HEARTBEAT_INTERVAL")? {
            config.heartbeat_interval = interval;
        }
        config.stale_lease_timeout = seconds("WARDEN_STALE_LEASE_TIMEOUT")?;

        config.max_parallel_pipelines = lookup("MAX_PARALLEL_PIPELINES")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(config.max_parallel_pipelines);

        config.max_step_retries = lookup("MAX_STEP_RETRIES")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(config.max_step_retries);

        config.max_db_connections = lookup("MAX_DB_CONNECTIONS")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(config.max_db_connections);

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            anyhow::bail!("database_url must start with postgres:// or postgresql://");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if let Some(timeout) = self.stale_lease_timeout {
            if timeout <= self.heartbeat_interval {
                anyhow::bail!(
                    "stale_lease_timeout ({:?}) must be longer than heartbeat_interval ({:?})",
                    timeout,
                    self.heartbeat_interval
                );
            }
            if timeout > MAX_STALE_LEASE_TIMEOUT {
                anyhow::bail!(
                    "stale_lease_timeout ({:?}) must not exceed {:?}",
                    timeout,
                    MAX_STALE_LEASE_TIMEOUT
                );
            }
        }

        if self.max_parallel_pipelines == 0 {
            anyhow::bail!("max_parallel_pipelines must be greater than 0");
        }

        if self.max_db_connections == 0 {
            anyhow::bail!("max_db_connections must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            "worker".to_string(),
            "postgres://localhost/warden".to_string(),
            Uuid::nil(),
        )
    }
}
