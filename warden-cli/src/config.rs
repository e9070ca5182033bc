//! Configuration module
//!
//! Connection and tenant settings shared by every command.

use anyhow::{Context, Result};
use std::sync::Arc;
use uuid::Uuid;
use warden_coordinator::{Coordinator, PgPipelineRepository, db};
use warden_core::domain::pipeline::PipelineKind;
use warden_core::tenant::ProjectId;

/// A single CLI invocation needs only a couple of connections
const MAX_CONNECTIONS: u32 = 2;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub project_id: Uuid,
    pub pipeline_kind: PipelineKind,
    /// Print JSON instead of formatted text
    pub json: bool,
}

impl Config {
    pub fn project(&self) -> ProjectId {
        ProjectId::new(self.project_id)
    }

    /// Connect to the store and build a coordinator for the configured kind
    pub async fn coordinator(&self) -> Result<Coordinator> {
        let pool = db::create_pool(&self.database_url, MAX_CONNECTIONS)
            .await
            .context("Failed to connect to database")?;
        db::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        let repository = Arc::new(PgPipelineRepository::new(pool, self.pipeline_kind));
        Ok(Coordinator::new(repository))
    }
}
