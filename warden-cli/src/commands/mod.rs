//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod node;
mod pipeline;

pub use node::NodeCommands;
pub use pipeline::PipelineCommands;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use uuid::Uuid;
use warden_coordinator::Coordinator;
use warden_core::domain::lease::{ClaimOutcome, LeaseGrant, OwnerId};
use warden_core::tenant;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pipeline management
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Node (step) management
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },
}

/// Handle a CLI command
///
/// Connects to the store and runs the command inside the configured
/// project's tenant scope.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let coordinator = config.coordinator().await?;

    tenant::scope(config.project(), async {
        match command {
            Commands::Pipeline { command } => {
                pipeline::handle_pipeline_command(command, &coordinator, config).await
            }
            Commands::Node { command } => {
                node::handle_node_command(command, &coordinator, config).await
            }
        }
    })
    .await
}

/// Take the lease of a pipeline on behalf of the operator
///
/// With `stale_after`, a lease whose holder stopped heartbeating for that
/// many seconds is taken over. A live holder makes the command fail.
async fn operator_lease(
    coordinator: &Coordinator,
    pipeline_id: Uuid,
    stale_after: Option<u64>,
) -> Result<LeaseGrant> {
    let owner = OwnerId::generate("cli");
    let leases = coordinator.leases();
    let outcome = match stale_after {
        Some(secs) => {
            leases
                .reclaim_stale(pipeline_id, &owner, stale_timeout(secs)?)
                .await?
        }
        None => leases.claim(pipeline_id, &owner).await?,
    };

    match outcome {
        ClaimOutcome::Claimed(grant) => Ok(grant),
        ClaimOutcome::Denied { current_owner } => {
            let holder = current_owner
                .map(|owner| owner.to_string())
                .unwrap_or_else(|| "another owner".to_string());
            bail!(
                "pipeline {} is held by {}; retry once it is released or pass --stale-after",
                pipeline_id,
                holder
            )
        }
    }
}

/// `--stale-after` seconds as a lease timeout
fn stale_timeout(secs: u64) -> Result<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("--stale-after {} is out of range", secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_timeout_bounds() {
        assert_eq!(stale_timeout(90).unwrap(), chrono::Duration::seconds(90));
        assert!(stale_timeout(u64::MAX).is_err());
        assert!(stale_timeout(i64::MAX as u64).is_err());
    }
}
