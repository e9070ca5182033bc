//! Node command handlers

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use uuid::Uuid;
use warden_coordinator::{Coordinator, RetryOutcome};

use super::operator_lease;
use crate::config::Config;
use crate::output::{print_json, print_node, print_node_line};

/// Node subcommands
#[derive(Subcommand)]
pub enum NodeCommands {
    /// List the steps of a pipeline in order
    List {
        /// Pipeline ID
        pipeline_id: Uuid,
    },
    /// Get node details
    Get {
        /// Node ID
        id: Uuid,
    },
    /// Show the interrupted or next pending step
    Next {
        /// Pipeline ID
        pipeline_id: Uuid,
    },
    /// Reschedule a failed node
    Retry {
        /// Node ID
        id: Uuid,

        /// Mark the node exhausted once it was retried this many times
        #[arg(long, default_value = "3")]
        max_retries: u32,

        /// Take over a lease whose owner has been silent this many seconds
        #[arg(long)]
        stale_after: Option<u64>,
    },
}

/// Handle node commands
pub async fn handle_node_command(
    command: NodeCommands,
    coordinator: &Coordinator,
    config: &Config,
) -> Result<()> {
    match command {
        NodeCommands::List { pipeline_id } => {
            let nodes = coordinator.nodes().list(pipeline_id).await?;
            if config.json {
                return print_json(&nodes);
            }
            println!("{}", format!("Steps of pipeline {}:", pipeline_id).bold());
            for node in &nodes {
                print_node_line(node);
            }
            Ok(())
        }
        NodeCommands::Get { id } => {
            let node = coordinator.nodes().get(id).await?;
            if config.json {
                return print_json(&node);
            }
            print_node(&node);
            Ok(())
        }
        NodeCommands::Next { pipeline_id } => next_node(coordinator, config, pipeline_id).await,
        NodeCommands::Retry {
            id,
            max_retries,
            stale_after,
        } => retry_node(coordinator, id, max_retries, stale_after).await,
    }
}

/// An interrupted step resumes before any pending one
async fn next_node(coordinator: &Coordinator, config: &Config, pipeline_id: Uuid) -> Result<()> {
    let nodes = coordinator.nodes();
    let next = match nodes.get_interrupted_node(pipeline_id).await? {
        Some(node) => Some(node),
        None => nodes.get_next_pending_node(pipeline_id).await?,
    };

    if config.json {
        return print_json(&next);
    }
    match next {
        Some(node) => print_node_line(&node),
        None => println!("{}", "Nothing left to run.".yellow()),
    }
    Ok(())
}

async fn retry_node(
    coordinator: &Coordinator,
    id: Uuid,
    max_retries: u32,
    stale_after: Option<u64>,
) -> Result<()> {
    let node = coordinator.nodes().get(id).await?;
    let grant = operator_lease(coordinator, node.pipeline_id, stale_after).await?;
    let result = coordinator.nodes().retry(&grant, id, max_retries).await;
    coordinator.leases().release(node.pipeline_id).await?;

    match result.context("Failed to retry node")? {
        RetryOutcome::Rescheduled(node) => println!(
            "{} Node {} rescheduled (retry {}/{})",
            "✓".green(),
            node.step_name,
            node.retry_count,
            max_retries
        ),
        RetryOutcome::Exhausted(node) => println!(
            "{} Node {} is out of retries after {} attempts",
            "✗".red(),
            node.step_name,
            node.retry_count
        ),
    }
    Ok(())
}
