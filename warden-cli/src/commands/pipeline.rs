//! Pipeline command handlers
//!
//! Handles starting runs, inspecting them, and the operator escape hatches:
//! releasing a lease, cancelling a run and tearing down a resource.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use colored::*;
use uuid::Uuid;
use warden_coordinator::Coordinator;
use warden_core::domain::pipeline::{Pipeline, PipelineStatus};
use warden_core::dto::pipeline::CreatePipeline;

use super::{operator_lease, stale_timeout};
use crate::config::Config;
use crate::output::{print_json, print_node_line, print_pipeline, print_summary};

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Start a pipeline for a resource
    Start {
        /// Data source (schema discovery) or ontology (workflow) ID
        resource: Uuid,

        /// Content fingerprint of the resource
        #[arg(short, long)]
        fingerprint: Option<String>,

        /// Start even when the last completed run saw the same fingerprint
        #[arg(long)]
        force: bool,
    },
    /// Show a pipeline with its steps
    Show {
        /// Pipeline ID
        id: Uuid,
    },
    /// Show the most recent pipeline of a resource
    Latest {
        resource: Uuid,
    },
    /// Show the pending or running pipeline of a resource
    Active {
        resource: Uuid,
    },
    /// List pipelines a worker could claim
    Claimable {
        /// Also list pipelines whose owner has been silent this many seconds
        #[arg(long)]
        stale_after: Option<u64>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Check whether a resource needs a new extraction
    NeedsExtraction {
        resource: Uuid,

        /// Current content fingerprint of the resource
        fingerprint: String,
    },
    /// Clear the owner of a pipeline so any worker can pick it up
    Release {
        /// Pipeline ID
        id: Uuid,
    },
    /// Mark a pipeline failed
    Cancel {
        /// Pipeline ID
        id: Uuid,

        /// Take over a lease whose owner has been silent this many seconds
        #[arg(long)]
        stale_after: Option<u64>,
    },
    /// Delete every pipeline of a resource with its steps
    Purge {
        resource: Uuid,

        /// Skip the confirmation check
        #[arg(long)]
        yes: bool,
    },
}

/// Handle pipeline commands
pub async fn handle_pipeline_command(
    command: PipelineCommands,
    coordinator: &Coordinator,
    config: &Config,
) -> Result<()> {
    match command {
        PipelineCommands::Start {
            resource,
            fingerprint,
            force,
        } => start_pipeline(coordinator, config, resource, fingerprint, force).await,
        PipelineCommands::Show { id } => show_pipeline(coordinator, config, id).await,
        PipelineCommands::Latest { resource } => {
            let pipeline = coordinator
                .pipelines()
                .get_latest_by_resource(resource)
                .await?;
            print_optional(config, pipeline, resource)
        }
        PipelineCommands::Active { resource } => {
            let pipeline = coordinator
                .pipelines()
                .get_active_by_resource(resource)
                .await?;
            print_optional(config, pipeline, resource)
        }
        PipelineCommands::Claimable { stale_after, limit } => {
            list_claimable(coordinator, config, stale_after, limit).await
        }
        PipelineCommands::NeedsExtraction {
            resource,
            fingerprint,
        } => {
            let needed = coordinator
                .pipelines()
                .needs_extraction(resource, &fingerprint)
                .await?;
            if config.json {
                print_json(&serde_json::json!({ "needs_extraction": needed }))
            } else if needed {
                println!("{}", "Extraction needed".yellow());
                Ok(())
            } else {
                println!("{}", "Up to date".green());
                Ok(())
            }
        }
        PipelineCommands::Release { id } => {
            coordinator.leases().release(id).await?;
            println!("{} Released pipeline {}", "✓".green(), id);
            Ok(())
        }
        PipelineCommands::Cancel { id, stale_after } => {
            cancel_pipeline(coordinator, id, stale_after).await
        }
        PipelineCommands::Purge { resource, yes } => {
            purge_resource(coordinator, resource, yes).await
        }
    }
}

async fn start_pipeline(
    coordinator: &Coordinator,
    config: &Config,
    resource: Uuid,
    fingerprint: Option<String>,
    force: bool,
) -> Result<()> {
    let pipelines = coordinator.pipelines();

    if let Some(fp) = fingerprint.as_deref().filter(|_| !force) {
        if !pipelines.needs_extraction(resource, fp).await? {
            println!(
                "{}",
                format!(
                    "Resource {} is up to date or already running; use --force to start anyway",
                    resource
                )
                .yellow()
            );
            return Ok(());
        }
    }

    let (pipeline, nodes) = pipelines
        .create(CreatePipeline {
            kind: config.pipeline_kind,
            resource_id: resource,
            fingerprint,
        })
        .await
        .context("Failed to start pipeline")?;

    if config.json {
        return print_json(&pipeline);
    }

    println!("{} Pipeline started", "✓".green());
    print_pipeline(&pipeline);
    for node in &nodes {
        print_node_line(node);
    }
    Ok(())
}

async fn show_pipeline(coordinator: &Coordinator, config: &Config, id: Uuid) -> Result<()> {
    let summary = coordinator.pipelines().summary(id).await?;
    let nodes = coordinator.nodes().list(id).await?;

    if config.json {
        return print_json(&serde_json::json!({ "pipeline": summary, "nodes": nodes }));
    }
    print_summary(&summary, &nodes);
    Ok(())
}

fn print_optional(config: &Config, pipeline: Option<Pipeline>, resource: Uuid) -> Result<()> {
    if config.json {
        return print_json(&pipeline);
    }
    match pipeline {
        Some(pipeline) => print_pipeline(&pipeline),
        None => println!(
            "{}",
            format!("No pipeline found for resource {}.", resource).yellow()
        ),
    }
    Ok(())
}

async fn list_claimable(
    coordinator: &Coordinator,
    config: &Config,
    stale_after: Option<u64>,
    limit: usize,
) -> Result<()> {
    let stale_after = stale_after.map(stale_timeout).transpose()?;
    let pipelines = coordinator
        .pipelines()
        .list_claimable(stale_after, limit)
        .await?;

    if config.json {
        return print_json(&pipelines);
    }
    if pipelines.is_empty() {
        println!("{}", "No claimable pipelines.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} claimable pipeline(s):", pipelines.len()).bold()
        );
        println!();
        for pipeline in &pipelines {
            print_pipeline(pipeline);
        }
    }
    Ok(())
}

async fn cancel_pipeline(
    coordinator: &Coordinator,
    id: Uuid,
    stale_after: Option<u64>,
) -> Result<()> {
    let grant = operator_lease(coordinator, id, stale_after).await?;
    let result = coordinator
        .pipelines()
        .update_status(&grant, id, PipelineStatus::Failed, None)
        .await;
    coordinator.leases().release(id).await?;

    result.context("Failed to cancel pipeline")?;
    println!("{} Pipeline {} marked failed", "✓".green(), id);
    Ok(())
}

async fn purge_resource(coordinator: &Coordinator, resource: Uuid, yes: bool) -> Result<()> {
    let pipelines = coordinator.pipelines();
    if !yes {
        if let Some(active) = pipelines.get_active_by_resource(resource).await? {
            bail!(
                "resource {} has an active pipeline {} ({}); pass --yes to delete it anyway",
                resource,
                active.id,
                active.status
            );
        }
    }

    let deleted = pipelines.delete_by_resource(resource).await?;
    println!(
        "{} Deleted {} pipeline(s) of resource {}",
        "✓".green(),
        deleted,
        resource
    );
    Ok(())
}
