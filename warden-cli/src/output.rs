//! Terminal rendering of pipelines and nodes

use anyhow::Result;
use colored::*;
use serde::Serialize;
use warden_core::domain::node::{Node, NodeStatus};
use warden_core::domain::pipeline::{Pipeline, PipelineStatus};
use warden_core::dto::pipeline::PipelineSummary;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One-block overview of a pipeline
pub fn print_pipeline(pipeline: &Pipeline) {
    println!("  {} Pipeline {}", "▸".cyan(), pipeline.id.to_string().cyan());
    println!("    Kind:       {}", pipeline.kind);
    println!("    Resource:   {}", pipeline.resource_id.to_string().dimmed());
    println!("    Status:     {}", colorize_pipeline_status(&pipeline.status));
    if let Some(step) = &pipeline.current_step {
        println!("    Step:       {}", step);
    }
    if let Some(fingerprint) = &pipeline.fingerprint {
        println!("    Fingerprint: {}", fingerprint.dimmed());
    }
    match &pipeline.lease {
        Some(lease) => println!(
            "    Owner:      {} (heartbeat {}, fence {})",
            lease.owner_id.to_string().yellow(),
            lease.last_heartbeat.format(TIME_FORMAT),
            pipeline.fence_token
        ),
        None => println!("    Owner:      {}", "none".dimmed()),
    }
    println!(
        "    Created:    {}",
        pipeline.created_at.format(TIME_FORMAT).to_string().dimmed()
    );
    if let Some(completed) = pipeline.completed_at {
        println!("    Completed:  {}", completed.format(TIME_FORMAT));
    }
    println!();
}

pub fn print_summary(summary: &PipelineSummary, nodes: &[Node]) {
    println!("{}", "Pipeline Details:".bold());
    println!("  ID:        {}", summary.id.to_string().cyan());
    println!("  Kind:      {}", summary.kind);
    println!("  Resource:  {}", summary.resource_id);
    println!("  Status:    {}", colorize_pipeline_status(&summary.status));
    println!(
        "  Progress:  {}/{} steps completed",
        summary.completed_nodes, summary.total_nodes
    );
    if let Some(owner) = &summary.owner_id {
        println!("  Owner:     {}", owner.to_string().yellow());
    }
    if let Some(heartbeat) = summary.last_heartbeat {
        println!("  Heartbeat: {}", heartbeat.format(TIME_FORMAT));
    }

    println!("\n{}", "Steps:".bold());
    for node in nodes {
        print_node_line(node);
    }
}

pub fn print_node_line(node: &Node) {
    let marker = match node.status {
        NodeStatus::Completed => "✓".green(),
        NodeStatus::Failed | NodeStatus::Exhausted => "✗".red(),
        NodeStatus::Running => "▸".cyan(),
        NodeStatus::Pending => "·".dimmed(),
    };
    let mut line = format!(
        "  {} {:>2}. {:<24} {}",
        marker,
        node.step_order,
        node.step_name,
        colorize_node_status(&node.status)
    );
    if let Some(ms) = node.duration_ms {
        line.push_str(&format!(" {}", format!("{}ms", ms).dimmed()));
    }
    if node.retry_count > 0 {
        line.push_str(&format!(" (retries: {})", node.retry_count));
    }
    println!("{}", line);

    if let Some(progress) = &node.progress {
        let percent = progress
            .fraction()
            .map(|f| format!("{:.0}%", f * 100.0))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "        {} {}/{} {}",
            percent.cyan(),
            progress.current,
            progress.total,
            progress.message.dimmed()
        );
    }
    if let Some(error) = &node.error_message {
        println!("        {}", error.red());
    }
}

pub fn print_node(node: &Node) {
    println!("{}", "Node Details:".bold());
    println!("  ID:        {}", node.id.to_string().cyan());
    println!("  Pipeline:  {}", node.pipeline_id.to_string().dimmed());
    println!("  Step:      {} ({})", node.step_name, node.step_order);
    println!("  Status:    {}", colorize_node_status(&node.status));
    println!("  Retries:   {}", node.retry_count);
    if let Some(started) = node.started_at {
        println!("  Started:   {}", started.format(TIME_FORMAT));
    }
    if let Some(completed) = node.completed_at {
        println!("  Completed: {}", completed.format(TIME_FORMAT));
    }
    if let Some(ms) = node.duration_ms {
        println!("  Duration:  {}ms", ms);
    }
    if let Some(error) = &node.error_message {
        println!("\n{}", "Error:".bold());
        println!("{}", error.red());
    }
}

fn colorize_pipeline_status(status: &PipelineStatus) -> ColoredString {
    match status {
        PipelineStatus::Pending => status.as_str().yellow(),
        PipelineStatus::Running => status.as_str().cyan(),
        PipelineStatus::Completed => status.as_str().green(),
        PipelineStatus::Failed => status.as_str().red(),
    }
}

fn colorize_node_status(status: &NodeStatus) -> ColoredString {
    match status {
        NodeStatus::Pending => status.as_str().yellow(),
        NodeStatus::Running => status.as_str().cyan(),
        NodeStatus::Completed => status.as_str().green(),
        NodeStatus::Failed => status.as_str().red(),
        NodeStatus::Exhausted => status.as_str().red().bold(),
    }
}
