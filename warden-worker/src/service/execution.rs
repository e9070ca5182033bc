//! Execution service
//!
//! Runs the work of a single pipeline step and reports progress while doing
//! so.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;
use warden_coordinator::{CoordinationError, Coordinator};
use warden_core::domain::lease::LeaseGrant;
use warden_core::domain::node::NodeProgress;
use warden_core::domain::pipeline::PipelineKind;

/// Service trait for executing pipeline steps
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Executes one step
    ///
    /// An `Err` marks the step failed; its message is stored on the node.
    async fn execute_step(&self, step: &StepContext) -> Result<()>;
}

/// Everything a step needs to know about the run it belongs to
#[derive(Debug, Clone)]
pub struct StepContext {
    pub pipeline_id: Uuid,
    pub kind: PipelineKind,
    pub resource_id: Uuid,
    pub node_id: Uuid,
    pub step_name: String,
    pub step_order: i32,
    /// Retries already spent on this step
    pub attempt: i32,
    pub progress: ProgressReporter,
}

/// Writes progress snapshots for one node under the worker's lease
#[derive(Clone)]
pub struct ProgressReporter {
    coordinator: Coordinator,
    grant: LeaseGrant,
    node_id: Uuid,
}

impl ProgressReporter {
    pub fn new(coordinator: Coordinator, grant: LeaseGrant, node_id: Uuid) -> Self {
        Self {
            coordinator,
            grant,
            node_id,
        }
    }

    /// Must run inside the pipeline's tenant scope
    pub async fn report(
        &self,
        current: i64,
        total: i64,
        message: impl Into<String>,
    ) -> Result<(), CoordinationError> {
        self.coordinator
            .nodes()
            .update_progress(&self.grant, self.node_id, NodeProgress::new(current, total, message))
            .await
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("pipeline_id", &self.grant.pipeline_id)
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// Executor that only logs each step and reports it done
///
/// Stands in for the extraction code when the worker runs on its own.
pub struct TracingStepExecutor {
    step_delay: Duration,
}

impl TracingStepExecutor {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl Default for TracingStepExecutor {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[async_trait]
impl StepExecutor for TracingStepExecutor {
    async fn execute_step(&self, step: &StepContext) -> Result<()> {
        info!(
            "Executing step {} ({}) of {} pipeline {} for resource {}, attempt {}",
            step.step_order,
            step.step_name,
            step.kind,
            step.pipeline_id,
            step.resource_id,
            step.attempt + 1
        );
        debug!("Step node: {}", step.node_id);

        step.progress.report(0, 1, format!("{} started", step.step_name)).await?;
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        step.progress.report(1, 1, format!("{} done", step.step_name)).await?;
        Ok(())
    }
}
