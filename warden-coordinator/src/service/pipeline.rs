//! Pipeline state tracker

use chrono::Duration;
use uuid::Uuid;
use warden_core::domain::lease::LeaseGrant;
use warden_core::domain::node::Node;
use warden_core::domain::pipeline::{Pipeline, PipelineStatus};
use warden_core::dto::pipeline::{CreatePipeline, PipelineSummary};

use super::{Coordinator, check_fence};
use crate::error::{CoordinationError, Result, StoreContext};
use crate::repository::{InsertOutcome, WriteFence};

pub struct PipelineTracker<'a> {
    coordinator: &'a Coordinator,
}

impl<'a> PipelineTracker<'a> {
    pub(crate) fn new(coordinator: &'a Coordinator) -> Self {
        Self { coordinator }
    }

    /// Create a pending pipeline with all nodes of its definition
    pub async fn create(&self, req: CreatePipeline) -> Result<(Pipeline, Vec<Node>)> {
        let project = self.coordinator.project()?;
        let kind = self.coordinator.kind();
        if req.kind != kind {
            return Err(CoordinationError::Validation(format!(
                "this coordinator stores {} pipelines, not {}",
                kind, req.kind
            )));
        }
        if req.fingerprint.as_deref().is_some_and(|f| f.trim().is_empty()) {
            return Err(CoordinationError::Validation(
                "fingerprint must not be blank".into(),
            ));
        }

        let repo = self.coordinator.repo();
        if let Some(active) = repo
            .find_active_by_resource(project, req.resource_id)
            .await
            .during("create_pipeline")?
        {
            return Err(CoordinationError::ActivePipelineExists {
                resource_id: req.resource_id,
                pipeline_id: active.id,
            });
        }

        let now = self.coordinator.now();
        let pipeline = Pipeline::new(kind, project, req.resource_id, req.fingerprint, now);
        let nodes = kind.definition().nodes(pipeline.id, now);

        match repo
            .insert_pipeline(&pipeline, &nodes)
            .await
            .during("create_pipeline")?
        {
            InsertOutcome::Inserted => {
                tracing::info!(
                    "Pipeline {} created for resource {} with {} steps",
                    pipeline.id,
                    pipeline.resource_id,
                    nodes.len()
                );
                Ok((pipeline, nodes))
            }
            InsertOutcome::ActiveExists(active) => Err(CoordinationError::ActivePipelineExists {
                resource_id: req.resource_id,
                pipeline_id: active,
            }),
        }
    }

    /// Move a pipeline to `status`, optionally pointing it at a new step
    pub async fn update_status(
        &self,
        lease: &LeaseGrant,
        pipeline_id: Uuid,
        status: PipelineStatus,
        current_step: Option<String>,
    ) -> Result<Pipeline> {
        let project = self.coordinator.project()?;
        let repo = self.coordinator.repo();
        let mut pipeline = self.get(pipeline_id).await?;
        check_fence(&pipeline, lease)?;

        if let Some(step) = current_step.as_deref() {
            if pipeline.kind.definition().step_order(step).is_none() {
                return Err(CoordinationError::Validation(format!(
                    "{} is not a step of {} pipelines",
                    step, pipeline.kind
                )));
            }
        }

        let update = pipeline
            .transition(status, current_step, self.coordinator.now())
            .map_err(|source| CoordinationError::InvalidTransition {
                id: pipeline_id,
                source,
            })?;

        let written = repo
            .update_pipeline(
                project,
                pipeline_id,
                pipeline.status,
                &update,
                &WriteFence::from(lease),
            )
            .await
            .during("update_pipeline_status")?;
        if !written {
            // Re-read to tell a lost lease apart from a concurrent status change
            let current = self.get(pipeline_id).await?;
            check_fence(&current, lease)?;
            return Err(CoordinationError::ConcurrentModification {
                entity: "pipeline",
                id: pipeline_id,
            });
        }

        pipeline.apply(&update);
        tracing::info!(
            "Pipeline {} is now {} (step: {})",
            pipeline_id,
            status,
            pipeline.current_step.as_deref().unwrap_or("-")
        );
        Ok(pipeline)
    }

    pub async fn get(&self, pipeline_id: Uuid) -> Result<Pipeline> {
        let project = self.coordinator.project()?;
        self.coordinator
            .repo()
            .find_pipeline(project, pipeline_id)
            .await
            .during("get_pipeline")?
            .ok_or(CoordinationError::PipelineNotFound(pipeline_id))
    }

    /// Most recently created pipeline for a resource, in any status
    pub async fn get_latest_by_resource(&self, resource_id: Uuid) -> Result<Option<Pipeline>> {
        let project = self.coordinator.project()?;
        self.coordinator
            .repo()
            .find_latest_by_resource(project, resource_id)
            .await
            .during("latest_pipeline")
    }

    /// The pending or running pipeline of a resource, if any
    pub async fn get_active_by_resource(&self, resource_id: Uuid) -> Result<Option<Pipeline>> {
        let project = self.coordinator.project()?;
        self.coordinator
            .repo()
            .find_active_by_resource(project, resource_id)
            .await
            .during("active_pipeline")
    }

    /// Non-terminal pipelines an executor could claim, oldest first
    ///
    /// With `stale_after`, pipelines whose owner stopped heartbeating for
    /// longer than that are included.
    pub async fn list_claimable(
        &self,
        stale_after: Option<Duration>,
        limit: usize,
    ) -> Result<Vec<Pipeline>> {
        let project = self.coordinator.project()?;
        let stale_before = stale_after
            .map(|after| self.coordinator.stale_cutoff(after))
            .transpose()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.coordinator
            .repo()
            .list_claimable(project, stale_before, limit)
            .await
            .during("list_claimable")
    }

    /// Whether a new extraction is needed for `fingerprint`
    ///
    /// False while a run is active, or when the latest completed run saw the
    /// same fingerprint.
    pub async fn needs_extraction(&self, resource_id: Uuid, fingerprint: &str) -> Result<bool> {
        let project = self.coordinator.project()?;
        let repo = self.coordinator.repo();

        if repo
            .find_active_by_resource(project, resource_id)
            .await
            .during("needs_extraction")?
            .is_some()
        {
            return Ok(false);
        }

        let completed = repo
            .find_latest_completed_by_resource(project, resource_id)
            .await
            .during("needs_extraction")?;
        Ok(completed.and_then(|p| p.fingerprint).as_deref() != Some(fingerprint))
    }

    /// Pipeline with node counts
    pub async fn summary(&self, pipeline_id: Uuid) -> Result<PipelineSummary> {
        let pipeline = self.get(pipeline_id).await?;
        let nodes = self.coordinator.nodes().list(pipeline_id).await?;
        Ok(PipelineSummary::new(&pipeline, &nodes))
    }

    /// Delete every pipeline of a resource with its nodes
    pub async fn delete_by_resource(&self, resource_id: Uuid) -> Result<u64> {
        let project = self.coordinator.project()?;
        let deleted = self
            .coordinator
            .repo()
            .delete_by_resource(project, resource_id)
            .await
            .during("delete_by_resource")?;
        tracing::info!("Deleted {} pipelines of resource {}", deleted, resource_id);
        Ok(deleted)
    }
}
