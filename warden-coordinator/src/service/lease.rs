//! Ownership lease manager

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use warden_core::domain::lease::{ClaimOutcome, LeaseGrant, OwnerId};

use super::{Coordinator, check_fence};
use crate::error::{CoordinationError, Result, StoreContext};

/// Claim, renew and release pipeline ownership
pub struct LeaseManager<'a> {
    coordinator: &'a Coordinator,
}

impl<'a> LeaseManager<'a> {
    pub(crate) fn new(coordinator: &'a Coordinator) -> Self {
        Self { coordinator }
    }

    /// Take ownership if the pipeline is unowned or already ours
    ///
    /// Losing to another owner is `ClaimOutcome::Denied`, not an error.
    pub async fn claim(&self, pipeline_id: Uuid, owner: &OwnerId) -> Result<ClaimOutcome> {
        self.acquire(pipeline_id, owner, None).await
    }

    /// Like [`claim`](Self::claim), but also takes over a lease whose
    /// heartbeat is older than `stale_after`
    pub async fn reclaim_stale(
        &self,
        pipeline_id: Uuid,
        owner: &OwnerId,
        stale_after: Duration,
    ) -> Result<ClaimOutcome> {
        let stale_before = self.coordinator.stale_cutoff(stale_after)?;
        self.acquire(pipeline_id, owner, Some(stale_before)).await
    }

    async fn acquire(
        &self,
        pipeline_id: Uuid,
        owner: &OwnerId,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<ClaimOutcome> {
        let project = self.coordinator.project()?;
        let repo = self.coordinator.repo();
        let now = self.coordinator.now();

        if let Some(grant) = repo
            .try_claim(project, pipeline_id, owner, now, stale_before)
            .await
            .during("claim")?
        {
            tracing::info!(
                "Pipeline {} claimed by {} (fence {})",
                pipeline_id,
                owner,
                grant.fence_token
            );
            return Ok(ClaimOutcome::Claimed(grant));
        }

        let pipeline = repo
            .find_pipeline(project, pipeline_id)
            .await
            .during("claim")?
            .ok_or(CoordinationError::PipelineNotFound(pipeline_id))?;
        let current_owner = pipeline.owner().cloned();

        tracing::debug!(
            "Claim on pipeline {} by {} denied, held by {:?}",
            pipeline_id,
            owner,
            current_owner
        );
        Ok(ClaimOutcome::Denied { current_owner })
    }

    /// Renew the heartbeat; the stored value strictly advances
    pub async fn heartbeat(&self, pipeline_id: Uuid, owner: &OwnerId) -> Result<DateTime<Utc>> {
        let project = self.coordinator.project()?;
        let repo = self.coordinator.repo();

        if let Some(grant) = repo
            .renew_lease(project, pipeline_id, owner, self.coordinator.now())
            .await
            .during("heartbeat")?
        {
            tracing::trace!("Heartbeat for pipeline {} at {}", pipeline_id, grant.heartbeat_at);
            return Ok(grant.heartbeat_at);
        }

        let pipeline = repo
            .find_pipeline(project, pipeline_id)
            .await
            .during("heartbeat")?
            .ok_or(CoordinationError::PipelineNotFound(pipeline_id))?;

        tracing::warn!(
            "Heartbeat by {} rejected, pipeline {} is held by {:?}",
            owner,
            pipeline_id,
            pipeline.owner()
        );
        Err(CoordinationError::OwnershipMismatch {
            pipeline_id,
            owner_id: owner.clone(),
            current_owner: pipeline.owner().cloned(),
        })
    }

    /// Clear ownership unconditionally; the fence token is kept
    pub async fn release(&self, pipeline_id: Uuid) -> Result<()> {
        let project = self.coordinator.project()?;
        let released = self
            .coordinator
            .repo()
            .clear_lease(project, pipeline_id, self.coordinator.now())
            .await
            .during("release")?;

        if !released {
            return Err(CoordinationError::PipelineNotFound(pipeline_id));
        }
        tracing::info!("Pipeline {} released", pipeline_id);
        Ok(())
    }

    /// Check that `grant` still holds the pipeline
    pub async fn verify(&self, grant: &LeaseGrant) -> Result<()> {
        let project = self.coordinator.project()?;
        let pipeline = self
            .coordinator
            .repo()
            .find_pipeline(project, grant.pipeline_id)
            .await
            .during("verify")?
            .ok_or(CoordinationError::PipelineNotFound(grant.pipeline_id))?;
        check_fence(&pipeline, grant)
    }
}
