//! Service Layer
//!
//! Coordination rules on top of a [`PipelineRepository`]. Each operation reads
//! the project from the active tenant scope.

pub mod lease;
pub mod node;
pub mod pipeline;

pub use lease::LeaseManager;
pub use node::{NodeTracker, RetryOutcome};
pub use pipeline::PipelineTracker;

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use warden_core::clock::{Clock, SystemClock};
use warden_core::domain::lease::LeaseGrant;
use warden_core::domain::pipeline::{Pipeline, PipelineKind};
use warden_core::tenant::{self, ProjectId};

use crate::error::{CoordinationError, Result};
use crate::repository::{PipelineRepository, WriteFence};

/// Entry point to the lease manager and the two state trackers
#[derive(Clone)]
pub struct Coordinator {
    repository: Arc<dyn PipelineRepository>,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    pub fn new(repository: Arc<dyn PipelineRepository>) -> Self {
        Self::with_clock(repository, Arc::new(SystemClock))
    }

    pub fn with_clock(repository: Arc<dyn PipelineRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    pub fn kind(&self) -> PipelineKind {
        self.repository.kind()
    }

    pub fn leases(&self) -> LeaseManager<'_> {
        LeaseManager::new(self)
    }

    pub fn nodes(&self) -> NodeTracker<'_> {
        NodeTracker::new(self)
    }

    pub fn pipelines(&self) -> PipelineTracker<'_> {
        PipelineTracker::new(self)
    }

    pub(crate) fn repo(&self) -> &dyn PipelineRepository {
        self.repository.as_ref()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn project(&self) -> Result<ProjectId> {
        tenant::current().ok_or(CoordinationError::MissingTenantScope)
    }

    /// Heartbeats older than the returned instant count as stale
    ///
    /// `stale_after` must be positive and small enough to subtract from now.
    pub(crate) fn stale_cutoff(&self, stale_after: Duration) -> Result<DateTime<Utc>> {
        if stale_after <= Duration::zero() {
            return Err(CoordinationError::Validation(format!(
                "stale lease timeout must be positive, got {}s",
                stale_after.num_seconds()
            )));
        }
        self.now().checked_sub_signed(stale_after).ok_or_else(|| {
            CoordinationError::Validation(format!(
                "stale lease timeout of {}s is out of range",
                stale_after.num_seconds()
            ))
        })
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("kind", &self.kind())
            .field("clock", &self.clock)
            .finish()
    }
}

/// `LeaseFenced` unless `grant` still matches the pipeline's lease
pub(crate) fn check_fence(pipeline: &Pipeline, grant: &LeaseGrant) -> Result<()> {
    if WriteFence::from(grant).admits(pipeline) {
        Ok(())
    } else {
        Err(CoordinationError::LeaseFenced {
            pipeline_id: pipeline.id,
            owner_id: grant.owner_id.clone(),
            fence_token: grant.fence_token,
        })
    }
}
