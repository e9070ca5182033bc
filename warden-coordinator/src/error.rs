//! Coordination errors

use thiserror::Error;
use uuid::Uuid;
use warden_core::domain::error::TransitionError;
use warden_core::domain::lease::{FenceToken, OwnerId};
use warden_core::domain::node::NodeStatus;

/// Failure inside a store adapter
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded into a domain value
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// A write collided with a uniqueness constraint
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("no project scope is active")]
    MissingTenantScope,

    #[error("pipeline not found: {0}")]
    PipelineNotFound(Uuid),

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("invalid transition on {id}: {source}")]
    InvalidTransition {
        id: Uuid,
        #[source]
        source: TransitionError,
    },

    #[error(
        "node {node_id} (order {step_order}) cannot start: step {blocking_order} ({blocking_step}) is {blocking_status}"
    )]
    PredecessorIncomplete {
        node_id: Uuid,
        step_order: i32,
        blocking_order: i32,
        blocking_step: String,
        blocking_status: NodeStatus,
    },

    #[error("resource {resource_id} already has active pipeline {pipeline_id}")]
    ActivePipelineExists { resource_id: Uuid, pipeline_id: Uuid },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("pipeline {pipeline_id} is not owned by {owner_id}")]
    OwnershipMismatch {
        pipeline_id: Uuid,
        owner_id: OwnerId,
        current_owner: Option<OwnerId>,
    },

    #[error("lease {fence_token} of {owner_id} on pipeline {pipeline_id} has been superseded")]
    LeaseFenced {
        pipeline_id: Uuid,
        owner_id: OwnerId,
        fence_token: FenceToken,
    },

    /// A conditional write lost a race with a concurrent writer
    #[error("{entity} {id} was modified concurrently")]
    ConcurrentModification { entity: &'static str, id: Uuid },

    #[error("store failure during {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

impl CoordinationError {
    /// The caller no longer holds the pipeline and must stop writing to it
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            CoordinationError::OwnershipMismatch { .. } | CoordinationError::LeaseFenced { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Attach the failing operation name to a store error
pub(crate) trait StoreContext<T> {
    fn during(self, operation: &'static str) -> Result<T>;
}

impl<T> StoreContext<T> for StoreResult<T> {
    fn during(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| CoordinationError::Store { operation, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_context_names_operation() {
        let failed: StoreResult<()> = Err(StoreError::Corrupt("status 'paused'".into()));
        let err = failed.during("claim").unwrap_err();
        assert_eq!(
            err.to_string(),
            "store failure during claim: corrupt row: status 'paused'"
        );
    }

    #[test]
    fn test_lease_lost_classification() {
        let fenced = CoordinationError::LeaseFenced {
            pipeline_id: Uuid::new_v4(),
            owner_id: OwnerId::from("worker-a"),
            fence_token: FenceToken(2),
        };
        assert!(fenced.is_lease_lost());
        assert!(!CoordinationError::MissingTenantScope.is_lease_lost());
    }
}
