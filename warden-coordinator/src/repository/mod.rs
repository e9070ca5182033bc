//! Repository Module
//!
//! Store access for pipelines, their nodes and their leases. Every method is
//! filtered by project; conditional writes return `false`/`None` when their
//! guard did not match and leave classification to the service layer.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryPipelineRepository;
pub use postgres::{PgPipelineRepository, TableSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use warden_core::domain::lease::{FenceToken, LeaseGrant, OwnerId};
use warden_core::domain::node::{Node, NodeProgress, NodeStatus, NodeUpdate};
use warden_core::domain::pipeline::{Pipeline, PipelineKind, PipelineStatus, PipelineUpdate};
use warden_core::tenant::ProjectId;

use crate::error::StoreResult;

/// Owner and token a write must still match on the pipeline row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFence {
    pub owner_id: OwnerId,
    pub token: FenceToken,
}

impl From<&LeaseGrant> for WriteFence {
    fn from(grant: &LeaseGrant) -> Self {
        Self {
            owner_id: grant.owner_id.clone(),
            token: grant.fence_token,
        }
    }
}

impl WriteFence {
    pub fn admits(&self, pipeline: &Pipeline) -> bool {
        pipeline.is_owned_by(&self.owner_id) && pipeline.fence_token == self.token
    }
}

/// Result of inserting a new pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another pending or running pipeline already holds the resource
    ActiveExists(Uuid),
}

#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Pipeline kind whose records this repository stores
    fn kind(&self) -> PipelineKind;

    /// Insert a pipeline and its nodes as one atomic write
    async fn insert_pipeline(&self, pipeline: &Pipeline, nodes: &[Node])
    -> StoreResult<InsertOutcome>;

    async fn find_pipeline(&self, project: ProjectId, id: Uuid) -> StoreResult<Option<Pipeline>>;

    async fn find_latest_by_resource(
        &self,
        project: ProjectId,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>>;

    async fn find_active_by_resource(
        &self,
        project: ProjectId,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>>;

    async fn find_latest_completed_by_resource(
        &self,
        project: ProjectId,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>>;

    /// Non-terminal pipelines that are unowned, or whose heartbeat is older
    /// than `stale_before`, oldest first
    async fn list_claimable(
        &self,
        project: ProjectId,
        stale_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> StoreResult<Vec<Pipeline>>;

    /// Apply `update` if the pipeline is still in `expected` and `fence` holds
    async fn update_pipeline(
        &self,
        project: ProjectId,
        id: Uuid,
        expected: PipelineStatus,
        update: &PipelineUpdate,
        fence: &WriteFence,
    ) -> StoreResult<bool>;

    /// Delete every pipeline of a resource together with its nodes
    async fn delete_by_resource(&self, project: ProjectId, resource_id: Uuid) -> StoreResult<u64>;

    /// Take the lease if it is free, already ours, or older than `stale_before`
    ///
    /// The fence token moves forward only when the owner changes.
    async fn try_claim(
        &self,
        project: ProjectId,
        id: Uuid,
        owner: &OwnerId,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<LeaseGrant>>;

    /// Move the heartbeat strictly forward if `owner` holds the lease
    async fn renew_lease(
        &self,
        project: ProjectId,
        id: Uuid,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LeaseGrant>>;

    /// Clear owner and heartbeat; `false` when the pipeline does not exist
    async fn clear_lease(&self, project: ProjectId, id: Uuid, now: DateTime<Utc>)
    -> StoreResult<bool>;

    async fn insert_nodes(&self, project: ProjectId, nodes: &[Node]) -> StoreResult<()>;

    async fn find_node(&self, project: ProjectId, node_id: Uuid) -> StoreResult<Option<Node>>;

    /// All nodes of a pipeline ordered by `step_order`
    async fn list_nodes(&self, project: ProjectId, pipeline_id: Uuid) -> StoreResult<Vec<Node>>;

    /// Lowest-order node of the pipeline in `status`
    async fn find_first_node_with_status(
        &self,
        project: ProjectId,
        pipeline_id: Uuid,
        status: NodeStatus,
    ) -> StoreResult<Option<Node>>;

    /// Lowest-order node before `node` that is not completed
    async fn find_blocking_predecessor(
        &self,
        project: ProjectId,
        node: &Node,
    ) -> StoreResult<Option<Node>>;

    /// Apply `update` if the node is still in `expected`, `fence` holds and,
    /// when `require_predecessors` is set, every lower-order node is completed
    async fn update_node(
        &self,
        project: ProjectId,
        node_id: Uuid,
        expected: NodeStatus,
        update: &NodeUpdate,
        fence: &WriteFence,
        require_predecessors: bool,
    ) -> StoreResult<bool>;

    async fn update_node_progress(
        &self,
        project: ProjectId,
        node_id: Uuid,
        progress: &NodeProgress,
        fence: &WriteFence,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Add one to `retry_count`, returning the new value
    async fn increment_node_retry(
        &self,
        project: ProjectId,
        node_id: Uuid,
        fence: &WriteFence,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i32>>;
}
