//! In-memory repository
//!
//! Single mutex around the whole state, so every method is one atomic step
//! just like a conditional statement in the shared store. Used by tests and
//! by single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;
use warden_core::domain::lease::{Lease, LeaseGrant, OwnerId, next_heartbeat};
use warden_core::domain::node::{Node, NodeProgress, NodeStatus, NodeUpdate};
use warden_core::domain::pipeline::{Pipeline, PipelineKind, PipelineStatus, PipelineUpdate};
use warden_core::tenant::ProjectId;

use super::{InsertOutcome, PipelineRepository, WriteFence};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct State {
    pipelines: HashMap<Uuid, Pipeline>,
    nodes: HashMap<Uuid, Node>,
}

impl State {
    fn pipeline(&self, project: ProjectId, id: Uuid) -> Option<&Pipeline> {
        self.pipelines.get(&id).filter(|p| p.project_id == project)
    }

    fn pipeline_mut(&mut self, project: ProjectId, id: Uuid) -> Option<&mut Pipeline> {
        self.pipelines
            .get_mut(&id)
            .filter(|p| p.project_id == project)
    }

    fn node(&self, project: ProjectId, node_id: Uuid) -> Option<&Node> {
        self.nodes
            .get(&node_id)
            .filter(|n| self.pipeline(project, n.pipeline_id).is_some())
    }

    fn nodes_of(&self, pipeline_id: Uuid) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.pipeline_id == pipeline_id)
            .collect();
        nodes.sort_by_key(|n| n.step_order);
        nodes
    }

    fn by_resource(&self, project: ProjectId, resource_id: Uuid) -> Vec<&Pipeline> {
        let mut pipelines: Vec<&Pipeline> = self
            .pipelines
            .values()
            .filter(|p| p.project_id == project && p.resource_id == resource_id)
            .collect();
        pipelines.sort_by_key(|p| std::cmp::Reverse(p.created_at));
        pipelines
    }

    fn fence_holds(&self, project: ProjectId, pipeline_id: Uuid, fence: &WriteFence) -> bool {
        self.pipeline(project, pipeline_id)
            .is_some_and(|p| fence.admits(p))
    }

    fn blocking_predecessor(&self, node: &Node) -> Option<&Node> {
        self.nodes_of(node.pipeline_id)
            .into_iter()
            .find(|n| n.step_order < node.step_order && n.status != NodeStatus::Completed)
    }
}

/// Repository holding all records in process memory
#[derive(Debug, Clone)]
pub struct InMemoryPipelineRepository {
    kind: PipelineKind,
    state: Arc<Mutex<State>>,
}

impl InMemoryPipelineRepository {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn grant_of(pipeline: &Pipeline) -> Option<LeaseGrant> {
    pipeline.lease.as_ref().map(|lease| LeaseGrant {
        pipeline_id: pipeline.id,
        owner_id: lease.owner_id.clone(),
        fence_token: pipeline.fence_token,
        heartbeat_at: lease.last_heartbeat,
    })
}

#[async_trait]
impl PipelineRepository for InMemoryPipelineRepository {
    fn kind(&self) -> PipelineKind {
        self.kind
    }

    async fn insert_pipeline(
        &self,
        pipeline: &Pipeline,
        nodes: &[Node],
    ) -> StoreResult<InsertOutcome> {
        let mut state = self.lock();
        if let Some(active) = state
            .by_resource(pipeline.project_id, pipeline.resource_id)
            .into_iter()
            .find(|p| p.status.is_active())
        {
            return Ok(InsertOutcome::ActiveExists(active.id));
        }

        state.pipelines.insert(pipeline.id, pipeline.clone());
        for node in nodes {
            state.nodes.insert(node.id, node.clone());
        }
        Ok(InsertOutcome::Inserted)
    }

    async fn find_pipeline(&self, project: ProjectId, id: Uuid) -> StoreResult<Option<Pipeline>> {
        Ok(self.lock().pipeline(project, id).cloned())
    }

    async fn find_latest_by_resource(
        &self,
        project: ProjectId,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>> {
        Ok(self
            .lock()
            .by_resource(project, resource_id)
            .first()
            .map(|p| (*p).clone()))
    }

    async fn find_active_by_resource(
        &self,
        project: ProjectId,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>> {
        Ok(self
            .lock()
            .by_resource(project, resource_id)
            .into_iter()
            .find(|p| p.status.is_active())
            .cloned())
    }

    async fn find_latest_completed_by_resource(
        &self,
        project: ProjectId,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>> {
        Ok(self
            .lock()
            .by_resource(project, resource_id)
            .into_iter()
            .find(|p| p.status == PipelineStatus::Completed)
            .cloned())
    }

    async fn list_claimable(
        &self,
        project: ProjectId,
        stale_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> StoreResult<Vec<Pipeline>> {
        let state = self.lock();
        let mut claimable: Vec<Pipeline> = state
            .pipelines
            .values()
            .filter(|p| p.project_id == project && p.status.is_active())
            .filter(|p| match (&p.lease, stale_before) {
                (None, _) => true,
                (Some(lease), Some(cutoff)) => lease.last_heartbeat < cutoff,
                (Some(_), None) => false,
            })
            .cloned()
            .collect();
        claimable.sort_by_key(|p| p.created_at);
        claimable.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(claimable)
    }

    async fn update_pipeline(
        &self,
        project: ProjectId,
        id: Uuid,
        expected: PipelineStatus,
        update: &PipelineUpdate,
        fence: &WriteFence,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        match state.pipeline_mut(project, id) {
            Some(pipeline) if pipeline.status == expected && fence.admits(pipeline) => {
                pipeline.apply(update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_resource(&self, project: ProjectId, resource_id: Uuid) -> StoreResult<u64> {
        let mut state = self.lock();
        let doomed: Vec<Uuid> = state
            .by_resource(project, resource_id)
            .into_iter()
            .map(|p| p.id)
            .collect();
        for id in &doomed {
            state.pipelines.remove(id);
        }
        state.nodes.retain(|_, n| !doomed.contains(&n.pipeline_id));
        Ok(doomed.len() as u64)
    }

    async fn try_claim(
        &self,
        project: ProjectId,
        id: Uuid,
        owner: &OwnerId,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<LeaseGrant>> {
        let mut state = self.lock();
        let Some(pipeline) = state.pipeline_mut(project, id) else {
            return Ok(None);
        };

        let same_owner = pipeline.is_owned_by(owner);
        let claimable = match (&pipeline.lease, stale_before) {
            (None, _) => true,
            (Some(_), _) if same_owner => true,
            (Some(lease), Some(cutoff)) => lease.last_heartbeat < cutoff,
            (Some(_), None) => false,
        };
        if !claimable {
            return Ok(None);
        }

        if !same_owner {
            pipeline.fence_token = pipeline.fence_token.next();
        }
        pipeline.lease = Some(Lease {
            owner_id: owner.clone(),
            last_heartbeat: now,
        });
        pipeline.updated_at = now;
        Ok(grant_of(pipeline))
    }

    async fn renew_lease(
        &self,
        project: ProjectId,
        id: Uuid,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LeaseGrant>> {
        let mut state = self.lock();
        let Some(pipeline) = state.pipeline_mut(project, id) else {
            return Ok(None);
        };
        match pipeline.lease.as_mut() {
            Some(lease) if &lease.owner_id == owner => {
                lease.last_heartbeat = next_heartbeat(lease.last_heartbeat, now);
                pipeline.updated_at = now;
                Ok(grant_of(pipeline))
            }
            _ => Ok(None),
        }
    }

    async fn clear_lease(
        &self,
        project: ProjectId,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        match state.pipeline_mut(project, id) {
            Some(pipeline) => {
                pipeline.lease = None;
                pipeline.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_nodes(&self, project: ProjectId, nodes: &[Node]) -> StoreResult<()> {
        let mut state = self.lock();
        let nodes: Vec<Node> = nodes
            .iter()
            .filter(|n| state.pipeline(project, n.pipeline_id).is_some())
            .cloned()
            .collect();

        // Mirrors the primary key and UNIQUE (pipeline_id, step_order)
        let mut taken: HashSet<(Uuid, i32)> = state
            .nodes
            .values()
            .map(|n| (n.pipeline_id, n.step_order))
            .collect();
        for node in &nodes {
            if state.nodes.contains_key(&node.id) {
                return Err(StoreError::Conflict(format!("node {} already exists", node.id)));
            }
            if !taken.insert((node.pipeline_id, node.step_order)) {
                return Err(StoreError::Conflict(format!(
                    "pipeline {} already has a node with order {}",
                    node.pipeline_id, node.step_order
                )));
            }
        }

        for node in nodes {
            state.nodes.insert(node.id, node);
        }
        Ok(())
    }

    async fn find_node(&self, project: ProjectId, node_id: Uuid) -> StoreResult<Option<Node>> {
        Ok(self.lock().node(project, node_id).cloned())
    }

    async fn list_nodes(&self, project: ProjectId, pipeline_id: Uuid) -> StoreResult<Vec<Node>> {
        let state = self.lock();
        if state.pipeline(project, pipeline_id).is_none() {
            return Ok(Vec::new());
        }
        Ok(state.nodes_of(pipeline_id).into_iter().cloned().collect())
    }

    async fn find_first_node_with_status(
        &self,
        project: ProjectId,
        pipeline_id: Uuid,
        status: NodeStatus,
    ) -> StoreResult<Option<Node>> {
        let state = self.lock();
        if state.pipeline(project, pipeline_id).is_none() {
            return Ok(None);
        }
        Ok(state
            .nodes_of(pipeline_id)
            .into_iter()
            .find(|n| n.status == status)
            .cloned())
    }

    async fn find_blocking_predecessor(
        &self,
        project: ProjectId,
        node: &Node,
    ) -> StoreResult<Option<Node>> {
        let state = self.lock();
        if state.pipeline(project, node.pipeline_id).is_none() {
            return Ok(None);
        }
        Ok(state.blocking_predecessor(node).cloned())
    }

    async fn update_node(
        &self,
        project: ProjectId,
        node_id: Uuid,
        expected: NodeStatus,
        update: &NodeUpdate,
        fence: &WriteFence,
        require_predecessors: bool,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(node) = state.node(project, node_id) else {
            return Ok(false);
        };
        if node.status != expected
            || !state.fence_holds(project, node.pipeline_id, fence)
            || (require_predecessors && state.blocking_predecessor(node).is_some())
        {
            return Ok(false);
        }

        if let Some(node) = state.nodes.get_mut(&node_id) {
            node.apply(update);
        }
        Ok(true)
    }

    async fn update_node_progress(
        &self,
        project: ProjectId,
        node_id: Uuid,
        progress: &NodeProgress,
        fence: &WriteFence,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let admitted = state
            .node(project, node_id)
            .is_some_and(|n| state.fence_holds(project, n.pipeline_id, fence));
        if !admitted {
            return Ok(false);
        }
        if let Some(node) = state.nodes.get_mut(&node_id) {
            node.progress = Some(progress.clone());
            node.updated_at = now;
        }
        Ok(true)
    }

    async fn increment_node_retry(
        &self,
        project: ProjectId,
        node_id: Uuid,
        fence: &WriteFence,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i32>> {
        let mut state = self.lock();
        let admitted = state
            .node(project, node_id)
            .is_some_and(|n| state.fence_holds(project, n.pipeline_id, fence));
        if !admitted {
            return Ok(None);
        }
        Ok(state.nodes.get_mut(&node_id).map(|node| {
            node.retry_count += 1;
            node.updated_at = now;
            node.retry_count
        }))
    }
}
