//! Node state tracker

use uuid::Uuid;
use warden_core::domain::error::TransitionError;
use warden_core::domain::lease::LeaseGrant;
use warden_core::domain::node::{Node, NodeProgress, NodeStatus, NodeUpdate};
use warden_core::dto::node::NodeStatusUpdate;
use warden_core::tenant::ProjectId;

use super::{Coordinator, check_fence};
use crate::error::{CoordinationError, Result, StoreContext};
use crate::repository::WriteFence;

/// Result of retrying a failed node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back to `pending` with one more retry counted
    Rescheduled(Node),
    /// Retry ceiling reached; the node is terminal
    Exhausted(Node),
}

impl RetryOutcome {
    pub fn node(&self) -> &Node {
        match self {
            RetryOutcome::Rescheduled(node) | RetryOutcome::Exhausted(node) => node,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryOutcome::Exhausted(_))
    }
}

pub struct NodeTracker<'a> {
    coordinator: &'a Coordinator,
}

impl<'a> NodeTracker<'a> {
    pub(crate) fn new(coordinator: &'a Coordinator) -> Self {
        Self { coordinator }
    }

    /// Insert the nodes of one pipeline
    ///
    /// Nodes must all be `pending`, belong to the same existing pipeline that
    /// has no nodes yet, and carry contiguous orders starting at 1.
    pub async fn create_nodes(&self, nodes: &[Node]) -> Result<()> {
        let project = self.coordinator.project()?;
        let pipeline_id = validate_new_nodes(nodes)?;
        let repo = self.coordinator.repo();

        repo.find_pipeline(project, pipeline_id)
            .await
            .during("create_nodes")?
            .ok_or(CoordinationError::PipelineNotFound(pipeline_id))?;
        let existing = repo
            .list_nodes(project, pipeline_id)
            .await
            .during("create_nodes")?;
        if !existing.is_empty() {
            return Err(CoordinationError::Validation(format!(
                "pipeline {} already has {} nodes",
                pipeline_id,
                existing.len()
            )));
        }
        repo.insert_nodes(project, nodes)
            .await
            .during("create_nodes")?;

        tracing::debug!("Created {} nodes for pipeline {}", nodes.len(), pipeline_id);
        Ok(())
    }

    /// Move a node to `status`
    ///
    /// Moving to `running` also requires every lower-order node to be
    /// completed, checked in the same conditional write.
    pub async fn update_status(
        &self,
        lease: &LeaseGrant,
        node_id: Uuid,
        status: NodeStatus,
        error_message: Option<String>,
    ) -> Result<Node> {
        let project = self.coordinator.project()?;
        let mut node = self.find(project, node_id, "update_node_status").await?;
        ensure_same_pipeline(&node, lease)?;

        let update = node
            .transition(status, error_message, self.coordinator.now())
            .map_err(|source| CoordinationError::InvalidTransition { id: node_id, source })?;
        let require_predecessors = status == NodeStatus::Running;

        self.write(project, &node, &update, lease, require_predecessors)
            .await?;
        node.apply(&update);

        match status {
            NodeStatus::Failed => tracing::warn!(
                "Node {} ({}) failed: {}",
                node.step_name,
                node_id,
                node.error_message.as_deref().unwrap_or("no error message")
            ),
            _ => tracing::debug!("Node {} ({}) is now {}", node.step_name, node_id, status),
        }
        Ok(node)
    }

    /// [`update_status`](Self::update_status) from an executor report
    pub async fn apply(&self, lease: &LeaseGrant, update: NodeStatusUpdate) -> Result<Node> {
        self.update_status(lease, update.node_id, update.status, update.error_message)
            .await
    }

    /// Replace the progress snapshot of a node
    pub async fn update_progress(
        &self,
        lease: &LeaseGrant,
        node_id: Uuid,
        progress: NodeProgress,
    ) -> Result<()> {
        let project = self.coordinator.project()?;
        let written = self
            .coordinator
            .repo()
            .update_node_progress(
                project,
                node_id,
                &progress,
                &WriteFence::from(lease),
                self.coordinator.now(),
            )
            .await
            .during("update_node_progress")?;

        if !written {
            return Err(self.explain_fenced(project, node_id, lease).await);
        }
        Ok(())
    }

    /// Add one to the retry counter, returning the new count
    pub async fn increment_retry_count(&self, lease: &LeaseGrant, node_id: Uuid) -> Result<i32> {
        let project = self.coordinator.project()?;
        let count = self
            .coordinator
            .repo()
            .increment_node_retry(
                project,
                node_id,
                &WriteFence::from(lease),
                self.coordinator.now(),
            )
            .await
            .during("increment_node_retry")?;

        match count {
            Some(count) => Ok(count),
            None => Err(self.explain_fenced(project, node_id, lease).await),
        }
    }

    /// Reschedule a failed node, or mark it exhausted once `retry_count`
    /// reached `max_retries`
    pub async fn retry(
        &self,
        lease: &LeaseGrant,
        node_id: Uuid,
        max_retries: u32,
    ) -> Result<RetryOutcome> {
        let project = self.coordinator.project()?;
        let mut node = self.find(project, node_id, "retry_node").await?;
        ensure_same_pipeline(&node, lease)?;

        let update = node
            .retry(max_retries, self.coordinator.now())
            .map_err(|source| CoordinationError::InvalidTransition { id: node_id, source })?;
        self.write(project, &node, &update, lease, false).await?;
        node.apply(&update);

        if node.status == NodeStatus::Exhausted {
            tracing::warn!(
                "Node {} ({}) exhausted after {} retries",
                node.step_name,
                node_id,
                node.retry_count
            );
            Ok(RetryOutcome::Exhausted(node))
        } else {
            tracing::info!(
                "Node {} ({}) rescheduled, retry {}/{}",
                node.step_name,
                node_id,
                node.retry_count,
                max_retries
            );
            Ok(RetryOutcome::Rescheduled(node))
        }
    }

    /// Lowest-order `pending` node, or `None` when nothing is left to start
    pub async fn get_next_pending_node(&self, pipeline_id: Uuid) -> Result<Option<Node>> {
        self.first_with_status(pipeline_id, NodeStatus::Pending, "next_pending_node")
            .await
    }

    /// Lowest-order `running` node, left behind by an owner that crashed
    pub async fn get_interrupted_node(&self, pipeline_id: Uuid) -> Result<Option<Node>> {
        self.first_with_status(pipeline_id, NodeStatus::Running, "interrupted_node")
            .await
    }

    pub async fn get(&self, node_id: Uuid) -> Result<Node> {
        let project = self.coordinator.project()?;
        self.find(project, node_id, "get_node").await
    }

    /// All nodes of a pipeline in step order
    pub async fn list(&self, pipeline_id: Uuid) -> Result<Vec<Node>> {
        let project = self.coordinator.project()?;
        let repo = self.coordinator.repo();
        let nodes = repo
            .list_nodes(project, pipeline_id)
            .await
            .during("list_nodes")?;
        if nodes.is_empty() {
            self.ensure_pipeline(project, pipeline_id, "list_nodes")
                .await?;
        }
        Ok(nodes)
    }

    async fn first_with_status(
        &self,
        pipeline_id: Uuid,
        status: NodeStatus,
        operation: &'static str,
    ) -> Result<Option<Node>> {
        let project = self.coordinator.project()?;
        let node = self
            .coordinator
            .repo()
            .find_first_node_with_status(project, pipeline_id, status)
            .await
            .during(operation)?;
        if node.is_none() {
            self.ensure_pipeline(project, pipeline_id, operation)
                .await?;
        }
        Ok(node)
    }

    async fn find(&self, project: ProjectId, node_id: Uuid, operation: &'static str) -> Result<Node> {
        self.coordinator
            .repo()
            .find_node(project, node_id)
            .await
            .during(operation)?
            .ok_or(CoordinationError::NodeNotFound(node_id))
    }

    async fn ensure_pipeline(
        &self,
        project: ProjectId,
        pipeline_id: Uuid,
        operation: &'static str,
    ) -> Result<()> {
        self.coordinator
            .repo()
            .find_pipeline(project, pipeline_id)
            .await
            .during(operation)?
            .map(|_| ())
            .ok_or(CoordinationError::PipelineNotFound(pipeline_id))
    }

    /// Conditional node write, classifying a rejected write
    async fn write(
        &self,
        project: ProjectId,
        node: &Node,
        update: &NodeUpdate,
        lease: &LeaseGrant,
        require_predecessors: bool,
    ) -> Result<()> {
        let written = self
            .coordinator
            .repo()
            .update_node(
                project,
                node.id,
                node.status,
                update,
                &WriteFence::from(lease),
                require_predecessors,
            )
            .await
            .during("update_node")?;
        if written {
            return Ok(());
        }

        let repo = self.coordinator.repo();
        let current = self.find(project, node.id, "update_node").await?;
        if current.status != node.status {
            return Err(CoordinationError::InvalidTransition {
                id: node.id,
                source: TransitionError {
                    entity: "node",
                    from: current.status.as_str(),
                    to: update.status.as_str(),
                },
            });
        }

        let pipeline = repo
            .find_pipeline(project, current.pipeline_id)
            .await
            .during("update_node")?
            .ok_or(CoordinationError::PipelineNotFound(current.pipeline_id))?;
        check_fence(&pipeline, lease)?;

        if require_predecessors {
            if let Some(blocker) = repo
                .find_blocking_predecessor(project, &current)
                .await
                .during("update_node")?
            {
                return Err(CoordinationError::PredecessorIncomplete {
                    node_id: current.id,
                    step_order: current.step_order,
                    blocking_order: blocker.step_order,
                    blocking_step: blocker.step_name,
                    blocking_status: blocker.status,
                });
            }
        }

        Err(CoordinationError::ConcurrentModification {
            entity: "node",
            id: node.id,
        })
    }

    /// Error for a rejected fenced write that has no status precondition
    async fn explain_fenced(&self, project: ProjectId, node_id: Uuid, lease: &LeaseGrant) -> CoordinationError {
        let node = match self.find(project, node_id, "update_node").await {
            Ok(node) => node,
            Err(err) => return err,
        };
        let pipeline = match self
            .coordinator
            .repo()
            .find_pipeline(project, node.pipeline_id)
            .await
            .during("update_node")
        {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => return CoordinationError::PipelineNotFound(node.pipeline_id),
            Err(err) => return err,
        };
        match check_fence(&pipeline, lease) {
            Err(err) => err,
            Ok(()) => CoordinationError::ConcurrentModification {
                entity: "node",
                id: node_id,
            },
        }
    }
}

fn ensure_same_pipeline(node: &Node, lease: &LeaseGrant) -> Result<()> {
    if node.pipeline_id == lease.pipeline_id {
        Ok(())
    } else {
        Err(CoordinationError::Validation(format!(
            "node {} belongs to pipeline {}, lease is for {}",
            node.id, node.pipeline_id, lease.pipeline_id
        )))
    }
}

/// Check a batch of new nodes, returning their pipeline
fn validate_new_nodes(nodes: &[Node]) -> Result<Uuid> {
    let Some(first) = nodes.first() else {
        return Err(CoordinationError::Validation("node list is empty".into()));
    };

    if let Some(stray) = nodes.iter().find(|n| n.pipeline_id != first.pipeline_id) {
        return Err(CoordinationError::Validation(format!(
            "node {} belongs to pipeline {}, expected {}",
            stray.id, stray.pipeline_id, first.pipeline_id
        )));
    }
    if let Some(started) = nodes.iter().find(|n| n.status != NodeStatus::Pending) {
        return Err(CoordinationError::Validation(format!(
            "node {} must be created pending, got {}",
            started.step_name, started.status
        )));
    }

    let mut orders: Vec<i32> = nodes.iter().map(|n| n.step_order).collect();
    orders.sort_unstable();
    for (expected, order) in (1..).zip(&orders) {
        if *order != expected {
            return Err(CoordinationError::Validation(format!(
                "step orders must be contiguous from 1, got {:?}",
                orders
            )));
        }
    }

    Ok(first.pipeline_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn nodes(orders: &[i32]) -> Vec<Node> {
        let pipeline_id = Uuid::new_v4();
        orders
            .iter()
            .map(|order| Node::new(pipeline_id, format!("step_{}", order), *order, Utc::now()))
            .collect()
    }

    #[test]
    fn test_validate_accepts_unsorted_contiguous_orders() {
        let batch = nodes(&[2, 1, 3]);
        assert_eq!(validate_new_nodes(&batch).unwrap(), batch[0].pipeline_id);
    }

    #[test]
    fn test_validate_rejects_gaps_and_empty() {
        assert!(matches!(
            validate_new_nodes(&nodes(&[1, 3])),
            Err(CoordinationError::Validation(_))
        ));
        assert!(matches!(
            validate_new_nodes(&nodes(&[0, 1])),
            Err(CoordinationError::Validation(_))
        ));
        assert!(matches!(
            validate_new_nodes(&[]),
            Err(CoordinationError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_mixed_pipelines_and_started_nodes() {
        let mut mixed = nodes(&[1, 2]);
        mixed[1].pipeline_id = Uuid::new_v4();
        assert!(validate_new_nodes(&mixed).is_err());

        let mut started = nodes(&[1, 2]);
        started[0].status = NodeStatus::Running;
        assert!(validate_new_nodes(&started).is_err());
    }
}
