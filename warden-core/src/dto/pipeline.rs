//! Pipeline DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::lease::OwnerId;
use crate::domain::node::{Node, NodeStatus};
use crate::domain::pipeline::{Pipeline, PipelineKind, PipelineStatus};

/// Request to start a new pipeline for a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipeline {
    pub kind: PipelineKind,
    pub resource_id: Uuid,
    /// Content fingerprint of the resource at creation time
    pub fingerprint: Option<String>,
}

/// Pipeline plus node roll-up, for listing and status display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: Uuid,
    pub kind: PipelineKind,
    pub resource_id: Uuid,
    pub status: PipelineStatus,
    pub current_step: Option<String>,
    pub owner_id: Option<OwnerId>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineSummary {
    pub fn new(pipeline: &Pipeline, nodes: &[Node]) -> Self {
        Self {
            id: pipeline.id,
            kind: pipeline.kind,
            resource_id: pipeline.resource_id,
            status: pipeline.status,
            current_step: pipeline.current_step.clone(),
            owner_id: pipeline.owner().cloned(),
            last_heartbeat: pipeline.lease.as_ref().map(|lease| lease.last_heartbeat),
            completed_nodes: nodes
                .iter()
                .filter(|node| node.status == NodeStatus::Completed)
                .count(),
            total_nodes: nodes.len(),
            created_at: pipeline.created_at,
            completed_at: pipeline.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lease::Lease;
    use crate::tenant::ProjectId;

    #[test]
    fn test_summary_counts_completed_nodes() {
        let now = Utc::now();
        let mut pipeline = Pipeline::new(
            PipelineKind::OntologyWorkflow,
            ProjectId::new(Uuid::new_v4()),
            Uuid::new_v4(),
            None,
            now,
        );
        pipeline.lease = Some(Lease {
            owner_id: OwnerId::from("worker-a"),
            last_heartbeat: now,
        });
        let mut nodes = pipeline.kind.definition().nodes(pipeline.id, now);
        nodes[0].status = NodeStatus::Completed;
        nodes[1].status = NodeStatus::Running;

        let summary = PipelineSummary::new(&pipeline, &nodes);
        assert_eq!(summary.completed_nodes, 1);
        assert_eq!(summary.total_nodes, 4);
        assert_eq!(summary.owner_id, Some(OwnerId::from("worker-a")));
        assert_eq!(summary.last_heartbeat, Some(now));
    }
}
