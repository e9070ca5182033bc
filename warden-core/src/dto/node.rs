//! Node DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::node::NodeStatus;

/// Status change reported by an executor for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusUpdate {
    pub node_id: Uuid,
    pub status: NodeStatus,
    pub error_message: Option<String>,
}

impl NodeStatusUpdate {
    pub fn running(node_id: Uuid) -> Self {
        Self {
            node_id,
            status: NodeStatus::Running,
            error_message: None,
        }
    }

    pub fn completed(node_id: Uuid) -> Self {
        Self {
            node_id,
            status: NodeStatus::Completed,
            error_message: None,
        }
    }

    pub fn failed(node_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            node_id,
            status: NodeStatus::Failed,
            error_message: Some(error.into()),
        }
    }
}
