//! Node (pipeline step) domain types
//!
//! State machine per node:
//!
//! ```text
//! pending ──▶ running ──▶ completed
//!               │  ▲
//!               │  └── (resume after a crash)
//!               ▼
//!             failed ──retry──▶ pending
//!               │
//!               └──retry, ceiling reached──▶ exhausted
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::{ParseEnumError, TransitionError};

/// Execution status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Failed and out of retries
    Exhausted,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Exhausted
        )
    }

    fn can_transition_to(&self, to: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (*self, to),
            (Pending, Running) | (Running, Running) | (Running, Completed) | (Running, Failed)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeStatus::Pending),
            "running" => Ok(NodeStatus::Running),
            "completed" => Ok(NodeStatus::Completed),
            "failed" => Ok(NodeStatus::Failed),
            "exhausted" => Ok(NodeStatus::Exhausted),
            other => Err(ParseEnumError::new("node status", other)),
        }
    }
}

/// Partial-completion snapshot reported by a running step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProgress {
    pub current: i64,
    pub total: i64,
    pub message: String,
}

impl NodeProgress {
    pub fn new(current: i64, total: i64, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
        }
    }

    /// Completed share in `[0, 1]`, or `None` when the total is unknown
    pub fn fraction(&self) -> Option<f64> {
        if self.total <= 0 {
            return None;
        }
        Some((self.current as f64 / self.total as f64).clamp(0.0, 1.0))
    }
}

/// One ordered step of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub step_name: String,
    /// 1-based, contiguous and unique within the pipeline
    pub step_order: i32,
    pub status: NodeStatus,
    pub progress: Option<NodeProgress>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field values written by a node transition
///
/// `retry_increment` is applied as a delta so it composes with concurrent
/// unconditional retry-count increments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUpdate {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub retry_increment: i32,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// A fresh `pending` node
    pub fn new(
        pipeline_id: Uuid,
        step_name: impl Into<String>,
        step_order: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            step_name: step_name.into(),
            step_order,
            status: NodeStatus::Pending,
            progress: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Compute the fields written when moving to `to`
    ///
    /// - `running` stamps `started_at` only if unset, so a resumed or retried
    ///   step keeps its original start.
    /// - A terminal status stamps `completed_at` and derives `duration_ms`.
    /// - `error_message` is written only for `failed`, and a `None` never
    ///   clears a message that is already there.
    pub fn transition(
        &self,
        to: NodeStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<NodeUpdate, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(self.invalid(to));
        }

        let started_at = match to {
            NodeStatus::Running => self.started_at.or(Some(now)),
            _ => self.started_at,
        };
        let (completed_at, duration_ms) = if to.is_terminal() {
            (
                Some(now),
                started_at.map(|start| (now - start).num_milliseconds()),
            )
        } else {
            (self.completed_at, self.duration_ms)
        };
        let error_message = match (to, error_message) {
            (NodeStatus::Failed, Some(message)) => Some(message),
            _ => self.error_message.clone(),
        };

        Ok(NodeUpdate {
            status: to,
            started_at,
            completed_at,
            duration_ms,
            error_message,
            retry_increment: 0,
            updated_at: now,
        })
    }

    /// Compute the fields written when a failed node is retried
    ///
    /// Below the ceiling the node goes back to `pending` with one more retry
    /// counted and its completion stamps cleared; at the ceiling it becomes
    /// `exhausted`.
    pub fn retry(&self, max_retries: u32, now: DateTime<Utc>) -> Result<NodeUpdate, TransitionError> {
        if self.status != NodeStatus::Failed {
            return Err(self.invalid(NodeStatus::Pending));
        }

        if i64::from(self.retry_count) >= i64::from(max_retries) {
            return Ok(NodeUpdate {
                status: NodeStatus::Exhausted,
                started_at: self.started_at,
                completed_at: self.completed_at,
                duration_ms: self.duration_ms,
                error_message: self.error_message.clone(),
                retry_increment: 0,
                updated_at: now,
            });
        }

        Ok(NodeUpdate {
            status: NodeStatus::Pending,
            started_at: self.started_at,
            completed_at: None,
            duration_ms: None,
            error_message: self.error_message.clone(),
            retry_increment: 1,
            updated_at: now,
        })
    }

    pub fn apply(&mut self, update: &NodeUpdate) {
        self.status = update.status;
        self.started_at = update.started_at;
        self.completed_at = update.completed_at;
        self.duration_ms = update.duration_ms;
        self.error_message = update.error_message.clone();
        self.retry_count += update.retry_increment;
        self.updated_at = update.updated_at;
    }

    fn invalid(&self, to: NodeStatus) -> TransitionError {
        TransitionError {
            entity: "node",
            from: self.status.as_str(),
            to: to.as_str(),
        }
    }
}
