//! Pipeline domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::{ParseEnumError, TransitionError};
use super::lease::{FenceToken, Lease, OwnerId};
use crate::tenant::ProjectId;

/// The extraction process a pipeline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Schema and relationship discovery DAG over one data source
    SchemaDiscovery,
    /// Ontology workflow over one ontology
    OntologyWorkflow,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 2] = [
        PipelineKind::SchemaDiscovery,
        PipelineKind::OntologyWorkflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::SchemaDiscovery => "schema_discovery",
            PipelineKind::OntologyWorkflow => "ontology_workflow",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema_discovery" | "schema-discovery" | "dag" => Ok(PipelineKind::SchemaDiscovery),
            "ontology_workflow" | "ontology-workflow" | "workflow" => {
                Ok(PipelineKind::OntologyWorkflow)
            }
            other => Err(ParseEnumError::new("pipeline kind", other)),
        }
    }
}

/// Lifecycle status of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }

    /// Pending or running: the pipeline still occupies its resource
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    fn can_transition_to(&self, to: PipelineStatus) -> bool {
        use PipelineStatus::*;
        matches!(
            (*self, to),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PipelineStatus::Pending),
            "running" => Ok(PipelineStatus::Running),
            "completed" => Ok(PipelineStatus::Completed),
            "failed" => Ok(PipelineStatus::Failed),
            other => Err(ParseEnumError::new("pipeline status", other)),
        }
    }
}

/// One run of a multi-step extraction against a single resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub kind: PipelineKind,
    pub project_id: ProjectId,
    /// Data source (schema discovery) or ontology (workflow) this run targets
    pub resource_id: Uuid,
    pub status: PipelineStatus,
    /// Advisory pointer for observability; scheduling uses node status
    pub current_step: Option<String>,
    pub fingerprint: Option<String>,
    pub lease: Option<Lease>,
    pub fence_token: FenceToken,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field values written by a pipeline status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineUpdate {
    pub status: PipelineStatus,
    pub current_step: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// A fresh, unowned pipeline in `pending`
    pub fn new(
        kind: PipelineKind,
        project_id: ProjectId,
        resource_id: Uuid,
        fingerprint: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            project_id,
            resource_id,
            status: PipelineStatus::Pending,
            current_step: None,
            fingerprint,
            lease: None,
            fence_token: FenceToken::default(),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        self.lease.as_ref().map(|lease| &lease.owner_id)
    }

    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        self.owner() == Some(owner)
    }

    /// Compute the fields written when moving to `to`
    ///
    /// `started_at` is stamped on the first move to `running` only; a terminal
    /// status stamps `completed_at`. A missing `current_step` keeps the
    /// existing pointer.
    pub fn transition(
        &self,
        to: PipelineStatus,
        current_step: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PipelineUpdate, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                entity: "pipeline",
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }

        let started_at = match to {
            PipelineStatus::Running => self.started_at.or(Some(now)),
            _ => self.started_at,
        };
        let completed_at = if to.is_terminal() {
            Some(now)
        } else {
            self.completed_at
        };

        Ok(PipelineUpdate {
            status: to,
            current_step: current_step.or_else(|| self.current_step.clone()),
            started_at,
            completed_at,
            updated_at: now,
        })
    }

    pub fn apply(&mut self, update: &PipelineUpdate) {
        self.status = update.status;
        self.current_step = update.current_step.clone();
        self.started_at = update.started_at;
        self.completed_at = update.completed_at;
        self.updated_at = update.updated_at;
    }
}
