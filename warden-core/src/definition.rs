//! Pipeline definitions
//!
//! Each pipeline kind runs a fixed, ordered list of steps. The list is pure
//! data: the coordinator pre-creates one node per step when a pipeline is
//! created, and the worker maps step names to business logic.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::node::Node;
use crate::domain::pipeline::PipelineKind;

/// Steps of the schema and relationship discovery DAG, in execution order
pub const SCHEMA_DISCOVERY_STEPS: [&str; 7] = [
    "schema_snapshot",
    "column_profiling",
    "key_detection",
    "entity_discovery",
    "relationship_discovery",
    "relationship_validation",
    "finalize",
];

/// Steps of the ontology workflow, in execution order
pub const ONTOLOGY_WORKFLOW_STEPS: [&str; 4] = [
    "entity_extraction",
    "entity_enrichment",
    "relationship_enrichment",
    "ontology_finalize",
];

/// Ordered step list for one pipeline kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineDefinition {
    kind: PipelineKind,
    steps: &'static [&'static str],
}

impl PipelineDefinition {
    pub fn for_kind(kind: PipelineKind) -> Self {
        let steps: &'static [&'static str] = match kind {
            PipelineKind::SchemaDiscovery => &SCHEMA_DISCOVERY_STEPS,
            PipelineKind::OntologyWorkflow => &ONTOLOGY_WORKFLOW_STEPS,
        };
        Self { kind, steps }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn steps(&self) -> &'static [&'static str] {
        self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 1-based order of a step, if it belongs to this definition
    pub fn step_order(&self, name: &str) -> Option<i32> {
        self.steps
            .iter()
            .position(|step| *step == name)
            .map(|idx| idx as i32 + 1)
    }

    /// Step name at a 1-based order
    pub fn step_at(&self, order: i32) -> Option<&'static str> {
        let idx = usize::try_from(order.checked_sub(1)?).ok()?;
        self.steps.get(idx).copied()
    }

    /// One `pending` node per step, ordered 1..N
    pub fn nodes(&self, pipeline_id: Uuid, now: DateTime<Utc>) -> Vec<Node> {
        self.steps
            .iter()
            .enumerate()
            .map(|(idx, step)| Node::new(pipeline_id, *step, idx as i32 + 1, now))
            .collect()
    }
}

impl PipelineKind {
    pub fn definition(&self) -> PipelineDefinition {
        PipelineDefinition::for_kind(*self)
    }
}
