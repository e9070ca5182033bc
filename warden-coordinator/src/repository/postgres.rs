//! PostgreSQL repository
//!
//! Both pipeline kinds share one layout; a [`TableSet`] names the tables and
//! the kind-specific columns. Every statement runs in a transaction that sets
//! `app.current_project` so row-level security policies apply.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;
use warden_core::domain::lease::{FenceToken, Lease, LeaseGrant, OwnerId};
use warden_core::domain::node::{Node, NodeProgress, NodeStatus, NodeUpdate};
use warden_core::domain::pipeline::{Pipeline, PipelineKind, PipelineStatus, PipelineUpdate};
use warden_core::tenant::ProjectId;

use super::{InsertOutcome, PipelineRepository, WriteFence};
use crate::error::{StoreError, StoreResult};

/// Table and column names of one persisted pipeline shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSet {
    pub kind: PipelineKind,
    pub pipelines: &'static str,
    pub nodes: &'static str,
    pub resource_column: &'static str,
    pub fingerprint_column: &'static str,
}

impl TableSet {
    pub const EXTRACTION_DAGS: TableSet = TableSet {
        kind: PipelineKind::SchemaDiscovery,
        pipelines: "extraction_dags",
        nodes: "extraction_dag_nodes",
        resource_column: "datasource_id",
        fingerprint_column: "schema_fingerprint",
    };

    pub const ONTOLOGY_WORKFLOWS: TableSet = TableSet {
        kind: PipelineKind::OntologyWorkflow,
        pipelines: "ontology_workflows",
        nodes: "ontology_workflow_nodes",
        resource_column: "ontology_id",
        fingerprint_column: "config_fingerprint",
    };

    pub const ALL: [TableSet; 2] = [TableSet::EXTRACTION_DAGS, TableSet::ONTOLOGY_WORKFLOWS];

    pub const fn for_kind(kind: PipelineKind) -> TableSet {
        match kind {
            PipelineKind::SchemaDiscovery => TableSet::EXTRACTION_DAGS,
            PipelineKind::OntologyWorkflow => TableSet::ONTOLOGY_WORKFLOWS,
        }
    }

    /// Partial unique index allowing one pending or running pipeline per resource
    pub fn active_index(&self) -> String {
        format!("{}_one_active", self.pipelines)
    }

    fn pipeline_columns(&self) -> String {
        format!(
            "id, project_id, {res} AS resource_id, status, current_step, \
             {fp} AS fingerprint, owner_id, last_heartbeat, fence_token, \
             started_at, completed_at, created_at, updated_at",
            res = self.resource_column,
            fp = self.fingerprint_column,
        )
    }
}

const NODE_COLUMNS: &str = "n.id, n.pipeline_id, n.step_name, n.step_order, n.status, \
    n.progress, n.started_at, n.completed_at, n.duration_ms, n.error_message, \
    n.retry_count, n.created_at, n.updated_at";

const LEASE_COLUMNS: &str = "id, owner_id, last_heartbeat, fence_token";

/// Repository over one [`TableSet`] in PostgreSQL
#[derive(Debug, Clone)]
pub struct PgPipelineRepository {
    pool: PgPool,
    tables: TableSet,
}

impl PgPipelineRepository {
    pub fn new(pool: PgPool, kind: PipelineKind) -> Self {
        Self {
            pool,
            tables: TableSet::for_kind(kind),
        }
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    /// Open a transaction scoped to `project`
    async fn begin(&self, project: ProjectId) -> StoreResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('app.current_project', $1, true)")
            .bind(project.to_string())
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Node filter that also proves the owning pipeline belongs to `project`
    fn node_in_project(&self, project_param: usize) -> String {
        format!(
            "EXISTS (SELECT 1 FROM {p} p WHERE p.id = n.pipeline_id AND p.project_id = ${project_param})",
            p = self.tables.pipelines,
        )
    }

    /// Node filter requiring the owning pipeline to still carry the write fence
    fn node_fenced(&self, project: usize, owner: usize, token: usize) -> String {
        format!(
            "EXISTS (SELECT 1 FROM {p} p WHERE p.id = n.pipeline_id AND p.project_id = ${project} \
             AND p.owner_id = ${owner} AND p.fence_token = ${token})",
            p = self.tables.pipelines,
        )
    }

    async fn fetch_pipeline_where(
        &self,
        project: ProjectId,
        filter: &str,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>> {
        let sql = format!(
            "SELECT {cols} FROM {p} WHERE project_id = $1 AND {res} = $2 AND {filter} \
             ORDER BY created_at DESC LIMIT 1",
            cols = self.tables.pipeline_columns(),
            p = self.tables.pipelines,
            res = self.tables.resource_column,
        );
        let mut tx = self.begin(project).await?;
        let row = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(project.as_uuid())
            .bind(resource_id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.map(|r| r.into_pipeline(self.tables.kind)).transpose()
    }
}

#[async_trait]
impl PipelineRepository for PgPipelineRepository {
    fn kind(&self) -> PipelineKind {
        self.tables.kind
    }

    async fn insert_pipeline(
        &self,
        pipeline: &Pipeline,
        nodes: &[Node],
    ) -> StoreResult<InsertOutcome> {
        let t = &self.tables;
        let mut tx = self.begin(pipeline.project_id).await?;

        let insert = format!(
            "INSERT INTO {p} (id, project_id, {res}, status, current_step, {fp}, owner_id, \
             last_heartbeat, fence_token, started_at, completed_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            p = t.pipelines,
            res = t.resource_column,
            fp = t.fingerprint_column,
        );
        let result = sqlx::query(&insert)
            .bind(pipeline.id)
            .bind(pipeline.project_id.as_uuid())
            .bind(pipeline.resource_id)
            .bind(pipeline.status.as_str())
            .bind(&pipeline.current_step)
            .bind(&pipeline.fingerprint)
            .bind(pipeline.owner().map(|o| o.as_str()))
            .bind(pipeline.lease.as_ref().map(|l| l.last_heartbeat))
            .bind(pipeline.fence_token.value())
            .bind(pipeline.started_at)
            .bind(pipeline.completed_at)
            .bind(pipeline.created_at)
            .bind(pipeline.updated_at)
            .execute(&mut *tx)
            .await;

        if let Err(sqlx::Error::Database(db_err)) = &result {
            if db_err.is_unique_violation() && db_err.constraint() == Some(t.active_index().as_str()) {
                tx.rollback().await?;
                let active = self
                    .find_active_by_resource(pipeline.project_id, pipeline.resource_id)
                    .await?;
                return match active {
                    Some(active) => Ok(InsertOutcome::ActiveExists(active.id)),
                    // The blocking run finished between the two statements
                    None => Err(StoreError::Corrupt(format!(
                        "active pipeline for resource {} vanished after conflict",
                        pipeline.resource_id
                    ))),
                };
            }
        }
        result?;

        insert_nodes_in(&mut tx, t, nodes).await?;
        tx.commit().await?;
        Ok(InsertOutcome::Inserted)
    }

    async fn find_pipeline(&self, project: ProjectId, id: Uuid) -> StoreResult<Option<Pipeline>> {
        let sql = format!(
            "SELECT {cols} FROM {p} WHERE id = $1 AND project_id = $2",
            cols = self.tables.pipeline_columns(),
            p = self.tables.pipelines,
        );
        let mut tx = self.begin(project).await?;
        let row = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(id)
            .bind(project.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.map(|r| r.into_pipeline(self.tables.kind)).transpose()
    }

    async fn find_latest_by_resource(
        &self,
        project: ProjectId,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>> {
        self.fetch_pipeline_where(project, "TRUE", resource_id).await
    }

    async fn find_active_by_resource(
        &self,
        project: ProjectId,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>> {
        self.fetch_pipeline_where(project, "status IN ('pending', 'running')", resource_id)
            .await
    }

    async fn find_latest_completed_by_resource(
        &self,
        project: ProjectId,
        resource_id: Uuid,
    ) -> StoreResult<Option<Pipeline>> {
        self.fetch_pipeline_where(project, "status = 'completed'", resource_id)
            .await
    }

    async fn list_claimable(
        &self,
        project: ProjectId,
        stale_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> StoreResult<Vec<Pipeline>> {
        let sql = format!(
            "SELECT {cols} FROM {p} \
             WHERE project_id = $1 AND status IN ('pending', 'running') \
               AND (owner_id IS NULL OR last_heartbeat < $2) \
             ORDER BY created_at ASC LIMIT $3",
            cols = self.tables.pipeline_columns(),
            p = self.tables.pipelines,
        );
        let mut tx = self.begin(project).await?;
        let rows = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(project.as_uuid())
            .bind(stale_before)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        rows.into_iter()
            .map(|r| r.into_pipeline(self.tables.kind))
            .collect()
    }

    async fn update_pipeline(
        &self,
        project: ProjectId,
        id: Uuid,
        expected: PipelineStatus,
        update: &PipelineUpdate,
        fence: &WriteFence,
    ) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {p} SET status = $1, current_step = $2, started_at = $3, \
             completed_at = $4, updated_at = $5 \
             WHERE id = $6 AND project_id = $7 AND status = $8 \
               AND owner_id = $9 AND fence_token = $10",
            p = self.tables.pipelines,
        );
        let mut tx = self.begin(project).await?;
        let result = sqlx::query(&sql)
            .bind(update.status.as_str())
            .bind(&update.current_step)
            .bind(update.started_at)
            .bind(update.completed_at)
            .bind(update.updated_at)
            .bind(id)
            .bind(project.as_uuid())
            .bind(expected.as_str())
            .bind(fence.owner_id.as_str())
            .bind(fence.token.value())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_resource(&self, project: ProjectId, resource_id: Uuid) -> StoreResult<u64> {
        let sql = format!(
            "DELETE FROM {p} WHERE project_id = $1 AND {res} = $2",
            p = self.tables.pipelines,
            res = self.tables.resource_column,
        );
        let mut tx = self.begin(project).await?;
        let result = sqlx::query(&sql)
            .bind(project.as_uuid())
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn try_claim(
        &self,
        project: ProjectId,
        id: Uuid,
        owner: &OwnerId,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<LeaseGrant>> {
        let sql = format!(
            "UPDATE {p} SET \
               fence_token = CASE WHEN owner_id IS NOT DISTINCT FROM $3 \
                                  THEN fence_token ELSE fence_token + 1 END, \
               owner_id = $3, last_heartbeat = $4, updated_at = $4 \
             WHERE id = $1 AND project_id = $2 \
               AND (owner_id IS NULL OR owner_id = $3 OR last_heartbeat < $5) \
             RETURNING {LEASE_COLUMNS}",
            p = self.tables.pipelines,
        );
        let mut tx = self.begin(project).await?;
        let row = sqlx::query_as::<_, LeaseRow>(&sql)
            .bind(id)
            .bind(project.as_uuid())
            .bind(owner.as_str())
            .bind(now)
            .bind(stale_before)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row.map(LeaseGrant::from))
    }

    async fn renew_lease(
        &self,
        project: ProjectId,
        id: Uuid,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LeaseGrant>> {
        let sql = format!(
            "UPDATE {p} SET \
               last_heartbeat = GREATEST($4, last_heartbeat + INTERVAL '1 microsecond'), \
               updated_at = $4 \
             WHERE id = $1 AND project_id = $2 AND owner_id = $3 \
             RETURNING {LEASE_COLUMNS}",
            p = self.tables.pipelines,
        );
        let mut tx = self.begin(project).await?;
        let row = sqlx::query_as::<_, LeaseRow>(&sql)
            .bind(id)
            .bind(project.as_uuid())
            .bind(owner.as_str())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row.map(LeaseGrant::from))
    }

    async fn clear_lease(
        &self,
        project: ProjectId,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {p} SET owner_id = NULL, last_heartbeat = NULL, updated_at = $3 \
             WHERE id = $1 AND project_id = $2",
            p = self.tables.pipelines,
        );
        let mut tx = self.begin(project).await?;
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(project.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_nodes(&self, project: ProjectId, nodes: &[Node]) -> StoreResult<()> {
        let mut tx = self.begin(project).await?;
        insert_nodes_in(&mut tx, &self.tables, nodes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_node(&self, project: ProjectId, node_id: Uuid) -> StoreResult<Option<Node>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM {n} n WHERE n.id = $1 AND {scope}",
            n = self.tables.nodes,
            scope = self.node_in_project(2),
        );
        let mut tx = self.begin(project).await?;
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(node_id)
            .bind(project.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.map(Node::try_from).transpose()
    }

    async fn list_nodes(&self, project: ProjectId, pipeline_id: Uuid) -> StoreResult<Vec<Node>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM {n} n WHERE n.pipeline_id = $1 AND {scope} \
             ORDER BY n.step_order ASC",
            n = self.tables.nodes,
            scope = self.node_in_project(2),
        );
        let mut tx = self.begin(project).await?;
        let rows = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(pipeline_id)
            .bind(project.as_uuid())
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        rows.into_iter().map(Node::try_from).collect()
    }

    async fn find_first_node_with_status(
        &self,
        project: ProjectId,
        pipeline_id: Uuid,
        status: NodeStatus,
    ) -> StoreResult<Option<Node>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM {n} n \
             WHERE n.pipeline_id = $1 AND n.status = $3 AND {scope} \
             ORDER BY n.step_order ASC LIMIT 1",
            n = self.tables.nodes,
            scope = self.node_in_project(2),
        );
        let mut tx = self.begin(project).await?;
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(pipeline_id)
            .bind(project.as_uuid())
            .bind(status.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.map(Node::try_from).transpose()
    }

    async fn find_blocking_predecessor(
        &self,
        project: ProjectId,
        node: &Node,
    ) -> StoreResult<Option<Node>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM {n} n \
             WHERE n.pipeline_id = $1 AND n.step_order < $3 AND n.status <> 'completed' \
               AND {scope} \
             ORDER BY n.step_order ASC LIMIT 1",
            n = self.tables.nodes,
            scope = self.node_in_project(2),
        );
        let mut tx = self.begin(project).await?;
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(node.pipeline_id)
            .bind(project.as_uuid())
            .bind(node.step_order)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.map(Node::try_from).transpose()
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
        let sql = format!(
            "UPDATE {n} AS n SET status = $4, started_at = $5, completed_at = $6, \
               duration_ms = $7, error_message = $8, retry_count = n.retry_count + $9, \
               updated_at = $10 \
             WHERE n.id = $1 AND n.status = $3 AND {fenced} \
               AND (NOT $13 OR NOT EXISTS ( \
                   SELECT 1 FROM {n} prev \
                   WHERE prev.pipeline_id = n.pipeline_id \
                     AND prev.step_order < n.step_order \
                     AND prev.status <> 'completed'))",
            n = self.tables.nodes,
            fenced = self.node_fenced(2, 11, 12),
        );
        let mut tx = self.begin(project).await?;
        let result = sqlx::query(&sql)
            .bind(node_id)
            .bind(project.as_uuid())
            .bind(expected.as_str())
            .bind(update.status.as_str())
            .bind(update.started_at)
            .bind(update.completed_at)
            .bind(update.duration_ms)
            .bind(&update.error_message)
            .bind(update.retry_increment)
            .bind(update.updated_at)
            .bind(fence.owner_id.as_str())
            .bind(fence.token.value())
            .bind(require_predecessors)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_node_progress(
        &self,
        project: ProjectId,
        node_id: Uuid,
        progress: &NodeProgress,
        fence: &WriteFence,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {n} AS n SET progress = $3, updated_at = $4 WHERE n.id = $1 AND {fenced}",
            n = self.tables.nodes,
            fenced = self.node_fenced(2, 5, 6),
        );
        let mut tx = self.begin(project).await?;
        let result = sqlx::query(&sql)
            .bind(node_id)
            .bind(project.as_uuid())
            .bind(Json(progress))
            .bind(now)
            .bind(fence.owner_id.as_str())
            .bind(fence.token.value())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_node_retry(
        &self,
        project: ProjectId,
        node_id: Uuid,
        fence: &WriteFence,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i32>> {
        let sql = format!(
            "UPDATE {n} AS n SET retry_count = n.retry_count + 1, updated_at = $3 \
             WHERE n.id = $1 AND {fenced} RETURNING n.retry_count",
            n = self.tables.nodes,
            fenced = self.node_fenced(2, 4, 5),
        );
        let mut tx = self.begin(project).await?;
        let count: Option<i32> = sqlx::query_scalar(&sql)
            .bind(node_id)
            .bind(project.as_uuid())
            .bind(now)
            .bind(fence.owner_id.as_str())
            .bind(fence.token.value())
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(count)
    }
}

async fn insert_nodes_in(
    tx: &mut Transaction<'static, Postgres>,
    tables: &TableSet,
    nodes: &[Node],
) -> StoreResult<()> {
    let sql = format!(
        "INSERT INTO {n} (id, pipeline_id, step_name, step_order, status, progress, \
         started_at, completed_at, duration_ms, error_message, retry_count, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        n = tables.nodes,
    );
    for node in nodes {
        sqlx::query(&sql)
            .bind(node.id)
            .bind(node.pipeline_id)
            .bind(&node.step_name)
            .bind(node.step_order)
            .bind(node.status.as_str())
            .bind(node.progress.as_ref().map(Json))
            .bind(node.started_at)
            .bind(node.completed_at)
            .bind(node.duration_ms)
            .bind(&node.error_message)
            .bind(node.retry_count)
            .bind(node.created_at)
            .bind(node.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(unique_conflict)?;
    }
    Ok(())
}

fn unique_conflict(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(db_err.message().to_string())
        }
        _ => StoreError::Database(err),
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    project_id: Uuid,
    resource_id: Uuid,
    status: String,
    current_step: Option<String>,
    fingerprint: Option<String>,
    owner_id: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    fence_token: i64,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PipelineRow {
    fn into_pipeline(self, kind: PipelineKind) -> StoreResult<Pipeline> {
        let status = self
            .status
            .parse::<PipelineStatus>()
            .map_err(|e| StoreError::Corrupt(format!("pipeline {}: {}", self.id, e)))?;

        let lease = match (self.owner_id, self.last_heartbeat) {
            (Some(owner_id), Some(last_heartbeat)) => Some(Lease {
                owner_id: OwnerId::from(owner_id),
                last_heartbeat,
            }),
            (None, None) => None,
            _ => {
                return Err(StoreError::Corrupt(format!(
                    "pipeline {} has owner and heartbeat out of step",
                    self.id
                )));
            }
        };

        Ok(Pipeline {
            id: self.id,
            kind,
            project_id: ProjectId::new(self.project_id),
            resource_id: self.resource_id,
            status,
            current_step: self.current_step,
            fingerprint: self.fingerprint,
            lease,
            fence_token: FenceToken(self.fence_token),
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    id: Uuid,
    owner_id: String,
    last_heartbeat: DateTime<Utc>,
    fence_token: i64,
}

impl From<LeaseRow> for LeaseGrant {
    fn from(row: LeaseRow) -> Self {
        LeaseGrant {
            pipeline_id: row.id,
            owner_id: OwnerId::from(row.owner_id),
            fence_token: FenceToken(row.fence_token),
            heartbeat_at: row.last_heartbeat,
        }
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: Uuid,
    pipeline_id: Uuid,
    step_name: String,
    step_order: i32,
    status: String,
    progress: Option<Json<NodeProgress>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<NodeRow> for Node {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<NodeStatus>()
            .map_err(|e| StoreError::Corrupt(format!("node {}: {}", row.id, e)))?;

        Ok(Node {
            id: row.id,
            pipeline_id: row.pipeline_id,
            step_name: row.step_name,
            step_order: row.step_order,
            status,
            progress: row.progress.map(|Json(p)| p),
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            error_message: row.error_message,
            retry_count: row.retry_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_sets_per_kind() {
        let dags = TableSet::for_kind(PipelineKind::SchemaDiscovery);
        assert_eq!(dags.pipelines, "extraction_dags");
        assert_eq!(dags.resource_column, "datasource_id");

        let workflows = TableSet::for_kind(PipelineKind::OntologyWorkflow);
        assert_eq!(workflows.nodes, "ontology_workflow_nodes");
        assert_eq!(workflows.fingerprint_column, "config_fingerprint");
        assert_eq!(workflows.active_index(), "ontology_workflows_one_active");
    }

    #[test]
    fn test_pipeline_columns_alias_kind_specific_names() {
        let cols = TableSet::EXTRACTION_DAGS.pipeline_columns();
        assert!(cols.contains("datasource_id AS resource_id"));
        assert!(cols.contains("schema_fingerprint AS fingerprint"));
    }

    #[test]
    fn test_half_lease_row_is_corrupt() {
        let now = Utc::now();
        let row = PipelineRow {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            status: "running".into(),
            current_step: None,
            fingerprint: None,
            owner_id: Some("worker-a".into()),
            last_heartbeat: None,
            fence_token: 1,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            row.into_pipeline(PipelineKind::SchemaDiscovery),
            Err(StoreError::Corrupt(_))
        ));
    }
}
