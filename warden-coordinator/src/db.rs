use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

use crate::repository::TableSet;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Create the tables and indexes of both pipeline kinds
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for tables in TableSet::ALL {
        migrate_table_set(pool, &tables).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

async fn migrate_table_set(pool: &PgPool, t: &TableSet) -> Result<(), sqlx::Error> {
    // Pipelines; owner and heartbeat are set and cleared together
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {p} (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL,
            {res} UUID NOT NULL,
            status VARCHAR(32) NOT NULL,
            current_step VARCHAR(255),
            {fp} TEXT,
            owner_id VARCHAR(255),
            last_heartbeat TIMESTAMPTZ,
            fence_token BIGINT NOT NULL DEFAULT 0,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            CONSTRAINT {p}_lease_pair CHECK ((owner_id IS NULL) = (last_heartbeat IS NULL))
        )
        "#,
        p = t.pipelines,
        res = t.resource_column,
        fp = t.fingerprint_column,
    ))
    .execute(pool)
    .await?;

    // Nodes
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {n} (
            id UUID PRIMARY KEY,
            pipeline_id UUID NOT NULL REFERENCES {p}(id) ON DELETE CASCADE,
            step_name VARCHAR(255) NOT NULL,
            step_order INTEGER NOT NULL,
            status VARCHAR(32) NOT NULL,
            progress JSONB,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            duration_ms BIGINT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            UNIQUE (pipeline_id, step_order)
        )
        "#,
        n = t.nodes,
        p = t.pipelines,
    ))
    .execute(pool)
    .await?;

    // At most one pending or running pipeline per resource
    sqlx::query(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {idx} ON {p}(project_id, {res}) \
         WHERE status IN ('pending', 'running')",
        idx = t.active_index(),
        p = t.pipelines,
        res = t.resource_column,
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{p}_resource ON {p}(project_id, {res}, created_at DESC)",
        p = t.pipelines,
        res = t.resource_column,
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{p}_claimable ON {p}(project_id, created_at) \
         WHERE status IN ('pending', 'running')",
        p = t.pipelines,
    ))
    .execute(pool)
    .await?;

    Ok(())
}
