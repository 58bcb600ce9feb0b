use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// DDL for every table, idempotent.
pub const SCHEMA_SQL: &str = include_str!("../../../db/schema.sql");

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

/// Open a `running` journal entry for `component`.
pub async fn create_job_run(pool: &PgPool, component: &str, detail: Value) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, status, detail)
        VALUES ($1, $2, 'running', $3)
        "#,
    )
    .bind(job_run_id)
    .bind(component)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(job_run_id)
}

/// Close a journal entry; `detail` is merged into the stored object.
pub async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    detail: Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(())
}
