//! Postgres-backed job execution log.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use vowline_core::{ExecutionLogId, PipelineError, PipelineResult};
use vowline_jobs::{JobExecutionLog, JobLogStore, JobRunStatus, JobType};

use super::{decode_error, map_sqlx_error, to_bigint, to_count};

const COLUMNS: &str = "id, job_type, status, started_at, completed_at, duration_ms, \
                       items_processed, items_failed, error_message, metadata";

#[derive(Debug, Clone)]
pub struct PgJobLogStore {
    pool: Arc<PgPool>,
}

impl PgJobLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn decode(row: &PgRow, operation: &str) -> PipelineResult<JobExecutionLog> {
        JobLogRow::from_row(row)
            .map_err(|e| decode_error(operation, e))?
            .try_into()
    }
}

#[async_trait]
impl JobLogStore for PgJobLogStore {
    #[instrument(skip(self, log), fields(log_id = %log.id, job_type = %log.job_type), err)]
    async fn insert(&self, log: &JobExecutionLog) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_execution_logs (
                id, job_type, status, started_at, completed_at, duration_ms,
                items_processed, items_failed, error_message, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(log.id.as_uuid())
        .bind(log.job_type.as_str())
        .bind(log.status.as_str())
        .bind(log.started_at)
        .bind(log.completed_at)
        .bind(log.duration_ms.map(to_bigint))
        .bind(to_bigint(log.items_processed))
        .bind(to_bigint(log.items_failed))
        .bind(log.error_message.as_deref())
        .bind(log.metadata.clone())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job_log", e))?;
        Ok(())
    }

    #[instrument(skip(self, log), fields(log_id = %log.id, status = %log.status.as_str()), err)]
    async fn finish(&self, log: &JobExecutionLog) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_execution_logs
            SET status = $2,
                completed_at = $3,
                duration_ms = $4,
                items_processed = $5,
                items_failed = $6,
                error_message = $7,
                metadata = $8
            WHERE id = $1
            "#,
        )
        .bind(log.id.as_uuid())
        .bind(log.status.as_str())
        .bind(log.completed_at)
        .bind(log.duration_ms.map(to_bigint))
        .bind(to_bigint(log.items_processed))
        .bind(to_bigint(log.items_failed))
        .bind(log.error_message.as_deref())
        .bind(log.metadata.clone())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish_job_log", e))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found(format!("execution log {}", log.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(log_id = %id), err)]
    async fn get(&self, id: ExecutionLogId) -> PipelineResult<Option<JobExecutionLog>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM job_execution_logs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job_log", e))?;

        row.as_ref()
            .map(|r| Self::decode(r, "get_job_log"))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn recent(&self, job_type: Option<JobType>, limit: usize) -> PipelineResult<Vec<JobExecutionLog>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM job_execution_logs
            WHERE ($1::text IS NULL OR job_type = $1)
            ORDER BY started_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(job_type.map(|t| t.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_job_logs", e))?;

        rows.iter().map(|r| Self::decode(r, "recent_job_logs")).collect()
    }

    #[instrument(skip(self), err)]
    async fn started_since(
        &self,
        job_type: Option<JobType>,
        since: Option<DateTime<Utc>>,
    ) -> PipelineResult<Vec<JobExecutionLog>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM job_execution_logs
            WHERE ($1::text IS NULL OR job_type = $1)
              AND ($2::timestamptz IS NULL OR started_at >= $2)
            ORDER BY started_at ASC
            "#
        ))
        .bind(job_type.map(|t| t.as_str()))
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_logs_since", e))?;

        rows.iter().map(|r| Self::decode(r, "job_logs_since")).collect()
    }

    #[instrument(skip(self), fields(job_type = %job_type), err)]
    async fn has_running(&self, job_type: JobType) -> PipelineResult<bool> {
        let running: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM job_execution_logs
                WHERE job_type = $1 AND status = $2
            )
            "#,
        )
        .bind(job_type.as_str())
        .bind(JobRunStatus::Running.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_running_job", e))?;
        Ok(running)
    }

    #[instrument(skip(self), err)]
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_execution_logs
            WHERE started_at < $1 AND status IN ($2, $3)
            "#,
        )
        .bind(cutoff)
        .bind(JobRunStatus::Completed.as_str())
        .bind(JobRunStatus::Failed.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_job_logs", e))?;
        Ok(result.rows_affected())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct JobLogRow {
    id: Uuid,
    job_type: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    items_processed: i64,
    items_failed: i64,
    error_message: Option<String>,
    metadata: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobLogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobLogRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            items_processed: row.try_get("items_processed")?,
            items_failed: row.try_get("items_failed")?,
            error_message: row.try_get("error_message")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl TryFrom<JobLogRow> for JobExecutionLog {
    type Error = PipelineError;

    fn try_from(row: JobLogRow) -> Result<Self, Self::Error> {
        Ok(JobExecutionLog {
            id: ExecutionLogId::from_uuid(row.id),
            job_type: JobType::parse(&row.job_type)?,
            status: JobRunStatus::parse(&row.status)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms.map(to_count),
            items_processed: to_count(row.items_processed),
            items_failed: to_count(row.items_failed),
            error_message: row.error_message,
            metadata: row.metadata,
        })
    }
}
