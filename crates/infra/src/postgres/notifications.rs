//! Postgres-backed notification queue store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use vowline_core::{NotificationId, PipelineError, PipelineResult};
use vowline_notify::{NotificationStatus, NotificationStore, QueueStats, QueuedNotification};

use super::{decode_error, map_sqlx_error, to_count};

const COLUMNS: &str = "id, recipient_address, subject, body_html, body_text, template_ref, \
                       fallback_address, scheduled_at, status, retry_count, sent_at, \
                       error_message, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgNotificationStore {
    pool: Arc<PgPool>,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn decode(row: &PgRow, operation: &str) -> PipelineResult<QueuedNotification> {
        NotificationRow::from_row(row)
            .map_err(|e| decode_error(operation, e))?
            .try_into()
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    #[instrument(skip(self, notification), fields(notification_id = %notification.id), err)]
    async fn insert(&self, notification: &QueuedNotification) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_notifications (
                id, recipient_address, subject, body_html, body_text, template_ref,
                fallback_address, scheduled_at, status, retry_count, sent_at,
                error_message, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(notification.id.as_uuid())
        .bind(&notification.recipient_address)
        .bind(&notification.subject)
        .bind(&notification.body_html)
        .bind(&notification.body_text)
        .bind(notification.template_ref.as_deref())
        .bind(notification.fallback_address.as_deref())
        .bind(notification.scheduled_at)
        .bind(notification.status.as_str())
        .bind(retry_count_column(notification.retry_count))
        .bind(notification.sent_at)
        .bind(notification.error_message.as_deref())
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_notification", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(notification_id = %id), err)]
    async fn get(&self, id: NotificationId) -> PipelineResult<Option<QueuedNotification>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM scheduled_notifications WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_notification", e))?;

        row.as_ref()
            .map(|r| Self::decode(r, "get_notification"))
            .transpose()
    }

    #[instrument(
        skip(self, notification),
        fields(notification_id = %notification.id, status = %notification.status),
        err
    )]
    async fn update(&self, notification: &QueuedNotification) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = $2,
                retry_count = $3,
                sent_at = $4,
                error_message = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(notification.id.as_uuid())
        .bind(notification.status.as_str())
        .bind(retry_count_column(notification.retry_count))
        .bind(notification.sent_at)
        .bind(notification.error_message.as_deref())
        .bind(notification.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_notification", e))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found(format!(
                "notification {}",
                notification.id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(notification_id = %id, %from, %to), err)]
    async fn transition(
        &self,
        id: NotificationId,
        from: NotificationStatus,
        to: NotificationStatus,
        at: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_notification", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(notification_id = %id), err)]
    async fn requeue(&self, id: NotificationId, at: DateTime<Utc>) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = $3,
                retry_count = retry_count + 1,
                error_message = NULL,
                updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(NotificationStatus::Failed.as_str())
        .bind(NotificationStatus::Pending.as_str())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_notification", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, message), err)]
    async fn fail_stale(
        &self,
        before: DateTime<Utc>,
        message: &str,
        at: DateTime<Utc>,
    ) -> PipelineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = $3, error_message = $4, updated_at = $5
            WHERE status = $1 AND updated_at < $2
            "#,
        )
        .bind(NotificationStatus::Processing.as_str())
        .bind(before)
        .bind(NotificationStatus::Failed.as_str())
        .bind(message)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_stale_notifications", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> PipelineResult<Vec<QueuedNotification>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM scheduled_notifications
            WHERE status = $1 AND scheduled_at <= $2
            ORDER BY scheduled_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(NotificationStatus::Pending.as_str())
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_notifications", e))?;

        rows.iter().map(|r| Self::decode(r, "due_notifications")).collect()
    }

    #[instrument(skip(self), err)]
    async fn retryable(&self, max_retries: u32) -> PipelineResult<Vec<QueuedNotification>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM scheduled_notifications
            WHERE status = $1 AND retry_count < $2
            ORDER BY scheduled_at ASC, id ASC
            "#
        ))
        .bind(NotificationStatus::Failed.as_str())
        .bind(retry_count_column(max_retries))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retryable_notifications", e))?;

        rows.iter()
            .map(|r| Self::decode(r, "retryable_notifications"))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> PipelineResult<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM scheduled_notifications
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("notification_stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| decode_error("notification_stats", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| decode_error("notification_stats", e))?;
            stats.tally(NotificationStatus::parse(&status)?, to_count(n));
        }
        Ok(stats)
    }
}

fn retry_count_column(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct NotificationRow {
    id: Uuid,
    recipient_address: String,
    subject: String,
    body_html: String,
    body_text: String,
    template_ref: Option<String>,
    fallback_address: Option<String>,
    scheduled_at: DateTime<Utc>,
    status: String,
    retry_count: i32,
    sent_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NotificationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(NotificationRow {
            id: row.try_get("id")?,
            recipient_address: row.try_get("recipient_address")?,
            subject: row.try_get("subject")?,
            body_html: row.try_get("body_html")?,
            body_text: row.try_get("body_text")?,
            template_ref: row.try_get("template_ref")?,
            fallback_address: row.try_get("fallback_address")?,
            scheduled_at: row.try_get("scheduled_at")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            sent_at: row.try_get("sent_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<NotificationRow> for QueuedNotification {
    type Error = PipelineError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(QueuedNotification {
            id: NotificationId::from_uuid(row.id),
            recipient_address: row.recipient_address,
            subject: row.subject,
            body_html: row.body_html,
            body_text: row.body_text,
            template_ref: row.template_ref,
            fallback_address: row.fallback_address,
            scheduled_at: row.scheduled_at,
            status: NotificationStatus::parse(&row.status)?,
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            sent_at: row.sent_at,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
