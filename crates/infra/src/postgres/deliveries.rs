//! Postgres-backed delivery log.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use vowline_core::{DeliveryLogId, PipelineError, PipelineResult};
use vowline_notify::{
    DeliveryAnalytics, DeliveryChannel, DeliveryLogEntry, DeliveryLogStore, DeliveryStatus,
};

use super::{decode_error, map_sqlx_error, to_count};

const COLUMNS: &str = "id, recipient_address, channel, subject, status, provider_message_id, \
                       sent_at, delivered_at, error_message, created_at";

#[derive(Debug, Clone)]
pub struct PgDeliveryLogStore {
    pool: Arc<PgPool>,
}

impl PgDeliveryLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn decode(row: &PgRow, operation: &str) -> PipelineResult<DeliveryLogEntry> {
        DeliveryRow::from_row(row)
            .map_err(|e| decode_error(operation, e))?
            .try_into()
    }
}

#[async_trait]
impl DeliveryLogStore for PgDeliveryLogStore {
    #[instrument(skip(self, entry), fields(entry_id = %entry.id, channel = %entry.channel), err)]
    async fn insert(&self, entry: &DeliveryLogEntry) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_logs (
                id, recipient_address, channel, subject, status, provider_message_id,
                sent_at, delivered_at, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(&entry.recipient_address)
        .bind(entry.channel.as_str())
        .bind(&entry.subject)
        .bind(entry.status.as_str())
        .bind(entry.provider_message_id.as_deref())
        .bind(entry.sent_at)
        .bind(entry.delivered_at)
        .bind(entry.error_message.as_deref())
        .bind(entry.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_delivery_log", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn get(&self, id: DeliveryLogId) -> PipelineResult<Option<DeliveryLogEntry>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM delivery_logs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_delivery_log", e))?;

        row.as_ref()
            .map(|r| Self::decode(r, "get_delivery_log"))
            .transpose()
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id, status = %entry.status), err)]
    async fn update(&self, entry: &DeliveryLogEntry) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_logs
            SET status = $2,
                provider_message_id = $3,
                sent_at = $4,
                delivered_at = $5,
                error_message = $6
            WHERE id = $1
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.status.as_str())
        .bind(entry.provider_message_id.as_deref())
        .bind(entry.sent_at)
        .bind(entry.delivered_at)
        .bind(entry.error_message.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_delivery_log", e))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found(format!("delivery log {}", entry.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn by_recipient(&self, recipient: &str) -> PipelineResult<Vec<DeliveryLogEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM delivery_logs
            WHERE recipient_address = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(recipient)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delivery_logs_by_recipient", e))?;

        rows.iter()
            .map(|r| Self::decode(r, "delivery_logs_by_recipient"))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        let result = sqlx::query("DELETE FROM delivery_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_delivery_logs", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn analytics(&self, since: Option<DateTime<Utc>>) -> PipelineResult<DeliveryAnalytics> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'delivered') AS delivered,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE channel = 'primary') AS primary_count,
                COUNT(*) FILTER (WHERE channel = 'secondary') AS secondary_count
            FROM delivery_logs
            WHERE ($1::timestamptz IS NULL OR created_at >= $1)
            "#,
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delivery_analytics", e))?;

        let count = |col: &str| -> PipelineResult<u64> {
            row.try_get::<i64, _>(col)
                .map(to_count)
                .map_err(|e| decode_error("delivery_analytics", e))
        };
        Ok(DeliveryAnalytics {
            total: count("total")?,
            sent: count("sent")?,
            delivered: count("delivered")?,
            failed: count("failed")?,
            primary: count("primary_count")?,
            secondary: count("secondary_count")?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct DeliveryRow {
    id: Uuid,
    recipient_address: String,
    channel: String,
    subject: String,
    status: String,
    provider_message_id: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeliveryRow {
            id: row.try_get("id")?,
            recipient_address: row.try_get("recipient_address")?,
            channel: row.try_get("channel")?,
            subject: row.try_get("subject")?,
            status: row.try_get("status")?,
            provider_message_id: row.try_get("provider_message_id")?,
            sent_at: row.try_get("sent_at")?,
            delivered_at: row.try_get("delivered_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<DeliveryRow> for DeliveryLogEntry {
    type Error = PipelineError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(DeliveryLogEntry {
            id: DeliveryLogId::from_uuid(row.id),
            recipient_address: row.recipient_address,
            channel: DeliveryChannel::parse(&row.channel)?,
            subject: row.subject,
            status: DeliveryStatus::parse(&row.status)?,
            provider_message_id: row.provider_message_id,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}
