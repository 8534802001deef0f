//! Postgres-backed reminder source and sent-reminder log.
//!
//! Deadline entities are published events with a required RSVP, plus the
//! activities of published events that carry their own RSVP deadline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use vowline_core::{DeadlineEntityId, PartyId, PipelineError, PipelineResult, ReminderRecordId};
use vowline_notify::{
    DeadlineEntity, DeadlineKind, Invitee, ReminderLog, ReminderSentRecord, ReminderSource,
    ResponseStatus,
};

use super::{decode_error, map_sqlx_error};

#[derive(Debug, Clone)]
pub struct PgReminderStore {
    pool: Arc<PgPool>,
}

impl PgReminderStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ReminderSource for PgReminderStore {
    #[instrument(skip(self), err)]
    async fn deadline_entities(&self, from: NaiveDate, to: NaiveDate) -> PipelineResult<Vec<DeadlineEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, 'event' AS kind, name, rsvp_deadline::text AS deadline
            FROM events
            WHERE status = 'published'
              AND rsvp_required
              AND rsvp_deadline BETWEEN $1 AND $2
            UNION ALL
            SELECT a.id, 'activity' AS kind, a.name, a.rsvp_deadline::text AS deadline
            FROM activities a
            JOIN events e ON e.id = a.event_id
            WHERE e.status = 'published'
              AND a.rsvp_required
              AND a.rsvp_deadline BETWEEN $1 AND $2
            ORDER BY deadline ASC, id ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("deadline_entities", e))?;

        rows.iter()
            .map(|row| {
                DeadlineRow::from_row(row)
                    .map_err(|e| decode_error("deadline_entities", e))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip(self, entity), fields(entity_id = %entity.id), err)]
    async fn invitees(&self, entity: &DeadlineEntity) -> PipelineResult<Vec<Invitee>> {
        let rows = sqlx::query(
            r#"
            SELECT g.id, g.name, g.email, g.phone
            FROM guests g
            JOIN invitations i ON i.guest_id = g.id
            WHERE i.entity_id = $1
              AND i.invitation_sent
              AND g.email IS NOT NULL
            ORDER BY g.name ASC, g.id ASC
            "#,
        )
        .bind(entity.id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("invitees", e))?;

        rows.iter()
            .map(|row| {
                InviteeRow::from_row(row)
                    .map(Invitee::from)
                    .map_err(|e| decode_error("invitees", e))
            })
            .collect()
    }

    #[instrument(skip(self, entity), fields(party_id = %party, entity_id = %entity.id), err)]
    async fn responses(&self, party: PartyId, entity: &DeadlineEntity) -> PipelineResult<Vec<ResponseStatus>> {
        let statuses: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT status FROM rsvps
            WHERE guest_id = $1 AND entity_id = $2
            "#,
        )
        .bind(party.as_uuid())
        .bind(entity.id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("responses", e))?;

        statuses.iter().map(|s| ResponseStatus::parse(s)).collect()
    }
}

#[async_trait]
impl ReminderLog for PgReminderStore {
    #[instrument(skip(self, record), fields(party_id = %record.subject_id, entity_id = %record.parent_entity_id), err)]
    async fn record(&self, record: &ReminderSentRecord) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rsvp_reminders_sent (
                id, guest_id, entity_id, entity_kind, sent_at, days_before_deadline
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.subject_id.as_uuid())
        .bind(record.parent_entity_id.as_uuid())
        .bind(record.parent_entity_kind.as_str())
        .bind(record.sent_at)
        .bind(i32::try_from(record.days_before_deadline).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_reminder", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(party_id = %party, entity_id = %entity), err)]
    async fn last_sent(&self, party: PartyId, entity: DeadlineEntityId) -> PipelineResult<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            r#"
            SELECT MAX(sent_at) FROM rsvp_reminders_sent
            WHERE guest_id = $1 AND entity_id = $2
            "#,
        )
        .bind(party.as_uuid())
        .bind(entity.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("last_reminder_sent", e))
    }

    #[instrument(skip(self), err)]
    async fn records(&self, since: Option<DateTime<Utc>>) -> PipelineResult<Vec<ReminderSentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, guest_id, entity_id, entity_kind, sent_at, days_before_deadline
            FROM rsvp_reminders_sent
            WHERE ($1::timestamptz IS NULL OR sent_at >= $1)
            ORDER BY sent_at ASC, id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reminder_records", e))?;

        rows.iter()
            .map(|row| {
                SentRow::from_row(row)
                    .map_err(|e| decode_error("reminder_records", e))?
                    .try_into()
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct DeadlineRow {
    id: Uuid,
    kind: String,
    name: String,
    deadline: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeadlineRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadlineRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            name: row.try_get("name")?,
            deadline: row.try_get("deadline")?,
        })
    }
}

impl TryFrom<DeadlineRow> for DeadlineEntity {
    type Error = PipelineError;

    fn try_from(row: DeadlineRow) -> Result<Self, Self::Error> {
        Ok(DeadlineEntity {
            id: DeadlineEntityId::from_uuid(row.id),
            kind: DeadlineKind::parse(&row.kind)?,
            name: row.name,
            deadline: row.deadline,
        })
    }
}

#[derive(Debug)]
struct InviteeRow {
    id: Uuid,
    name: String,
    email: Option<String>,
    phone: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for InviteeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(InviteeRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
        })
    }
}

impl From<InviteeRow> for Invitee {
    fn from(row: InviteeRow) -> Self {
        Invitee {
            id: PartyId::from_uuid(row.id),
            name: row.name,
            email: row.email,
            phone: row.phone,
        }
    }
}

#[derive(Debug)]
struct SentRow {
    id: Uuid,
    guest_id: Uuid,
    entity_id: Uuid,
    entity_kind: String,
    sent_at: DateTime<Utc>,
    days_before_deadline: i32,
}

impl<'r> sqlx::FromRow<'r, PgRow> for SentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SentRow {
            id: row.try_get("id")?,
            guest_id: row.try_get("guest_id")?,
            entity_id: row.try_get("entity_id")?,
            entity_kind: row.try_get("entity_kind")?,
            sent_at: row.try_get("sent_at")?,
            days_before_deadline: row.try_get("days_before_deadline")?,
        })
    }
}

impl TryFrom<SentRow> for ReminderSentRecord {
    type Error = PipelineError;

    fn try_from(row: SentRow) -> Result<Self, Self::Error> {
        Ok(ReminderSentRecord {
            id: ReminderRecordId::from_uuid(row.id),
            subject_id: PartyId::from_uuid(row.guest_id),
            parent_entity_id: DeadlineEntityId::from_uuid(row.entity_id),
            parent_entity_kind: DeadlineKind::parse(&row.entity_kind)?,
            sent_at: row.sent_at,
            days_before_deadline: i64::from(row.days_before_deadline),
        })
    }
}
