//! Idempotent schema bootstrap.

use sqlx::PgPool;
use tracing::{info, instrument};

use vowline_core::PipelineResult;

use super::map_sqlx_error;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_execution_logs (
        id UUID PRIMARY KEY,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        duration_ms BIGINT,
        items_processed BIGINT NOT NULL DEFAULT 0,
        items_failed BIGINT NOT NULL DEFAULT 0,
        error_message TEXT,
        metadata JSONB
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_execution_logs_type_started
        ON job_execution_logs (job_type, started_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_notifications (
        id UUID PRIMARY KEY,
        recipient_address TEXT NOT NULL,
        subject TEXT NOT NULL,
        body_html TEXT NOT NULL,
        body_text TEXT NOT NULL,
        template_ref TEXT,
        fallback_address TEXT,
        scheduled_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        sent_at TIMESTAMPTZ,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_scheduled_notifications_due
        ON scheduled_notifications (status, scheduled_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS delivery_logs (
        id UUID PRIMARY KEY,
        recipient_address TEXT NOT NULL,
        channel TEXT NOT NULL,
        subject TEXT NOT NULL,
        status TEXT NOT NULL,
        provider_message_id TEXT,
        sent_at TIMESTAMPTZ,
        delivered_at TIMESTAMPTZ,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_delivery_logs_recipient
        ON delivery_logs (recipient_address, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'draft',
        rsvp_required BOOLEAN NOT NULL DEFAULT TRUE,
        rsvp_deadline DATE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activities (
        id UUID PRIMARY KEY,
        event_id UUID NOT NULL REFERENCES events (id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        rsvp_required BOOLEAN NOT NULL DEFAULT TRUE,
        rsvp_deadline DATE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS guests (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT,
        phone TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invitations (
        guest_id UUID NOT NULL REFERENCES guests (id) ON DELETE CASCADE,
        entity_id UUID NOT NULL,
        entity_kind TEXT NOT NULL,
        invitation_sent BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (guest_id, entity_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rsvps (
        id UUID PRIMARY KEY,
        guest_id UUID NOT NULL REFERENCES guests (id) ON DELETE CASCADE,
        entity_id UUID NOT NULL,
        status TEXT NOT NULL,
        responded_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rsvps_guest_entity
        ON rsvps (guest_id, entity_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rsvp_reminders_sent (
        id UUID PRIMARY KEY,
        guest_id UUID NOT NULL,
        entity_id UUID NOT NULL,
        entity_kind TEXT NOT NULL,
        sent_at TIMESTAMPTZ NOT NULL,
        days_before_deadline INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rsvp_reminders_sent_guest_entity
        ON rsvp_reminders_sent (guest_id, entity_id, sent_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS admin_users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL,
        status TEXT NOT NULL,
        invited_by UUID,
        invited_at TIMESTAMPTZ NOT NULL,
        last_login_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    // Refuses any write that would leave zero active owners, including
    // writers that bypass the account guard.
    r#"
    CREATE OR REPLACE FUNCTION admin_users_keep_owner() RETURNS TRIGGER AS $$
    BEGIN
        IF OLD.role = 'owner' AND OLD.status = 'active'
           AND (TG_OP = 'DELETE' OR NEW.role <> 'owner' OR NEW.status <> 'active') THEN
            PERFORM 1 FROM admin_users
                WHERE role = 'owner' AND status = 'active'
                FOR UPDATE;
            IF NOT EXISTS (
                SELECT 1 FROM admin_users
                WHERE role = 'owner' AND status = 'active' AND id <> OLD.id
            ) THEN
                RAISE EXCEPTION 'cannot remove the last owner account'
                    USING ERRCODE = 'P0001';
            END IF;
        END IF;
        IF TG_OP = 'DELETE' THEN
            RETURN OLD;
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS admin_users_keep_owner ON admin_users"#,
    r#"
    CREATE TRIGGER admin_users_keep_owner
        BEFORE UPDATE OR DELETE ON admin_users
        FOR EACH ROW EXECUTE FUNCTION admin_users_keep_owner()
    "#,
];

/// Create every table, index and trigger the stores rely on.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> PipelineResult<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    info!(statements = STATEMENTS.len(), "schema ready");
    Ok(())
}
