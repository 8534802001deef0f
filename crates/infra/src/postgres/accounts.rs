//! Postgres-backed administrator accounts.
//!
//! The `admin_users_keep_owner` trigger rejects writes that would remove the
//! last active owner; that rejection surfaces as `Forbidden`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use vowline_accounts::{AccountRole, AccountStatus, AccountStore, AdminAccount};
use vowline_core::{AccountId, PipelineError, PipelineResult};

use super::{decode_error, map_sqlx_error};

const COLUMNS: &str = "id, email, role, status, invited_by, invited_at, last_login_at, \
                       created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgAccountStore {
    pool: Arc<PgPool>,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn decode(row: &PgRow, operation: &str) -> PipelineResult<AdminAccount> {
        AccountRow::from_row(row)
            .map_err(|e| decode_error(operation, e))?
            .try_into()
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    #[instrument(skip(self, account), fields(account_id = %account.id), err)]
    async fn insert(&self, account: &AdminAccount) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_users (
                id, email, role, status, invited_by, invited_at, last_login_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(&account.email)
        .bind(account.role.as_str())
        .bind(account.status.as_str())
        .bind(account.invited_by.map(|id| *id.as_uuid()))
        .bind(account.invited_at)
        .bind(account.last_login_at)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match map_sqlx_error("insert_account", e) {
            PipelineError::Conflict(_) => {
                PipelineError::conflict("admin user with this email already exists")
            }
            other => other,
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(account_id = %id), err)]
    async fn get(&self, id: AccountId) -> PipelineResult<Option<AdminAccount>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM admin_users WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_account", e))?;

        row.as_ref()
            .map(|r| Self::decode(r, "get_account"))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_by_email(&self, email: &str) -> PipelineResult<Option<AdminAccount>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM admin_users WHERE email = $1"))
            .bind(email)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_account_by_email", e))?;

        row.as_ref()
            .map(|r| Self::decode(r, "find_account_by_email"))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> PipelineResult<Vec<AdminAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM admin_users ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_accounts", e))?;

        rows.iter().map(|r| Self::decode(r, "list_accounts")).collect()
    }

    #[instrument(skip(self, account), fields(account_id = %account.id), err)]
    async fn update(&self, account: &AdminAccount) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE admin_users
            SET role = $2,
                status = $3,
                last_login_at = $4,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(account.role.as_str())
        .bind(account.status.as_str())
        .bind(account.last_login_at)
        .bind(account.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_account", e))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found(format!("admin account {}", account.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(account_id = %id), err)]
    async fn touch_login(&self, id: AccountId, at: DateTime<Utc>) -> PipelineResult<bool> {
        let result = sqlx::query("UPDATE admin_users SET last_login_at = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("touch_admin_login", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(account_id = %id), err)]
    async fn delete(&self, id: AccountId) -> PipelineResult<bool> {
        let result = sqlx::query("DELETE FROM admin_users WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_account", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn count_active_owners(&self) -> PipelineResult<usize> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM admin_users
            WHERE role = $1 AND status = $2
            "#,
        )
        .bind(AccountRole::Owner.as_str())
        .bind(AccountStatus::Active.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_active_owners", e))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct AccountRow {
    id: Uuid,
    email: String,
    role: String,
    status: String,
    invited_by: Option<Uuid>,
    invited_at: DateTime<Utc>,
    last_login_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AccountRow {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            role: row.try_get("role")?,
            status: row.try_get("status")?,
            invited_by: row.try_get("invited_by")?,
            invited_at: row.try_get("invited_at")?,
            last_login_at: row.try_get("last_login_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<AccountRow> for AdminAccount {
    type Error = PipelineError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(AdminAccount {
            id: AccountId::from_uuid(row.id),
            email: row.email,
            role: AccountRole::parse(&row.role)?,
            status: AccountStatus::parse(&row.status)?,
            invited_by: row.invited_by.map(AccountId::from_uuid),
            invited_at: row.invited_at,
            last_login_at: row.last_login_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
