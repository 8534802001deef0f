//! Account storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vowline_core::{AccountId, InMemoryTable, PipelineError, PipelineResult};

use crate::account::AdminAccount;

/// Row-level access to administrator accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account. Duplicate emails are a `conflict`.
    async fn insert(&self, account: &AdminAccount) -> PipelineResult<()>;

    async fn get(&self, id: AccountId) -> PipelineResult<Option<AdminAccount>>;

    async fn find_by_email(&self, email: &str) -> PipelineResult<Option<AdminAccount>>;

    /// All accounts, newest first.
    async fn list(&self) -> PipelineResult<Vec<AdminAccount>>;

    /// Overwrite an existing account keyed by id. Missing id is `not-found`.
    async fn update(&self, account: &AdminAccount) -> PipelineResult<()>;

    /// Set `last_login_at` and nothing else. Returns `false` if the account
    /// does not exist.
    async fn touch_login(&self, id: AccountId, at: DateTime<Utc>) -> PipelineResult<bool>;

    /// Remove an account. Returns `false` if it did not exist.
    async fn delete(&self, id: AccountId) -> PipelineResult<bool>;

    /// Number of accounts with role=owner and status=active.
    async fn count_active_owners(&self) -> PipelineResult<usize>;
}

#[async_trait]
impl<S> AccountStore for Arc<S>
where
    S: AccountStore + ?Sized,
{
    async fn insert(&self, account: &AdminAccount) -> PipelineResult<()> {
        (**self).insert(account).await
    }

    async fn get(&self, id: AccountId) -> PipelineResult<Option<AdminAccount>> {
        (**self).get(id).await
    }

    async fn find_by_email(&self, email: &str) -> PipelineResult<Option<AdminAccount>> {
        (**self).find_by_email(email).await
    }

    async fn list(&self) -> PipelineResult<Vec<AdminAccount>> {
        (**self).list().await
    }

    async fn update(&self, account: &AdminAccount) -> PipelineResult<()> {
        (**self).update(account).await
    }

    async fn touch_login(&self, id: AccountId, at: DateTime<Utc>) -> PipelineResult<bool> {
        (**self).touch_login(id, at).await
    }

    async fn delete(&self, id: AccountId) -> PipelineResult<bool> {
        (**self).delete(id).await
    }

    async fn count_active_owners(&self) -> PipelineResult<usize> {
        (**self).count_active_owners().await
    }
}

/// In-memory account store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    table: InMemoryTable<AdminAccount>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate a store outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.table.set_unavailable(unavailable);
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn insert(&self, account: &AdminAccount) -> PipelineResult<()> {
        let taken = self.table.count(|a| a.email == account.email)? > 0;
        if taken {
            return Err(PipelineError::conflict(
                "admin user with this email already exists",
            ));
        }
        self.table.insert(account.clone())
    }

    async fn get(&self, id: AccountId) -> PipelineResult<Option<AdminAccount>> {
        self.table.get(id)
    }

    async fn find_by_email(&self, email: &str) -> PipelineResult<Option<AdminAccount>> {
        Ok(self.table.select(|a| a.email == email)?.into_iter().next())
    }

    async fn list(&self) -> PipelineResult<Vec<AdminAccount>> {
        let mut accounts = self.table.select(|_| true)?;
        accounts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(accounts)
    }

    async fn update(&self, account: &AdminAccount) -> PipelineResult<()> {
        let replacement = account.clone();
        self.table
            .update(account.id, move |row| *row = replacement)?
            .ok_or_else(|| PipelineError::not_found(format!("admin account {}", account.id)))
    }

    async fn touch_login(&self, id: AccountId, at: DateTime<Utc>) -> PipelineResult<bool> {
        Ok(self.table.update(id, |row| row.last_login_at = Some(at))?.is_some())
    }

    async fn delete(&self, id: AccountId) -> PipelineResult<bool> {
        Ok(self.table.remove(id)?.is_some())
    }

    async fn count_active_owners(&self) -> PipelineResult<usize> {
        self.table.count(AdminAccount::is_active_owner)
    }
}
