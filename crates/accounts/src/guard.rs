//! Account lifecycle operations guarded by the last-owner invariant.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use vowline_core::{AccountId, Clock, PipelineError, PipelineResult, SystemClock};

use crate::account::{AccountRole, AccountStatus, AdminAccount, NewAdminAccount};
use crate::store::AccountStore;

/// Administrator account operations.
///
/// Deactivate, delete and demote are refused with `forbidden` when they would
/// leave zero active owners. The count and the mutation run inside one
/// critical section per guard instance; concurrent writers outside this
/// process are stopped by the store-level trigger of the PostgreSQL schema.
pub struct AccountGuard<S> {
    store: S,
    clock: Arc<dyn Clock>,
    gate: Mutex<()>,
}

impl<S: AccountStore> AccountGuard<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create an active account from an invite.
    pub async fn invite(&self, invite: NewAdminAccount) -> PipelineResult<AdminAccount> {
        let account = invite.into_account(self.clock.now())?;

        if self.store.find_by_email(&account.email).await?.is_some() {
            return Err(PipelineError::conflict(
                "admin user with this email already exists",
            ));
        }

        self.store.insert(&account).await?;
        info!(account_id = %account.id, role = %account.role, "admin account invited");
        Ok(account)
    }

    pub async fn get(&self, id: AccountId) -> PipelineResult<AdminAccount> {
        self.load(id).await
    }

    /// All accounts, newest first.
    pub async fn list(&self) -> PipelineResult<Vec<AdminAccount>> {
        self.store.list().await
    }

    /// Set the account inactive.
    ///
    /// Deactivating an already-inactive account is a successful no-op-like
    /// update.
    pub async fn deactivate(&self, id: AccountId) -> PipelineResult<AdminAccount> {
        let _gate = self.gate.lock().await;

        let mut account = self.load(id).await?;
        self.ensure_not_last_owner(&account, "deactivate").await?;

        account.status = AccountStatus::Inactive;
        account.updated_at = self.clock.now();
        self.store.update(&account).await?;

        info!(account_id = %id, "admin account deactivated");
        Ok(account)
    }

    pub async fn reactivate(&self, id: AccountId) -> PipelineResult<AdminAccount> {
        let _gate = self.gate.lock().await;

        let mut account = self.load(id).await?;
        account.status = AccountStatus::Active;
        account.updated_at = self.clock.now();
        self.store.update(&account).await?;

        info!(account_id = %id, "admin account reactivated");
        Ok(account)
    }

    /// Change the role. Demoting the last active owner is refused.
    pub async fn change_role(&self, id: AccountId, role: AccountRole) -> PipelineResult<AdminAccount> {
        let _gate = self.gate.lock().await;

        let mut account = self.load(id).await?;
        if account.role == role {
            return Ok(account);
        }
        if role != AccountRole::Owner {
            self.ensure_not_last_owner(&account, "demote").await?;
        }

        account.role = role;
        account.updated_at = self.clock.now();
        self.store.update(&account).await?;

        info!(account_id = %id, role = %role, "admin account role changed");
        Ok(account)
    }

    /// Remove the account outright.
    pub async fn delete(&self, id: AccountId) -> PipelineResult<()> {
        let _gate = self.gate.lock().await;

        let account = self.load(id).await?;
        self.ensure_not_last_owner(&account, "delete").await?;

        if !self.store.delete(id).await? {
            return Err(PipelineError::not_found(format!("admin account {id}")));
        }

        info!(account_id = %id, "admin account deleted");
        Ok(())
    }

    /// Stamp a successful sign-in.
    ///
    /// Only `last_login_at` is written, so this never races the guarded
    /// status and role changes.
    pub async fn record_login(&self, id: AccountId) -> PipelineResult<()> {
        if !self.store.touch_login(id, self.clock.now()).await? {
            return Err(PipelineError::not_found(format!("admin account {id}")));
        }
        Ok(())
    }

    async fn load(&self, id: AccountId) -> PipelineResult<AdminAccount> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("admin account {id}")))
    }

    async fn ensure_not_last_owner(&self, account: &AdminAccount, action: &str) -> PipelineResult<()> {
        if account.role != AccountRole::Owner {
            return Ok(());
        }

        let active_owners = self.store.count_active_owners().await?;
        if active_owners <= 1 && account.status == AccountStatus::Active {
            warn!(account_id = %account.id, action, "refused: last active owner");
            return Err(PipelineError::forbidden(format!(
                "cannot {action} the last owner account"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryAccountStore;
    use proptest::prelude::*;
    use vowline_core::ErrorKind;

    fn guard() -> AccountGuard<Arc<InMemoryAccountStore>> {
        AccountGuard::new(InMemoryAccountStore::arc())
    }

    async fn owner(guard: &AccountGuard<Arc<InMemoryAccountStore>>, email: &str) -> AdminAccount {
        guard
            .invite(NewAdminAccount::new(email, AccountRole::Owner))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn deactivating_the_only_owner_is_forbidden() {
        let guard = guard();
        let only = owner(&guard, "only@example.com").await;

        let err = guard.deactivate(only.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(err.message(), "cannot deactivate the last owner account");

        let unchanged = guard.get(only.id).await.unwrap();
        assert_eq!(unchanged.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn second_owner_can_be_deactivated() {
        let guard = guard();
        let first = owner(&guard, "first@example.com").await;
        owner(&guard, "second@example.com").await;

        let updated = guard.deactivate(first.id).await.unwrap();
        assert_eq!(updated.status, AccountStatus::Inactive);
        assert_eq!(guard.store().count_active_owners().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deleting_the_last_owner_is_forbidden() {
        let guard = guard();
        let only = owner(&guard, "only@example.com").await;

        let err = guard.delete(only.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(err.message(), "cannot delete the last owner account");
        assert!(guard.get(only.id).await.is_ok());
    }

    #[tokio::test]
    async fn admins_are_not_protected_by_the_owner_invariant() {
        let guard = guard();
        owner(&guard, "owner@example.com").await;
        let admin = guard
            .invite(NewAdminAccount::new("helper@example.com", AccountRole::Admin))
            .await
            .unwrap();

        guard.deactivate(admin.id).await.unwrap();
        guard.delete(admin.id).await.unwrap();
        assert_eq!(
            guard.get(admin.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn inactive_owner_can_be_deactivated_again_and_deleted() {
        let guard = guard();
        let first = owner(&guard, "first@example.com").await;
        owner(&guard, "second@example.com").await;

        guard.deactivate(first.id).await.unwrap();
        let again = guard.deactivate(first.id).await.unwrap();
        assert_eq!(again.status, AccountStatus::Inactive);

        guard.delete(first.id).await.unwrap();
        assert_eq!(guard.store().count_active_owners().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn demoting_the_last_owner_is_forbidden() {
        let guard = guard();
        let only = owner(&guard, "only@example.com").await;

        let err = guard.change_role(only.id, AccountRole::Admin).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let promoted = guard
            .invite(NewAdminAccount::new("next@example.com", AccountRole::Admin))
            .await
            .unwrap();
        guard.change_role(promoted.id, AccountRole::Owner).await.unwrap();
        let demoted = guard.change_role(only.id, AccountRole::Admin).await.unwrap();
        assert_eq!(demoted.role, AccountRole::Admin);
    }

    #[tokio::test]
    async fn duplicate_invite_is_a_conflict() {
        let guard = guard();
        owner(&guard, "ana@example.com").await;

        let err = guard
            .invite(NewAdminAccount::new("  ANA@example.com", AccountRole::Admin))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn missing_account_is_not_found() {
        let guard = guard();
        let err = guard.deactivate(AccountId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_store_error() {
        let guard = guard();
        let first = owner(&guard, "first@example.com").await;
        guard.store().set_unavailable(true);

        let err = guard.deactivate(first.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[tokio::test]
    async fn record_login_stamps_only_the_login_time() {
        let guard = guard();
        let first = owner(&guard, "first@example.com").await;

        guard.record_login(first.id).await.unwrap();
        let stamped = guard.get(first.id).await.unwrap();
        assert!(stamped.last_login_at.is_some());
        assert_eq!(stamped.updated_at, first.updated_at);

        let err = guard.record_login(AccountId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    /// Store that yields once before stamping a login, letting guarded
    /// changes run in between.
    struct SlowLoginStore {
        inner: Arc<InMemoryAccountStore>,
    }

    #[async_trait::async_trait]
    impl AccountStore for SlowLoginStore {
        async fn insert(&self, account: &AdminAccount) -> PipelineResult<()> {
            self.inner.insert(account).await
        }

        async fn get(&self, id: AccountId) -> PipelineResult<Option<AdminAccount>> {
            self.inner.get(id).await
        }

        async fn find_by_email(&self, email: &str) -> PipelineResult<Option<AdminAccount>> {
            self.inner.find_by_email(email).await
        }

        async fn list(&self) -> PipelineResult<Vec<AdminAccount>> {
            self.inner.list().await
        }

        async fn update(&self, account: &AdminAccount) -> PipelineResult<()> {
            self.inner.update(account).await
        }

        async fn touch_login(&self, id: AccountId, at: chrono::DateTime<chrono::Utc>) -> PipelineResult<bool> {
            tokio::task::yield_now().await;
            self.inner.touch_login(id, at).await
        }

        async fn delete(&self, id: AccountId) -> PipelineResult<bool> {
            self.inner.delete(id).await
        }

        async fn count_active_owners(&self) -> PipelineResult<usize> {
            self.inner.count_active_owners().await
        }
    }

    #[tokio::test]
    async fn login_stamp_racing_owner_changes_keeps_an_active_owner() {
        let inner = InMemoryAccountStore::arc();
        let guard = AccountGuard::new(SlowLoginStore { inner: inner.clone() });
        let a = guard
            .invite(NewAdminAccount::new("a@example.com", AccountRole::Owner))
            .await
            .unwrap();
        let b = guard
            .invite(NewAdminAccount::new("b@example.com", AccountRole::Owner))
            .await
            .unwrap();
        guard.deactivate(b.id).await.unwrap();

        let (login, handover) = tokio::join!(guard.record_login(b.id), async {
            guard.reactivate(b.id).await?;
            guard.deactivate(a.id).await
        });
        login.unwrap();
        handover.unwrap();

        let b = guard.get(b.id).await.unwrap();
        assert_eq!(b.status, AccountStatus::Active);
        assert!(b.last_login_at.is_some());
        assert_eq!(guard.get(a.id).await.unwrap().status, AccountStatus::Inactive);
        assert!(inner.count_active_owners().await.unwrap() >= 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deactivate(usize),
        Reactivate(usize),
        Delete(usize),
        Demote(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..6).prop_map(Op::Deactivate),
            (0usize..6).prop_map(Op::Reactivate),
            (0usize..6).prop_map(Op::Delete),
            (0usize..6).prop_map(Op::Demote),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: no sequence of guarded operations leaves zero active
        /// owners, and a refused operation leaves its target unchanged.
        #[test]
        fn active_owner_count_never_reaches_zero(
            owners in 1usize..4,
            ops in prop::collection::vec(op_strategy(), 1..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let guard = guard();
                let mut ids = Vec::new();
                for i in 0..owners {
                    ids.push(owner(&guard, &format!("owner{i}@example.com")).await.id);
                }
                for i in 0..2 {
                    let admin = guard
                        .invite(NewAdminAccount::new(format!("admin{i}@example.com"), AccountRole::Admin))
                        .await
                        .unwrap();
                    ids.push(admin.id);
                }

                for op in ops {
                    let (target, result_kind) = match op {
                        Op::Deactivate(i) => {
                            let id = ids[i % ids.len()];
                            (id, guard.deactivate(id).await.err().map(|e| e.kind()))
                        }
                        Op::Reactivate(i) => {
                            let id = ids[i % ids.len()];
                            (id, guard.reactivate(id).await.err().map(|e| e.kind()))
                        }
                        Op::Delete(i) => {
                            let id = ids[i % ids.len()];
                            (id, guard.delete(id).await.err().map(|e| e.kind()))
                        }
                        Op::Demote(i) => {
                            let id = ids[i % ids.len()];
                            let kind = guard.change_role(id, AccountRole::Admin).await.err().map(|e| e.kind());
                            (id, kind)
                        }
                    };

                    if result_kind == Some(ErrorKind::Forbidden) {
                        let still_there = guard.get(target).await.unwrap();
                        prop_assert!(still_there.is_active_owner());
                    }

                    let active = guard.store().count_active_owners().await.unwrap();
                    prop_assert!(active >= 1);
                }
                Ok(())
            })?;
        }
    }
}
