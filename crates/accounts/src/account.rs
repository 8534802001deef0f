//! Administrator account records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vowline_core::{AccountId, Entity, PipelineError, PipelineResult};

// ─────────────────────────────────────────────────────────────────────────────
// Role & Status
// ─────────────────────────────────────────────────────────────────────────────

/// Privilege level of an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    Admin,
    /// Most privileged role; at least one active owner must always exist.
    Owner,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Admin => "admin",
            AccountRole::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "admin" => Ok(AccountRole::Admin),
            "owner" => Ok(AccountRole::Owner),
            other => Err(PipelineError::validation(format!("unknown account role: {other}"))),
        }
    }
}

impl core::fmt::Display for AccountRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Account can sign in and administer.
    #[default]
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "inactive" => Ok(AccountStatus::Inactive),
            other => Err(PipelineError::validation(format!("unknown account status: {other}"))),
        }
    }
}

impl core::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Account
// ─────────────────────────────────────────────────────────────────────────────

/// An administrator of the wedding site.
///
/// # Invariants
/// - `email` is trimmed, lowercased and unique across accounts.
/// - The number of accounts with `role == Owner && status == Active` never
///   drops below one through [`crate::AccountGuard`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAccount {
    pub id: AccountId,
    pub email: String,
    pub role: AccountRole,
    pub status: AccountStatus,
    pub invited_by: Option<AccountId>,
    pub invited_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdminAccount {
    pub fn is_active_owner(&self) -> bool {
        self.role == AccountRole::Owner && self.status == AccountStatus::Active
    }
}

impl Entity for AdminAccount {
    type Id = AccountId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

/// Input of an invite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAdminAccount {
    pub email: String,
    pub role: AccountRole,
    pub invited_by: Option<AccountId>,
}

impl NewAdminAccount {
    pub fn new(email: impl Into<String>, role: AccountRole) -> Self {
        Self {
            email: email.into(),
            role,
            invited_by: None,
        }
    }

    pub fn invited_by(mut self, inviter: AccountId) -> Self {
        self.invited_by = Some(inviter);
        self
    }

    /// Validate and build the account row.
    pub(crate) fn into_account(self, now: DateTime<Utc>) -> PipelineResult<AdminAccount> {
        let email = normalize_email(&self.email)?;
        Ok(AdminAccount {
            id: AccountId::new(),
            email,
            role: self.role,
            status: AccountStatus::Active,
            invited_by: self.invited_by,
            invited_at: now,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Trim + lowercase, then a basic shape check.
pub fn normalize_email(raw: &str) -> PipelineResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(PipelineError::validation("invalid email format"));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vowline_core::ErrorKind;

    #[test]
    fn email_is_normalized() {
        assert_eq!(normalize_email("  Ana@Example.COM ").unwrap(), "ana@example.com");
    }

    #[test]
    fn malformed_emails_are_rejected() {
        for raw in ["", "no-at-sign", "@example.com", "ana@", "a b@example.com", "a@b@c"] {
            let err = normalize_email(raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{raw:?} should be rejected");
        }
    }

    #[test]
    fn role_and_status_parse_their_own_labels() {
        for role in [AccountRole::Admin, AccountRole::Owner] {
            assert_eq!(AccountRole::parse(role.as_str()).unwrap(), role);
        }
        for status in [AccountStatus::Active, AccountStatus::Inactive] {
            assert_eq!(AccountStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(AccountRole::parse("superuser").is_err());
    }
}
