//! `vowline-accounts`: administrator accounts and the last-owner guard.
//!
//! This crate is decoupled from HTTP and from any concrete storage; the
//! [`AccountStore`] trait is the only seam to persistence.

pub mod account;
pub mod guard;
pub mod store;

pub use account::{AccountRole, AccountStatus, AdminAccount, NewAdminAccount};
pub use guard::AccountGuard;
pub use store::{AccountStore, InMemoryAccountStore};
