//! Named background jobs with durable execution logs.
//!
//! ## Design
//!
//! - A job run is one call of [`JobRunner::run`] with a typed [`JobType`]
//! - Each run writes exactly one [`JobExecutionLog`] row at start and updates
//!   it exactly once at the end
//! - The work closure reports a [`BatchOutcome`]; partial item failure is not
//!   a job failure
//! - Errors raised by the work closure become `job-execution-error` results
//!
//! Triggering (cron cadence) is the caller's concern; `run` itself never
//! checks for an in-flight run of the same type. `run_exclusive` does.

pub mod runner;
pub mod store;
pub mod types;

pub use runner::JobRunner;
pub use store::{InMemoryJobLogStore, JobLogStore};
pub use types::{BatchOutcome, JobExecutionLog, JobReport, JobRunStatus, JobStats, JobType};
