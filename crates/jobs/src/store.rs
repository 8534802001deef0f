//! Execution log storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vowline_core::{ExecutionLogId, InMemoryTable, PipelineError, PipelineResult};

use crate::types::{JobExecutionLog, JobRunStatus, JobType};

/// Execution log store abstraction.
#[async_trait]
pub trait JobLogStore: Send + Sync {
    /// Create the `running` row of a new run.
    async fn insert(&self, log: &JobExecutionLog) -> PipelineResult<()>;

    /// Overwrite the row with its final state.
    async fn finish(&self, log: &JobExecutionLog) -> PipelineResult<()>;

    async fn get(&self, id: ExecutionLogId) -> PipelineResult<Option<JobExecutionLog>>;

    /// Most recent runs first, optionally filtered by job type.
    async fn recent(&self, job_type: Option<JobType>, limit: usize) -> PipelineResult<Vec<JobExecutionLog>>;

    /// Runs started at or after `since` (all runs when `None`).
    async fn started_since(
        &self,
        job_type: Option<JobType>,
        since: Option<DateTime<Utc>>,
    ) -> PipelineResult<Vec<JobExecutionLog>>;

    /// Whether a run of `job_type` is currently `running`.
    async fn has_running(&self, job_type: JobType) -> PipelineResult<bool>;

    /// Delete finished runs started before `cutoff`. Returns the number removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64>;
}

#[async_trait]
impl<S> JobLogStore for Arc<S>
where
    S: JobLogStore + ?Sized,
{
    async fn insert(&self, log: &JobExecutionLog) -> PipelineResult<()> {
        (**self).insert(log).await
    }

    async fn finish(&self, log: &JobExecutionLog) -> PipelineResult<()> {
        (**self).finish(log).await
    }

    async fn get(&self, id: ExecutionLogId) -> PipelineResult<Option<JobExecutionLog>> {
        (**self).get(id).await
    }

    async fn recent(&self, job_type: Option<JobType>, limit: usize) -> PipelineResult<Vec<JobExecutionLog>> {
        (**self).recent(job_type, limit).await
    }

    async fn started_since(
        &self,
        job_type: Option<JobType>,
        since: Option<DateTime<Utc>>,
    ) -> PipelineResult<Vec<JobExecutionLog>> {
        (**self).started_since(job_type, since).await
    }

    async fn has_running(&self, job_type: JobType) -> PipelineResult<bool> {
        (**self).has_running(job_type).await
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        (**self).purge_before(cutoff).await
    }
}

/// In-memory execution log store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobLogStore {
    table: InMemoryTable<JobExecutionLog>,
    reject_finish: AtomicBool,
}

impl InMemoryJobLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate a store outage for every call.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.table.set_unavailable(unavailable);
    }

    /// Make only `finish` fail, leaving inserts working.
    pub fn set_reject_finish(&self, reject: bool) {
        self.reject_finish.store(reject, Ordering::SeqCst);
    }
}

fn matches_type(log: &JobExecutionLog, job_type: Option<JobType>) -> bool {
    job_type.is_none_or(|t| log.job_type == t)
}

#[async_trait]
impl JobLogStore for InMemoryJobLogStore {
    async fn insert(&self, log: &JobExecutionLog) -> PipelineResult<()> {
        self.table.insert(log.clone())
    }

    async fn finish(&self, log: &JobExecutionLog) -> PipelineResult<()> {
        if self.reject_finish.load(Ordering::SeqCst) {
            return Err(PipelineError::store("execution log update rejected"));
        }
        let replacement = log.clone();
        self.table
            .update(log.id, move |row| *row = replacement)?
            .ok_or_else(|| PipelineError::not_found(format!("execution log {}", log.id)))
    }

    async fn get(&self, id: ExecutionLogId) -> PipelineResult<Option<JobExecutionLog>> {
        self.table.get(id)
    }

    async fn recent(&self, job_type: Option<JobType>, limit: usize) -> PipelineResult<Vec<JobExecutionLog>> {
        let mut logs = self.table.select(|l| matches_type(l, job_type))?;
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn started_since(
        &self,
        job_type: Option<JobType>,
        since: Option<DateTime<Utc>>,
    ) -> PipelineResult<Vec<JobExecutionLog>> {
        self.table.select(|l| {
            matches_type(l, job_type) && since.is_none_or(|s| l.started_at >= s)
        })
    }

    async fn has_running(&self, job_type: JobType) -> PipelineResult<bool> {
        Ok(self
            .table
            .count(|l| l.job_type == job_type && l.status == JobRunStatus::Running)?
            > 0)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        let expired = self
            .table
            .select(|l| l.started_at < cutoff && l.status.is_terminal())?;
        let mut removed = 0;
        for log in expired {
            if self.table.remove(log.id)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchOutcome;
    use chrono::TimeZone;

    fn log_at(job_type: JobType, hour: u32) -> JobExecutionLog {
        JobExecutionLog::start(job_type, Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_filtered() {
        let store = InMemoryJobLogStore::new();
        for hour in [3, 1, 2] {
            store.insert(&log_at(JobType::WebhookRetry, hour)).await.unwrap();
        }
        store.insert(&log_at(JobType::TempFileCleanup, 4)).await.unwrap();

        let logs = store.recent(Some(JobType::WebhookRetry), 2).await.unwrap();
        let hours: Vec<_> = logs.iter().map(|l| l.started_at.format("%H").to_string()).collect();
        assert_eq!(hours, ["03", "02"]);

        assert_eq!(store.recent(None, 100).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn running_flag_clears_after_finish() {
        let store = InMemoryJobLogStore::new();
        let mut log = log_at(JobType::ExpiredSessionCleanup, 1);
        store.insert(&log).await.unwrap();
        assert!(store.has_running(JobType::ExpiredSessionCleanup).await.unwrap());
        assert!(!store.has_running(JobType::WebhookRetry).await.unwrap());

        log.mark_completed(BatchOutcome::default().into(), log.started_at, 5);
        store.finish(&log).await.unwrap();
        assert!(!store.has_running(JobType::ExpiredSessionCleanup).await.unwrap());
    }

    #[tokio::test]
    async fn purge_keeps_recent_and_running_rows() {
        let store = InMemoryJobLogStore::new();
        let mut old = log_at(JobType::ScheduledEmailProcessing, 1);
        old.mark_failed("db down", old.started_at, 5);
        store.insert(&old).await.unwrap();
        let stuck = log_at(JobType::ScheduledEmailProcessing, 2);
        store.insert(&stuck).await.unwrap();
        let mut fresh = log_at(JobType::ScheduledEmailProcessing, 9);
        fresh.mark_completed(BatchOutcome::new(1, 0).into(), fresh.started_at, 5);
        store.insert(&fresh).await.unwrap();

        let cutoff = Utc.with_ymd_and_hms(2026, 10, 19, 6, 0, 0).unwrap();
        assert_eq!(store.purge_before(cutoff).await.unwrap(), 1);

        assert!(store.get(old.id).await.unwrap().is_none());
        assert!(store.get(stuck.id).await.unwrap().is_some());
        assert!(store.get(fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn finishing_an_unknown_log_is_not_found() {
        let store = InMemoryJobLogStore::new();
        let err = store.finish(&log_at(JobType::WebhookRetry, 1)).await.unwrap_err();
        assert_eq!(err.kind(), vowline_core::ErrorKind::NotFound);
    }
}
