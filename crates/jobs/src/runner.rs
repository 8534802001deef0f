//! Job runner: wraps a unit of work with a start/finish execution log.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use vowline_core::{Clock, PipelineError, PipelineResult, SystemClock};

use crate::store::JobLogStore;
use crate::types::{BatchOutcome, JobExecutionLog, JobReport, JobStats, JobType};

/// Default page size of [`JobRunner::recent_logs`].
pub const DEFAULT_LOG_LIMIT: usize = 100;

/// Runs named jobs and records their execution logs.
///
/// One call of [`run`](Self::run) creates exactly one log row and updates it
/// exactly once. The work closure is awaited in place; no task is spawned.
pub struct JobRunner<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: JobLogStore> JobRunner<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute `work` under a fresh execution log.
    ///
    /// - Log creation failure returns a store error and `work` is never called.
    /// - `Ok(outcome)` completes the log, even when `outcome.items_failed > 0`.
    /// - `Err(e)` fails the log with zeroed counts and returns a
    ///   `job-execution-error`.
    /// - A failure to write the final log state is logged and does not change
    ///   the returned result.
    pub async fn run<F, Fut>(&self, job_type: JobType, work: F) -> PipelineResult<JobExecutionLog>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<BatchOutcome>>,
    {
        self.run_reported(job_type, move || async move { work().await.map(JobReport::from) })
            .await
    }

    /// Like [`run`](Self::run), with details stored in the log's `metadata`.
    pub async fn run_reported<F, Fut>(&self, job_type: JobType, work: F) -> PipelineResult<JobExecutionLog>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<JobReport>>,
    {
        let mut log = JobExecutionLog::start(job_type, self.clock.now());
        if let Err(e) = self.store.insert(&log).await {
            error!(job_type = %job_type, error = %e, "failed to create execution log");
            return Err(PipelineError::store(format!(
                "failed to create execution log for {job_type}: {}",
                e.message()
            )));
        }
        debug!(job_type = %job_type, log_id = %log.id, "job started");

        let timer = Instant::now();
        let result = work().await;
        let duration_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);
        let finished_at = self.clock.now();

        match result {
            Ok(report) => {
                let outcome = report.outcome;
                log.mark_completed(report, finished_at, duration_ms);
                self.persist_finish(&log).await;
                info!(
                    job_type = %job_type,
                    log_id = %log.id,
                    duration_ms,
                    items_processed = outcome.items_processed,
                    items_failed = outcome.items_failed,
                    "job completed"
                );
                Ok(log)
            }
            Err(err) => {
                let message = format!("{err:#}");
                log.mark_failed(message.clone(), finished_at, duration_ms);
                self.persist_finish(&log).await;
                warn!(job_type = %job_type, log_id = %log.id, duration_ms, error = %message, "job failed");
                Err(PipelineError::job_execution(format!(
                    "job {job_type} failed: {message}"
                )))
            }
        }
    }

    /// Like [`run`](Self::run), but refuses with `conflict` while a run of the
    /// same type is still marked running.
    ///
    /// The check and the log insert are separate statements, so two callers
    /// racing on the same type can still both start.
    pub async fn run_exclusive<F, Fut>(&self, job_type: JobType, work: F) -> PipelineResult<JobExecutionLog>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<BatchOutcome>>,
    {
        if self.store.has_running(job_type).await? {
            debug!(job_type = %job_type, "skipping run: previous run still in flight");
            return Err(PipelineError::conflict(format!("job {job_type} is already running")));
        }
        self.run(job_type, work).await
    }

    /// Execution history, newest first. `limit` defaults to 100.
    pub async fn recent_logs(
        &self,
        job_type: Option<JobType>,
        limit: Option<usize>,
    ) -> PipelineResult<Vec<JobExecutionLog>> {
        self.store
            .recent(job_type, limit.unwrap_or(DEFAULT_LOG_LIMIT))
            .await
    }

    /// Aggregates over runs started at or after `since`.
    pub async fn stats(
        &self,
        job_type: Option<JobType>,
        since: Option<DateTime<Utc>>,
    ) -> PipelineResult<JobStats> {
        let logs = self.store.started_since(job_type, since).await?;
        Ok(JobStats::from_logs(&logs))
    }

    pub async fn is_running(&self, job_type: JobType) -> PipelineResult<bool> {
        self.store.has_running(job_type).await
    }

    async fn persist_finish(&self, log: &JobExecutionLog) {
        if let Err(e) = self.store.finish(log).await {
            warn!(
                job_type = %log.job_type,
                log_id = %log.id,
                error = %e,
                "failed to record job completion; log left in running state"
            );
        }
    }
}
