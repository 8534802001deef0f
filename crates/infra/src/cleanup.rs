//! Retention cleanup for the job execution log and the delivery log.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{info, warn};

use vowline_core::Clock;
use vowline_jobs::{BatchOutcome, JobLogStore, JobReport};
use vowline_notify::DeliveryLogStore;

pub const DEFAULT_JOB_LOG_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_DELIVERY_LOG_RETENTION_DAYS: u32 = 180;

/// How long each log keeps its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub job_log_days: u32,
    pub delivery_log_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            job_log_days: DEFAULT_JOB_LOG_RETENTION_DAYS,
            delivery_log_days: DEFAULT_DELIVERY_LOG_RETENTION_DAYS,
        }
    }
}

/// Rows removed by one [`LogJanitor::purge`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub job_logs_deleted: u64,
    pub delivery_logs_deleted: u64,
    /// Purge steps that returned an error.
    pub failed_steps: u64,
}

impl CleanupReport {
    pub fn deleted(&self) -> u64 {
        self.job_logs_deleted + self.delivery_logs_deleted
    }

    /// Deleted rows count as processed, failed steps as failed.
    pub fn job_report(&self) -> JobReport {
        let details = serde_json::to_value(self).unwrap_or_default();
        JobReport::new(BatchOutcome::new(self.deleted(), self.failed_steps), details)
    }
}

/// Deletes log rows older than the [`RetentionPolicy`].
///
/// Each log is purged independently; a failing step is counted and the other
/// still runs. Execution logs of runs still in progress are never removed.
pub struct LogJanitor {
    jobs: Arc<dyn JobLogStore>,
    deliveries: Arc<dyn DeliveryLogStore>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
}

impl LogJanitor {
    pub fn new(
        jobs: Arc<dyn JobLogStore>,
        deliveries: Arc<dyn DeliveryLogStore>,
        clock: Arc<dyn Clock>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            jobs,
            deliveries,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub async fn purge(&self) -> CleanupReport {
        let now = self.clock.now();
        let mut report = CleanupReport::default();

        let job_cutoff = now - Duration::days(i64::from(self.policy.job_log_days));
        match self.jobs.purge_before(job_cutoff).await {
            Ok(n) => report.job_logs_deleted = n,
            Err(e) => {
                warn!(error = %e, "could not purge job execution logs");
                report.failed_steps += 1;
            }
        }

        let delivery_cutoff = now - Duration::days(i64::from(self.policy.delivery_log_days));
        match self.deliveries.purge_before(delivery_cutoff).await {
            Ok(n) => report.delivery_logs_deleted = n,
            Err(e) => {
                warn!(error = %e, "could not purge delivery logs");
                report.failed_steps += 1;
            }
        }

        info!(
            job_logs = report.job_logs_deleted,
            delivery_logs = report.delivery_logs_deleted,
            failed_steps = report.failed_steps,
            "log retention cleanup finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use vowline_core::FixedClock;
    use vowline_jobs::{InMemoryJobLogStore, JobExecutionLog, JobType};
    use vowline_notify::{DeliveryRouter, InMemoryDeliveryLogStore, OutboundMessage, ScriptedTransport};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap()
    }

    async fn finished_run(jobs: &InMemoryJobLogStore, at: DateTime<Utc>) {
        let mut log = JobExecutionLog::start(JobType::TempFileCleanup, at);
        jobs.insert(&log).await.unwrap();
        log.mark_completed(BatchOutcome::default().into(), at, 1);
        jobs.finish(&log).await.unwrap();
    }

    #[tokio::test]
    async fn purge_applies_each_retention_window() {
        let clock = Arc::new(FixedClock::new(start() - Duration::days(200)));
        let jobs = InMemoryJobLogStore::arc();
        let deliveries = InMemoryDeliveryLogStore::arc();
        let router = DeliveryRouter::with_clock(
            ScriptedTransport::arc("m"),
            ScriptedTransport::arc("s"),
            deliveries.clone(),
            clock.clone(),
        );
        let message = OutboundMessage::new("ana@example.com", "Save the date", "<p>Hi</p>", "");

        // 200 days back: beyond both windows.
        router.deliver(&message, None).await.unwrap();
        finished_run(&jobs, clock.now()).await;

        // 40 days back: beyond the job window only.
        clock.set(start() - Duration::days(40));
        router.deliver(&message, None).await.unwrap();
        finished_run(&jobs, clock.now()).await;

        clock.set(start());
        let janitor = LogJanitor::new(jobs.clone(), deliveries.clone(), clock, RetentionPolicy::default());
        let report = janitor.purge().await;

        assert_eq!(
            report,
            CleanupReport { job_logs_deleted: 2, delivery_logs_deleted: 1, failed_steps: 0 }
        );
        assert_eq!(deliveries.analytics(None).await.unwrap().total, 1);
        assert!(jobs.recent(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_step_does_not_stop_the_other() {
        let clock = Arc::new(FixedClock::new(start()));
        let jobs = InMemoryJobLogStore::arc();
        let deliveries = InMemoryDeliveryLogStore::arc();
        jobs.set_unavailable(true);

        let janitor = LogJanitor::new(jobs, deliveries, clock, RetentionPolicy::default());
        let report = janitor.purge().await;
        assert_eq!(report.failed_steps, 1);

        let job_report = report.job_report();
        assert_eq!(job_report.outcome, BatchOutcome::new(0, 1));
        assert_eq!(job_report.details.unwrap()["failed_steps"], 1);
    }
}
