//! Job kinds, execution logs and aggregate statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vowline_core::{Entity, ExecutionLogId, PipelineError, PipelineResult};

/// Named background job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    RsvpDeadlineReminders,
    ScheduledEmailProcessing,
    ScheduledEmailRetry,
    WebhookRetry,
    TempFileCleanup,
    ExpiredSessionCleanup,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::RsvpDeadlineReminders,
        JobType::ScheduledEmailProcessing,
        JobType::ScheduledEmailRetry,
        JobType::WebhookRetry,
        JobType::TempFileCleanup,
        JobType::ExpiredSessionCleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::RsvpDeadlineReminders => "rsvp_deadline_reminders",
            JobType::ScheduledEmailProcessing => "scheduled_email_processing",
            JobType::ScheduledEmailRetry => "scheduled_email_retry",
            JobType::WebhookRetry => "webhook_retry",
            JobType::TempFileCleanup => "temp_file_cleanup",
            JobType::ExpiredSessionCleanup => "expired_session_cleanup",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PipelineError::validation(format!("unknown job type: {s}")))
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Pending => "pending",
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "completed",
            JobRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "pending" => Ok(JobRunStatus::Pending),
            "running" => Ok(JobRunStatus::Running),
            "completed" => Ok(JobRunStatus::Completed),
            "failed" => Ok(JobRunStatus::Failed),
            other => Err(PipelineError::validation(format!("unknown job status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobRunStatus::Completed | JobRunStatus::Failed)
    }
}

/// Item counts reported by a job's work closure.
///
/// Items failing inside an otherwise successful batch are counted here and do
/// not fail the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub items_processed: u64,
    pub items_failed: u64,
}

impl BatchOutcome {
    pub fn new(items_processed: u64, items_failed: u64) -> Self {
        Self {
            items_processed,
            items_failed,
        }
    }
}

/// Outcome plus free-form details recorded on the execution log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobReport {
    pub outcome: BatchOutcome,
    pub details: Option<serde_json::Value>,
}

impl JobReport {
    pub fn new(outcome: BatchOutcome, details: serde_json::Value) -> Self {
        Self {
            outcome,
            details: Some(details),
        }
    }
}

impl From<BatchOutcome> for JobReport {
    fn from(outcome: BatchOutcome) -> Self {
        Self {
            outcome,
            details: None,
        }
    }
}

/// Durable record of one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: ExecutionLogId,
    pub job_type: JobType,
    pub status: JobRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub items_processed: u64,
    pub items_failed: u64,
    pub error_message: Option<String>,
    /// Details reported by the work, e.g. per-step counters.
    pub metadata: Option<serde_json::Value>,
}

impl JobExecutionLog {
    /// A fresh `running` row.
    pub fn start(job_type: JobType, started_at: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionLogId::new(),
            job_type,
            status: JobRunStatus::Running,
            started_at,
            completed_at: None,
            duration_ms: None,
            items_processed: 0,
            items_failed: 0,
            error_message: None,
            metadata: None,
        }
    }

    pub fn mark_completed(&mut self, report: JobReport, finished_at: DateTime<Utc>, duration_ms: u64) {
        let outcome = report.outcome;
        self.metadata = report.details;
        self.status = JobRunStatus::Completed;
        self.completed_at = Some(finished_at);
        self.duration_ms = Some(duration_ms);
        self.items_processed = outcome.items_processed;
        self.items_failed = outcome.items_failed;
        self.error_message = None;
    }

    /// A failed run reports zero items regardless of partial progress.
    pub fn mark_failed(&mut self, error: impl Into<String>, finished_at: DateTime<Utc>, duration_ms: u64) {
        self.status = JobRunStatus::Failed;
        self.completed_at = Some(finished_at);
        self.duration_ms = Some(duration_ms);
        self.items_processed = 0;
        self.items_failed = 0;
        self.error_message = Some(error.into());
    }

    pub fn outcome(&self) -> BatchOutcome {
        BatchOutcome::new(self.items_processed, self.items_failed)
    }
}

impl Entity for JobExecutionLog {
    type Id = ExecutionLogId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

/// Aggregates over a set of execution logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Mean over runs that recorded a duration; 0 when none did.
    pub average_duration_ms: f64,
    pub total_items_processed: u64,
    pub total_items_failed: u64,
}

impl JobStats {
    pub fn from_logs<'a>(logs: impl IntoIterator<Item = &'a JobExecutionLog>) -> Self {
        let mut stats = JobStats::default();
        let mut duration_sum = 0u64;
        let mut timed_runs = 0u64;

        for log in logs {
            stats.total_executions += 1;
            match log.status {
                JobRunStatus::Completed => stats.successful_executions += 1,
                JobRunStatus::Failed => stats.failed_executions += 1,
                JobRunStatus::Pending | JobRunStatus::Running => {}
            }
            if let Some(ms) = log.duration_ms {
                duration_sum += ms;
                timed_runs += 1;
            }
            stats.total_items_processed += log.items_processed;
            stats.total_items_failed += log.items_failed;
        }

        if timed_runs > 0 {
            stats.average_duration_ms = duration_sum as f64 / timed_runs as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, 0, 0).unwrap()
    }

    #[test]
    fn job_type_labels_round_trip() {
        for job_type in JobType::ALL {
            assert_eq!(JobType::parse(job_type.as_str()).unwrap(), job_type);
        }
        assert!(JobType::parse("nightly_backup").is_err());
    }

    #[test]
    fn failed_run_zeroes_item_counts() {
        let mut log = JobExecutionLog::start(JobType::WebhookRetry, at(1));
        log.items_processed = 12;
        log.mark_failed("boom", at(2), 40);

        assert_eq!(log.status, JobRunStatus::Failed);
        assert_eq!(log.outcome(), BatchOutcome::default());
        assert_eq!(log.error_message.as_deref(), Some("boom"));
        assert_eq!(log.completed_at, Some(at(2)));
    }

    #[test]
    fn completed_run_keeps_reported_details() {
        let mut log = JobExecutionLog::start(JobType::ScheduledEmailRetry, at(1));
        let report = JobReport::new(
            BatchOutcome::new(3, 1),
            serde_json::json!({ "retried": 3, "recovered": 1 }),
        );
        log.mark_completed(report, at(1), 12);

        assert_eq!(log.outcome(), BatchOutcome::new(3, 1));
        assert_eq!(log.metadata.as_ref().unwrap()["recovered"], 1);
    }

    #[test]
    fn stats_average_only_timed_runs() {
        let mut ok = JobExecutionLog::start(JobType::TempFileCleanup, at(1));
        ok.mark_completed(BatchOutcome::new(5, 1).into(), at(1), 100);
        let mut failed = JobExecutionLog::start(JobType::TempFileCleanup, at(2));
        failed.mark_failed("disk", at(2), 300);
        let running = JobExecutionLog::start(JobType::TempFileCleanup, at(3));

        let stats = JobStats::from_logs([&ok, &failed, &running]);
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.average_duration_ms, 200.0);
        assert_eq!(stats.total_items_processed, 5);
        assert_eq!(stats.total_items_failed, 1);
    }
}
