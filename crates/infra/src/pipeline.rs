//! Scheduler entry points wired to concrete stores.
//!
//! An external scheduler calls one of the `*_notifications`, `send_*` or
//! `cleanup_*` methods on its own cadence; each call is one job run with one
//! execution log row.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use vowline_accounts::{
    AccountGuard, AccountStore, AdminAccount, InMemoryAccountStore, NewAdminAccount,
};
use vowline_core::{AccountId, Clock, PipelineError, PipelineResult, SystemClock};
use vowline_jobs::{
    BatchOutcome, InMemoryJobLogStore, JobExecutionLog, JobLogStore, JobReport, JobRunner,
    JobStats, JobType,
};
use vowline_notify::{
    DeliveryLogStore, DeliveryReceipt, DeliveryRouter, InMemoryDeliveryLogStore,
    InMemoryNotificationStore, InMemoryReminderLog, InMemoryReminderSource, MailTransport,
    NotificationQueue, NotificationStore, ReminderLog, ReminderScanner, ReminderSource,
    SmsTransport,
};

use crate::cleanup::LogJanitor;
use crate::config::PipelineConfig;
use crate::invitations::invitation_message;
use crate::postgres::{
    self, PgAccountStore, PgDeliveryLogStore, PgJobLogStore, PgNotificationStore, PgReminderStore,
};

/// The persistence seams of a [`Pipeline`].
#[derive(Clone)]
pub struct PipelineStores {
    pub jobs: Arc<dyn JobLogStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub deliveries: Arc<dyn DeliveryLogStore>,
    pub reminder_source: Arc<dyn ReminderSource>,
    pub reminder_log: Arc<dyn ReminderLog>,
    pub accounts: Arc<dyn AccountStore>,
}

impl PipelineStores {
    /// Fresh in-memory stores (dev/tests).
    pub fn in_memory() -> Self {
        Self {
            jobs: InMemoryJobLogStore::arc(),
            notifications: InMemoryNotificationStore::arc(),
            deliveries: InMemoryDeliveryLogStore::arc(),
            reminder_source: InMemoryReminderSource::arc(),
            reminder_log: InMemoryReminderLog::arc(),
            accounts: InMemoryAccountStore::arc(),
        }
    }

    /// PostgreSQL adapters sharing one pool.
    pub fn postgres(pool: PgPool) -> Self {
        let reminders = Arc::new(PgReminderStore::new(pool.clone()));
        Self {
            jobs: Arc::new(PgJobLogStore::new(pool.clone())),
            notifications: Arc::new(PgNotificationStore::new(pool.clone())),
            deliveries: Arc::new(PgDeliveryLogStore::new(pool.clone())),
            reminder_source: reminders.clone(),
            reminder_log: reminders,
            accounts: Arc::new(PgAccountStore::new(pool)),
        }
    }
}

pub type Queue = NotificationQueue<Arc<dyn NotificationStore>>;
pub type Scanner = ReminderScanner<Arc<dyn ReminderSource>, Arc<dyn ReminderLog>>;

/// Job runner, queue, reminder scanner and account guard over one set of stores.
pub struct Pipeline {
    runner: JobRunner<Arc<dyn JobLogStore>>,
    queue: Queue,
    reminders: Scanner,
    router: Arc<DeliveryRouter>,
    accounts: AccountGuard<Arc<dyn AccountStore>>,
    janitor: LogJanitor,
    max_retries: u32,
    app_url: String,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        stores: PipelineStores,
        mail: Arc<dyn MailTransport>,
        sms: Arc<dyn SmsTransport>,
    ) -> Self {
        Self::with_clock(config, stores, mail, sms, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &PipelineConfig,
        stores: PipelineStores,
        mail: Arc<dyn MailTransport>,
        sms: Arc<dyn SmsTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let janitor = LogJanitor::new(
            stores.jobs.clone(),
            stores.deliveries.clone(),
            clock.clone(),
            config.retention(),
        );

        let router = Arc::new(DeliveryRouter::with_clock(
            mail,
            sms,
            stores.deliveries,
            clock.clone(),
        ));

        let queue = NotificationQueue::with_clock(stores.notifications, router.clone(), clock.clone())
            .with_batch_limit(config.batch_limit)
            .with_stale_after(config.stale_processing());

        let mut reminders = ReminderScanner::with_clock(
            stores.reminder_source,
            stores.reminder_log,
            router.clone(),
            clock.clone(),
        )
        .with_lookahead(config.reminder_lookahead_days)
        .with_app_url(config.app_url.clone());
        if let Some(window) = config.reminder_suppression() {
            reminders = reminders.with_suppression(window);
        }

        Self {
            runner: JobRunner::with_clock(stores.jobs, clock.clone()),
            queue,
            reminders,
            router,
            accounts: AccountGuard::with_clock(stores.accounts, clock),
            janitor,
            max_retries: config.max_retries,
            app_url: config.app_url.clone(),
        }
    }

    /// Pipeline over fresh in-memory stores.
    pub fn in_memory(
        config: &PipelineConfig,
        mail: Arc<dyn MailTransport>,
        sms: Arc<dyn SmsTransport>,
    ) -> Self {
        Self::new(config, PipelineStores::in_memory(), mail, sms)
    }

    /// Connect to `DATABASE_URL`, create the schema and wire the PostgreSQL
    /// adapters.
    pub async fn connect(
        config: &PipelineConfig,
        mail: Arc<dyn MailTransport>,
        sms: Arc<dyn SmsTransport>,
    ) -> PipelineResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| PipelineError::validation("DATABASE_URL is not set"))?;
        let pool = postgres::connect(url).await?;
        postgres::ensure_schema(&pool).await?;
        info!(
            batch_limit = config.batch_limit,
            max_retries = config.max_retries,
            lookahead_days = config.reminder_lookahead_days,
            "pipeline wired to postgres"
        );
        Ok(Self::new(config, PipelineStores::postgres(pool), mail, sms))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduler entry points
    // ─────────────────────────────────────────────────────────────────────────

    /// Deliver every due queued notification.
    pub async fn process_scheduled_notifications(&self) -> PipelineResult<JobExecutionLog> {
        let queue = &self.queue;
        self.runner
            .run(JobType::ScheduledEmailProcessing, move || async move {
                let outcome = queue
                    .process_due()
                    .await
                    .context("selecting due notifications")?;
                Ok(outcome)
            })
            .await
    }

    /// Recover abandoned notifications, then requeue failed ones below the
    /// retry ceiling. The full [`vowline_notify::RetryOutcome`] is kept in
    /// the run's metadata.
    pub async fn retry_failed_notifications(&self) -> PipelineResult<JobExecutionLog> {
        let queue = &self.queue;
        let max_retries = self.max_retries;
        self.runner
            .run_reported(JobType::ScheduledEmailRetry, move || async move {
                let outcome = queue
                    .retry_failed(max_retries)
                    .await
                    .context("selecting failed notifications")?;
                let details = serde_json::to_value(outcome).context("encoding retry outcome")?;
                Ok(JobReport::new(
                    BatchOutcome::new(outcome.retried, outcome.failed),
                    details,
                ))
            })
            .await
    }

    /// Delete execution and delivery log rows past their retention window.
    ///
    /// Runs as the temp-file cleanup job; each failed purge step counts as
    /// one failed item.
    pub async fn cleanup_old_logs(&self) -> PipelineResult<JobExecutionLog> {
        let janitor = &self.janitor;
        self.runner
            .run_reported(JobType::TempFileCleanup, move || async move {
                Ok(janitor.purge().await.job_report())
            })
            .await
    }

    /// Remind guests whose RSVP deadline is inside the lookahead window.
    pub async fn send_deadline_reminders(&self) -> PipelineResult<JobExecutionLog> {
        let reminders = &self.reminders;
        self.runner
            .run(JobType::RsvpDeadlineReminders, move || async move {
                let outcome = reminders
                    .scan()
                    .await
                    .context("loading deadline entities")?;
                Ok(outcome)
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Administrator invitations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create the account and mail the invitation.
    ///
    /// The account is kept when the mail fails; the failure is only logged
    /// and [`resend_invitation`](Self::resend_invitation) can retry it.
    pub async fn invite_admin(&self, invite: NewAdminAccount) -> PipelineResult<AdminAccount> {
        let account = self.accounts.invite(invite).await?;
        if let Err(e) = self.send_invitation(&account).await {
            warn!(account_id = %account.id, error = %e, "invitation mail failed");
        }
        Ok(account)
    }

    /// Mail the invitation again. Delivery errors are returned.
    pub async fn resend_invitation(&self, id: AccountId) -> PipelineResult<DeliveryReceipt> {
        let account = self.accounts.get(id).await?;
        self.send_invitation(&account).await
    }

    async fn send_invitation(&self, account: &AdminAccount) -> PipelineResult<DeliveryReceipt> {
        let message = invitation_message(account, &self.app_url);
        let receipt = self.router.deliver(&message, None).await?;
        info!(account_id = %account.id, message_id = %receipt.id, "invitation mail sent");
        Ok(receipt)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reporting & components
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn job_stats(
        &self,
        job_type: Option<JobType>,
        since: Option<DateTime<Utc>>,
    ) -> PipelineResult<JobStats> {
        self.runner.stats(job_type, since).await
    }

    pub async fn recent_job_logs(
        &self,
        job_type: Option<JobType>,
        limit: Option<usize>,
    ) -> PipelineResult<Vec<JobExecutionLog>> {
        self.runner.recent_logs(job_type, limit).await
    }

    pub fn runner(&self) -> &JobRunner<Arc<dyn JobLogStore>> {
        &self.runner
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn reminders(&self) -> &Scanner {
        &self.reminders
    }

    pub fn router(&self) -> &DeliveryRouter {
        &self.router
    }

    pub fn accounts(&self) -> &AccountGuard<Arc<dyn AccountStore>> {
        &self.accounts
    }

    pub fn janitor(&self) -> &LogJanitor {
        &self.janitor
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
