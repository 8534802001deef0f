//! Scheduled notification queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vowline_core::{
    Clock, Entity, InMemoryTable, NotificationId, PipelineError, PipelineResult, SystemClock,
};
use vowline_jobs::BatchOutcome;

use crate::delivery::DeliveryRouter;
use crate::message::{OutboundMessage, validate_phone};

/// Default number of notifications handled per `process_due` call.
pub const DEFAULT_BATCH_LIMIT: usize = 100;

/// Default age after which a `processing` row counts as abandoned.
pub const DEFAULT_STALE_AFTER_MINUTES: i64 = 30;

const STALE_MESSAGE: &str = "delivery outcome was not recorded";

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "processing" => Ok(NotificationStatus::Processing),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            "cancelled" => Ok(NotificationStatus::Cancelled),
            other => Err(PipelineError::validation(format!(
                "unknown notification status: {other}"
            ))),
        }
    }

    /// Sent and cancelled notifications are never picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Cancelled)
    }
}

impl core::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message waiting for its send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedNotification {
    pub id: NotificationId,
    pub recipient_address: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub template_ref: Option<String>,
    /// Phone number for the secondary channel.
    pub fallback_address: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedNotification {
    pub fn message(&self) -> OutboundMessage {
        OutboundMessage::new(
            self.recipient_address.clone(),
            self.subject.clone(),
            self.body_html.clone(),
            self.body_text.clone(),
        )
    }
}

impl Entity for QueuedNotification {
    type Id = NotificationId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

/// Input of [`NotificationQueue::schedule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub recipient_address: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub template_ref: Option<String>,
    pub fallback_address: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

impl NewNotification {
    pub fn new(
        recipient_address: impl Into<String>,
        subject: impl Into<String>,
        body_html: impl Into<String>,
        body_text: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            recipient_address: recipient_address.into(),
            subject: subject.into(),
            body_html: body_html.into(),
            body_text: body_text.into(),
            template_ref: None,
            fallback_address: None,
            scheduled_at,
        }
    }

    pub fn with_fallback(mut self, phone: impl Into<String>) -> Self {
        self.fallback_address = Some(phone.into());
        self
    }

    pub fn with_template(mut self, template_ref: impl Into<String>) -> Self {
        self.template_ref = Some(template_ref.into());
        self
    }

    fn validate(&self, now: DateTime<Utc>) -> PipelineResult<()> {
        let recipient = self.recipient_address.trim();
        if recipient.is_empty() || !recipient.contains('@') {
            return Err(PipelineError::validation("invalid recipient email address"));
        }
        if self.subject.trim().is_empty() {
            return Err(PipelineError::validation("subject is required"));
        }
        if self.body_html.trim().is_empty() && self.body_text.trim().is_empty() {
            return Err(PipelineError::validation("either an html or a text body is required"));
        }
        if self.scheduled_at <= now {
            return Err(PipelineError::validation("scheduled time must be in the future"));
        }
        if let Some(phone) = &self.fallback_address {
            validate_phone(phone)?;
        }
        Ok(())
    }
}

/// Result of [`NotificationQueue::retry_failed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub retried: u64,
    /// Items whose requeue write failed.
    pub failed: u64,
    /// Abandoned `processing` rows moved back to `failed` before requeueing.
    pub recovered: u64,
}

/// Per-status counts of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl QueueStats {
    pub fn tally(&mut self, status: NotificationStatus, n: u64) {
        match status {
            NotificationStatus::Pending => self.pending += n,
            NotificationStatus::Processing => self.processing += n,
            NotificationStatus::Sent => self.sent += n,
            NotificationStatus::Failed => self.failed += n,
            NotificationStatus::Cancelled => self.cancelled += n,
        }
        self.total += n;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, notification: &QueuedNotification) -> PipelineResult<()>;

    async fn get(&self, id: NotificationId) -> PipelineResult<Option<QueuedNotification>>;

    /// Overwrite an existing row. Missing id is `not-found`.
    async fn update(&self, notification: &QueuedNotification) -> PipelineResult<()>;

    /// Set `status = to` only if the row is currently `from`.
    ///
    /// Returns `false` when the row is missing or in another status.
    async fn transition(
        &self,
        id: NotificationId,
        from: NotificationStatus,
        to: NotificationStatus,
        at: DateTime<Utc>,
    ) -> PipelineResult<bool>;

    /// Move a `failed` row back to `pending`, bumping `retry_count` and
    /// clearing the error. Returns `false` if the row is no longer `failed`.
    async fn requeue(&self, id: NotificationId, at: DateTime<Utc>) -> PipelineResult<bool>;

    /// Mark every `processing` row last touched before `before` as `failed`
    /// with `message`. Returns the number of rows changed.
    async fn fail_stale(
        &self,
        before: DateTime<Utc>,
        message: &str,
        at: DateTime<Utc>,
    ) -> PipelineResult<u64>;

    /// Pending rows with `scheduled_at <= now`, earliest first, at most `limit`.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> PipelineResult<Vec<QueuedNotification>>;

    /// Failed rows with `retry_count < max_retries`.
    async fn retryable(&self, max_retries: u32) -> PipelineResult<Vec<QueuedNotification>>;

    async fn stats(&self) -> PipelineResult<QueueStats>;
}

#[async_trait]
impl<S> NotificationStore for Arc<S>
where
    S: NotificationStore + ?Sized,
{
    async fn insert(&self, notification: &QueuedNotification) -> PipelineResult<()> {
        (**self).insert(notification).await
    }

    async fn get(&self, id: NotificationId) -> PipelineResult<Option<QueuedNotification>> {
        (**self).get(id).await
    }

    async fn update(&self, notification: &QueuedNotification) -> PipelineResult<()> {
        (**self).update(notification).await
    }

    async fn transition(
        &self,
        id: NotificationId,
        from: NotificationStatus,
        to: NotificationStatus,
        at: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        (**self).transition(id, from, to, at).await
    }

    async fn requeue(&self, id: NotificationId, at: DateTime<Utc>) -> PipelineResult<bool> {
        (**self).requeue(id, at).await
    }

    async fn fail_stale(
        &self,
        before: DateTime<Utc>,
        message: &str,
        at: DateTime<Utc>,
    ) -> PipelineResult<u64> {
        (**self).fail_stale(before, message, at).await
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> PipelineResult<Vec<QueuedNotification>> {
        (**self).due(now, limit).await
    }

    async fn retryable(&self, max_retries: u32) -> PipelineResult<Vec<QueuedNotification>> {
        (**self).retryable(max_retries).await
    }

    async fn stats(&self) -> PipelineResult<QueueStats> {
        (**self).stats().await
    }
}

/// In-memory queue store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    table: InMemoryTable<QueuedNotification>,
    /// Rows whose `update` and `requeue` are rejected.
    rejected: std::sync::Mutex<Vec<NotificationId>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.table.set_unavailable(unavailable);
    }

    /// Make every `update` and `requeue` of `id` fail with a store error.
    /// Status transitions still go through.
    pub fn reject_updates_of(&self, id: NotificationId) {
        self.rejected.lock().unwrap_or_else(|e| e.into_inner()).push(id);
    }

    pub fn clear_rejections(&self) {
        self.rejected.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn is_rejected(&self, id: NotificationId) -> bool {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, notification: &QueuedNotification) -> PipelineResult<()> {
        self.table.insert(notification.clone())
    }

    async fn get(&self, id: NotificationId) -> PipelineResult<Option<QueuedNotification>> {
        self.table.get(id)
    }

    async fn update(&self, notification: &QueuedNotification) -> PipelineResult<()> {
        if self.is_rejected(notification.id) {
            return Err(PipelineError::store(format!(
                "update of notification {} rejected",
                notification.id
            )));
        }
        let replacement = notification.clone();
        self.table
            .update(notification.id, move |row| *row = replacement)?
            .ok_or_else(|| PipelineError::not_found(format!("notification {}", notification.id)))
    }

    async fn transition(
        &self,
        id: NotificationId,
        from: NotificationStatus,
        to: NotificationStatus,
        at: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let changed = self.table.update(id, |row| {
            if row.status != from {
                return false;
            }
            row.status = to;
            row.updated_at = at;
            true
        })?;
        Ok(changed.unwrap_or(false))
    }

    async fn requeue(&self, id: NotificationId, at: DateTime<Utc>) -> PipelineResult<bool> {
        if self.is_rejected(id) {
            return Err(PipelineError::store(format!("requeue of notification {id} rejected")));
        }
        let changed = self.table.update(id, |row| {
            if row.status != NotificationStatus::Failed {
                return false;
            }
            row.status = NotificationStatus::Pending;
            row.retry_count += 1;
            row.error_message = None;
            row.updated_at = at;
            true
        })?;
        Ok(changed.unwrap_or(false))
    }

    async fn fail_stale(
        &self,
        before: DateTime<Utc>,
        message: &str,
        at: DateTime<Utc>,
    ) -> PipelineResult<u64> {
        let stale = self
            .table
            .select(|n| n.status == NotificationStatus::Processing && n.updated_at < before)?;
        let mut changed = 0;
        for notification in stale {
            let moved = self.table.update(notification.id, |row| {
                if row.status != NotificationStatus::Processing || row.updated_at >= before {
                    return false;
                }
                row.status = NotificationStatus::Failed;
                row.error_message = Some(message.to_string());
                row.updated_at = at;
                true
            })?;
            if moved == Some(true) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> PipelineResult<Vec<QueuedNotification>> {
        let mut rows = self
            .table
            .select(|n| n.status == NotificationStatus::Pending && n.scheduled_at <= now)?;
        rows.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn retryable(&self, max_retries: u32) -> PipelineResult<Vec<QueuedNotification>> {
        let mut rows = self
            .table
            .select(|n| n.status == NotificationStatus::Failed && n.retry_count < max_retries)?;
        rows.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn stats(&self) -> PipelineResult<QueueStats> {
        let mut stats = QueueStats::default();
        for row in self.table.select(|_| true)? {
            stats.tally(row.status, 1);
        }
        Ok(stats)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────────

/// Selects due notifications and hands them to the [`DeliveryRouter`].
///
/// Items are processed one at a time. A failing item (delivery or status
/// write) is counted and the batch moves on. Status changes that depend on
/// the current status go through [`NotificationStore::transition`], so a
/// concurrent cancel and batch never both win.
pub struct NotificationQueue<S> {
    store: S,
    router: Arc<DeliveryRouter>,
    clock: Arc<dyn Clock>,
    batch_limit: usize,
    stale_after: chrono::Duration,
}

/// What happened to one selected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    Processed,
    Failed,
    /// Claimed or cancelled by someone else after selection.
    Skipped,
}

impl<S: NotificationStore> NotificationQueue<S> {
    pub fn new(store: S, router: Arc<DeliveryRouter>) -> Self {
        Self::with_clock(store, router, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, router: Arc<DeliveryRouter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            router,
            clock,
            batch_limit: DEFAULT_BATCH_LIMIT,
            stale_after: chrono::Duration::minutes(DEFAULT_STALE_AFTER_MINUTES),
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// Age after which [`retry_failed`](Self::retry_failed) treats a
    /// `processing` row as abandoned.
    pub fn with_stale_after(mut self, window: chrono::Duration) -> Self {
        self.stale_after = window;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Queue a notification for later delivery.
    pub async fn schedule(&self, new: NewNotification) -> PipelineResult<QueuedNotification> {
        let now = self.clock.now();
        new.validate(now)?;

        let notification = QueuedNotification {
            id: NotificationId::new(),
            recipient_address: new.recipient_address.trim().to_string(),
            subject: new.subject,
            body_html: new.body_html,
            body_text: new.body_text,
            template_ref: new.template_ref,
            fallback_address: new.fallback_address,
            scheduled_at: new.scheduled_at,
            status: NotificationStatus::Pending,
            retry_count: 0,
            sent_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&notification).await?;

        debug!(notification_id = %notification.id, scheduled_at = %notification.scheduled_at, "notification scheduled");
        Ok(notification)
    }

    pub async fn get(&self, id: NotificationId) -> PipelineResult<QueuedNotification> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("notification {id}")))
    }

    /// Pending notifications due now, earliest first.
    pub async fn select_due(&self, limit: Option<usize>) -> PipelineResult<Vec<QueuedNotification>> {
        self.store
            .due(self.clock.now(), limit.unwrap_or(self.batch_limit))
            .await
    }

    /// Deliver every due notification of one batch.
    ///
    /// Only a failure to select the batch is an error. Items that another
    /// caller claimed or cancelled after selection are skipped and not
    /// counted.
    pub async fn process_due(&self) -> PipelineResult<BatchOutcome> {
        let batch = self.select_due(None).await?;
        let mut outcome = BatchOutcome::default();
        let mut skipped = 0u64;

        for notification in batch {
            match self.process_one(notification).await {
                ItemResult::Processed => outcome.items_processed += 1,
                ItemResult::Failed => outcome.items_failed += 1,
                ItemResult::Skipped => skipped += 1,
            }
        }

        info!(
            processed = outcome.items_processed,
            failed = outcome.items_failed,
            skipped,
            "scheduled notification batch finished"
        );
        Ok(outcome)
    }

    async fn process_one(&self, mut notification: QueuedNotification) -> ItemResult {
        let id = notification.id;
        let claimed_at = self.clock.now();

        match self
            .store
            .transition(id, NotificationStatus::Pending, NotificationStatus::Processing, claimed_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(notification_id = %id, "notification no longer pending; skipped");
                return ItemResult::Skipped;
            }
            Err(e) => {
                warn!(notification_id = %id, error = %e, "could not mark notification processing");
                return ItemResult::Failed;
            }
        }

        let delivered = self
            .router
            .deliver(&notification.message(), notification.fallback_address.as_deref())
            .await;

        let now = self.clock.now();
        notification.updated_at = now;
        let result = match &delivered {
            Ok(receipt) => {
                notification.status = NotificationStatus::Sent;
                notification.sent_at = Some(now);
                notification.error_message = None;
                debug!(notification_id = %id, channel = %receipt.channel, "notification sent");
                ItemResult::Processed
            }
            Err(e) => {
                notification.status = NotificationStatus::Failed;
                notification.error_message = Some(failure_text(e));
                warn!(notification_id = %id, error = %e, "notification delivery failed");
                ItemResult::Failed
            }
        };

        // The row stays `processing` until a retry pass finds it stale.
        if let Err(e) = self.store.update(&notification).await {
            warn!(
                notification_id = %id,
                status = %notification.status,
                error = %e,
                "could not record notification outcome"
            );
            return ItemResult::Failed;
        }
        result
    }

    /// Requeue failed notifications that have not reached `max_retries`.
    ///
    /// `processing` rows untouched for longer than the stale window are first
    /// marked failed, so an item whose outcome was never recorded is retried
    /// (and may be delivered twice). Nothing is delivered here; requeued
    /// items go out on the next `process_due`.
    pub async fn retry_failed(&self, max_retries: u32) -> PipelineResult<RetryOutcome> {
        let now = self.clock.now();
        let mut outcome = RetryOutcome {
            recovered: self
                .store
                .fail_stale(now - self.stale_after, STALE_MESSAGE, now)
                .await?,
            ..RetryOutcome::default()
        };
        if outcome.recovered > 0 {
            warn!(recovered = outcome.recovered, "abandoned notifications marked failed");
        }

        let candidates = self.store.retryable(max_retries).await?;
        for notification in candidates {
            match self.store.requeue(notification.id, self.clock.now()).await {
                Ok(true) => outcome.retried += 1,
                Ok(false) => {
                    debug!(notification_id = %notification.id, "notification changed before requeue; skipped");
                }
                Err(e) => {
                    warn!(notification_id = %notification.id, error = %e, "could not requeue notification");
                    outcome.failed += 1;
                }
            }
        }

        info!(
            retried = outcome.retried,
            failed = outcome.failed,
            recovered = outcome.recovered,
            "failed notifications requeued"
        );
        Ok(outcome)
    }

    /// Cancel a pending notification.
    ///
    /// The change only applies while the row is still `pending`; any other
    /// status is returned unchanged. Unknown ids are `not-found`.
    pub async fn cancel(&self, id: NotificationId) -> PipelineResult<QueuedNotification> {
        let cancelled = self
            .store
            .transition(id, NotificationStatus::Pending, NotificationStatus::Cancelled, self.clock.now())
            .await?;

        let notification = self.get(id).await?;
        if cancelled {
            info!(notification_id = %id, "notification cancelled");
        } else {
            debug!(notification_id = %id, status = %notification.status, "cancel ignored");
        }
        Ok(notification)
    }

    pub async fn stats(&self) -> PipelineResult<QueueStats> {
        self.store.stats().await
    }
}

fn failure_text(err: &PipelineError) -> String {
    match err.cause() {
        Some(cause) => format!("{} (after: {})", err.message(), cause.message()),
        None => err.message().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryChannel, DeliveryLogStore, DeliveryStatus, InMemoryDeliveryLogStore};
    use crate::transport::{ScriptedTransport, SentMessage};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use vowline_core::{ErrorKind, FixedClock};

    struct Harness {
        queue: NotificationQueue<Arc<InMemoryNotificationStore>>,
        store: Arc<InMemoryNotificationStore>,
        mail: Arc<ScriptedTransport>,
        sms: Arc<ScriptedTransport>,
        log: Arc<InMemoryDeliveryLogStore>,
        clock: Arc<FixedClock>,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let clock = Arc::new(FixedClock::new(start()));
        let mail = ScriptedTransport::arc("m");
        let sms = ScriptedTransport::arc("s");
        let log = InMemoryDeliveryLogStore::arc();
        let router = Arc::new(DeliveryRouter::with_clock(
            mail.clone(),
            sms.clone(),
            log.clone(),
            clock.clone(),
        ));
        let store = InMemoryNotificationStore::arc();
        let queue = NotificationQueue::with_clock(store.clone(), router, clock.clone());
        Harness { queue, store, mail, sms, log, clock }
    }

    fn note(to: &str, minutes: i64) -> NewNotification {
        NewNotification::new(
            to,
            "Seating chart is live",
            "<p>Find your table</p>",
            "Find your table",
            start() + Duration::minutes(minutes),
        )
    }

    #[tokio::test]
    async fn mixed_batch_counts_each_item_once() {
        let h = harness();
        let a = h.queue.schedule(note("a@example.com", 1)).await.unwrap();
        let b = h
            .queue
            .schedule(note("b@example.com", 2).with_fallback("+15550000002"))
            .await
            .unwrap();
        let c = h.queue.schedule(note("c@example.com", 3)).await.unwrap();
        h.clock.advance(Duration::minutes(10));

        h.mail.push_reply(Ok(SentMessage::new("m1")));
        h.mail.fail_for("b@example.com", "mailbox unavailable");
        h.mail.fail_for("c@example.com", "domain does not exist");
        h.sms.push_reply(Ok(SentMessage::new("s1")));

        let outcome = h.queue.process_due().await.unwrap();
        assert_eq!(outcome, BatchOutcome::new(2, 1));

        assert_eq!(h.queue.get(a.id).await.unwrap().status, NotificationStatus::Sent);
        let b = h.queue.get(b.id).await.unwrap();
        assert_eq!(b.status, NotificationStatus::Sent);
        assert!(b.sent_at.is_some());
        let c = h.queue.get(c.id).await.unwrap();
        assert_eq!(c.status, NotificationStatus::Failed);
        assert_eq!(c.error_message.as_deref(), Some("domain does not exist"));

        let secondary = h.log.by_recipient("+15550000002").await.unwrap();
        assert_eq!(secondary[0].channel, DeliveryChannel::Secondary);
        assert_eq!(secondary[0].provider_message_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn only_due_pending_items_are_selected_in_order() {
        let h = harness();
        let late = h.queue.schedule(note("late@example.com", 5)).await.unwrap();
        let early = h.queue.schedule(note("early@example.com", 1)).await.unwrap();
        h.queue.schedule(note("future@example.com", 120)).await.unwrap();
        let cancelled = h.queue.schedule(note("gone@example.com", 2)).await.unwrap();
        h.queue.cancel(cancelled.id).await.unwrap();
        h.clock.advance(Duration::minutes(10));

        let due = h.queue.select_due(None).await.unwrap();
        let ids: Vec<_> = due.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);

        assert_eq!(h.queue.select_due(Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_limit_caps_one_pass() {
        let h = harness();
        for i in 0..5 {
            h.queue.schedule(note(&format!("g{i}@example.com"), 1)).await.unwrap();
        }
        h.clock.advance(Duration::minutes(2));
        let router = Arc::new(DeliveryRouter::new(h.mail.clone(), h.sms.clone(), h.log.clone()));
        let queue = NotificationQueue::with_clock(h.store.clone(), router, h.clock.clone())
            .with_batch_limit(3);

        assert_eq!(queue.process_due().await.unwrap(), BatchOutcome::new(3, 0));
        assert_eq!(queue.process_due().await.unwrap(), BatchOutcome::new(2, 0));
        assert_eq!(queue.process_due().await.unwrap(), BatchOutcome::default());
    }

    #[tokio::test]
    async fn failing_outcome_write_counts_item_as_failed() {
        let h = harness();
        let stuck = h.queue.schedule(note("stuck@example.com", 1)).await.unwrap();
        h.queue.schedule(note("fine@example.com", 2)).await.unwrap();
        h.store.reject_updates_of(stuck.id);
        h.clock.advance(Duration::minutes(5));

        let outcome = h.queue.process_due().await.unwrap();
        assert_eq!(outcome, BatchOutcome::new(1, 1));
        assert_eq!(h.mail.sent().len(), 2);
        assert_eq!(h.queue.get(stuck.id).await.unwrap().status, NotificationStatus::Processing);
    }

    #[tokio::test]
    async fn stranded_processing_row_is_recovered_after_the_stale_window() {
        let h = harness();
        let stuck = h.queue.schedule(note("stuck@example.com", 1)).await.unwrap();
        h.store.reject_updates_of(stuck.id);
        h.clock.advance(Duration::minutes(5));
        h.queue.process_due().await.unwrap();
        h.store.clear_rejections();

        h.clock.advance(Duration::minutes(10));
        assert_eq!(h.queue.retry_failed(3).await.unwrap(), RetryOutcome::default());
        assert_eq!(h.queue.get(stuck.id).await.unwrap().status, NotificationStatus::Processing);

        h.clock.advance(Duration::minutes(21));
        let outcome = h.queue.retry_failed(3).await.unwrap();
        assert_eq!(outcome, RetryOutcome { retried: 1, failed: 0, recovered: 1 });
        let row = h.queue.get(stuck.id).await.unwrap();
        assert_eq!(row.status, NotificationStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.error_message, None);
    }

    #[tokio::test]
    async fn stale_window_is_configurable() {
        let h = harness();
        let router = Arc::new(DeliveryRouter::with_clock(
            h.mail.clone(),
            h.sms.clone(),
            h.log.clone(),
            h.clock.clone(),
        ));
        let queue = NotificationQueue::with_clock(h.store.clone(), router, h.clock.clone())
            .with_stale_after(Duration::minutes(2));
        let stuck = queue.schedule(note("stuck@example.com", 1)).await.unwrap();
        h.store.reject_updates_of(stuck.id);
        h.clock.advance(Duration::minutes(5));
        queue.process_due().await.unwrap();
        h.store.clear_rejections();

        h.clock.advance(Duration::minutes(3));
        // Ceiling of zero: recovered to failed, not requeued.
        let outcome = queue.retry_failed(0).await.unwrap();
        assert_eq!(outcome, RetryOutcome { retried: 0, failed: 0, recovered: 1 });
        let row = queue.get(stuck.id).await.unwrap();
        assert_eq!(row.status, NotificationStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("delivery outcome was not recorded"));
    }

    #[tokio::test]
    async fn selection_failure_is_an_error() {
        let h = harness();
        h.store.set_unavailable(true);
        let err = h.queue.process_due().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[tokio::test]
    async fn retry_requeues_below_ceiling_only() {
        let h = harness();
        let n = h.queue.schedule(note("flaky@example.com", 1)).await.unwrap();
        h.mail.fail_for("flaky@example.com", "timeout");
        h.clock.advance(Duration::minutes(2));

        for expected_retries in 1..=2 {
            h.queue.process_due().await.unwrap();
            let outcome = h.queue.retry_failed(2).await.unwrap();
            assert_eq!(outcome, RetryOutcome { retried: 1, failed: 0, recovered: 0 });

            let row = h.queue.get(n.id).await.unwrap();
            assert_eq!(row.status, NotificationStatus::Pending);
            assert_eq!(row.retry_count, expected_retries);
            assert_eq!(row.error_message, None);
        }

        h.queue.process_due().await.unwrap();
        assert_eq!(h.queue.retry_failed(2).await.unwrap(), RetryOutcome::default());
        assert_eq!(h.queue.get(n.id).await.unwrap().status, NotificationStatus::Failed);
    }

    #[tokio::test]
    async fn retry_counts_failed_requeue_writes() {
        let h = harness();
        let n = h.queue.schedule(note("flaky@example.com", 1)).await.unwrap();
        h.mail.fail_for("flaky@example.com", "timeout");
        h.clock.advance(Duration::minutes(2));
        h.queue.process_due().await.unwrap();

        h.store.reject_updates_of(n.id);
        let outcome = h.queue.retry_failed(3).await.unwrap();
        assert_eq!(outcome, RetryOutcome { retried: 0, failed: 1, recovered: 0 });
    }

    #[tokio::test]
    async fn cancel_is_idempotent_for_terminal_items() {
        let h = harness();
        let pending = h.queue.schedule(note("a@example.com", 1)).await.unwrap();
        let sent = h.queue.schedule(note("b@example.com", 1)).await.unwrap();
        let cancelled = h.queue.cancel(pending.id).await.unwrap();
        assert_eq!(cancelled.status, NotificationStatus::Cancelled);

        h.clock.advance(Duration::minutes(5));
        h.queue.process_due().await.unwrap();

        let again = h.queue.cancel(pending.id).await.unwrap();
        assert_eq!(again.status, NotificationStatus::Cancelled);
        let still_sent = h.queue.cancel(sent.id).await.unwrap();
        assert_eq!(still_sent.status, NotificationStatus::Sent);

        let err = h.queue.cancel(NotificationId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    /// Store that yields once around the first `pending -> processing`
    /// claim, letting a concurrent caller run in between.
    struct YieldingStore {
        inner: Arc<InMemoryNotificationStore>,
        yield_before_claim: bool,
        yielded: std::sync::atomic::AtomicBool,
    }

    impl YieldingStore {
        fn new(inner: Arc<InMemoryNotificationStore>, yield_before_claim: bool) -> Arc<Self> {
            Arc::new(Self {
                inner,
                yield_before_claim,
                yielded: std::sync::atomic::AtomicBool::new(false),
            })
        }

        async fn maybe_yield(&self, to: NotificationStatus, before: bool) {
            if to == NotificationStatus::Processing
                && before == self.yield_before_claim
                && !self.yielded.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                tokio::task::yield_now().await;
            }
        }
    }

    #[async_trait]
    impl NotificationStore for YieldingStore {
        async fn insert(&self, notification: &QueuedNotification) -> PipelineResult<()> {
            self.inner.insert(notification).await
        }

        async fn get(&self, id: NotificationId) -> PipelineResult<Option<QueuedNotification>> {
            self.inner.get(id).await
        }

        async fn update(&self, notification: &QueuedNotification) -> PipelineResult<()> {
            self.inner.update(notification).await
        }

        async fn transition(
            &self,
            id: NotificationId,
            from: NotificationStatus,
            to: NotificationStatus,
            at: DateTime<Utc>,
        ) -> PipelineResult<bool> {
            self.maybe_yield(to, true).await;
            let changed = self.inner.transition(id, from, to, at).await?;
            self.maybe_yield(to, false).await;
            Ok(changed)
        }

        async fn requeue(&self, id: NotificationId, at: DateTime<Utc>) -> PipelineResult<bool> {
            self.inner.requeue(id, at).await
        }

        async fn fail_stale(
            &self,
            before: DateTime<Utc>,
            message: &str,
            at: DateTime<Utc>,
        ) -> PipelineResult<u64> {
            self.inner.fail_stale(before, message, at).await
        }

        async fn due(&self, now: DateTime<Utc>, limit: usize) -> PipelineResult<Vec<QueuedNotification>> {
            self.inner.due(now, limit).await
        }

        async fn retryable(&self, max_retries: u32) -> PipelineResult<Vec<QueuedNotification>> {
            self.inner.retryable(max_retries).await
        }

        async fn stats(&self) -> PipelineResult<QueueStats> {
            self.inner.stats().await
        }
    }

    fn yielding_queue(h: &Harness, yield_before_claim: bool) -> NotificationQueue<Arc<YieldingStore>> {
        let router = Arc::new(DeliveryRouter::with_clock(
            h.mail.clone(),
            h.sms.clone(),
            h.log.clone(),
            h.clock.clone(),
        ));
        NotificationQueue::with_clock(
            YieldingStore::new(h.store.clone(), yield_before_claim),
            router,
            h.clock.clone(),
        )
    }

    #[tokio::test]
    async fn cancel_during_delivery_does_not_overwrite_sent() {
        let h = harness();
        let queue = yielding_queue(&h, false);
        let n = queue.schedule(note("a@example.com", 1)).await.unwrap();
        h.clock.advance(Duration::minutes(2));

        let (batch, cancelled) = tokio::join!(queue.process_due(), queue.cancel(n.id));

        assert_eq!(batch.unwrap(), BatchOutcome::new(1, 0));
        assert_eq!(cancelled.unwrap().status, NotificationStatus::Processing);
        let row = queue.get(n.id).await.unwrap();
        assert_eq!(row.status, NotificationStatus::Sent);
        assert!(row.sent_at.is_some());
        assert_eq!(h.mail.sent().len(), 1);
    }

    #[tokio::test]
    async fn cancel_before_claim_skips_the_item() {
        let h = harness();
        let queue = yielding_queue(&h, true);
        let n = queue.schedule(note("a@example.com", 1)).await.unwrap();
        h.clock.advance(Duration::minutes(2));

        let (batch, cancelled) = tokio::join!(queue.process_due(), queue.cancel(n.id));

        assert_eq!(batch.unwrap(), BatchOutcome::default());
        assert_eq!(cancelled.unwrap().status, NotificationStatus::Cancelled);
        assert_eq!(queue.get(n.id).await.unwrap().status, NotificationStatus::Cancelled);
        assert!(h.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn schedule_validates_input() {
        let h = harness();
        let cases = [
            note("not-an-email", 1),
            NewNotification::new("a@example.com", " ", "<p>x</p>", "", start() + Duration::hours(1)),
            NewNotification::new("a@example.com", "Hi", "", "  ", start() + Duration::hours(1)),
            note("a@example.com", 0),
            note("a@example.com", 1).with_fallback("555-0100"),
        ];
        for case in cases {
            let err = h.queue.schedule(case).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(h.queue.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn stats_count_every_status() {
        let h = harness();
        let keep = h.queue.schedule(note("a@example.com", 1)).await.unwrap();
        h.queue.schedule(note("b@example.com", 1)).await.unwrap();
        h.queue.schedule(note("c@example.com", 60)).await.unwrap();
        h.mail.fail_for("b@example.com", "bounce");
        h.queue.cancel(keep.id).await.unwrap();
        h.clock.advance(Duration::minutes(5));
        h.queue.process_due().await.unwrap();

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn combined_failure_text_mentions_both_channels() {
        let h = harness();
        let n = h
            .queue
            .schedule(note("a@example.com", 1).with_fallback("+15550000009"))
            .await
            .unwrap();
        h.mail.fail_for("a@example.com", "mailbox unavailable");
        h.sms.fail_for("+15550000009", "carrier rejected");
        h.clock.advance(Duration::minutes(2));

        assert_eq!(h.queue.process_due().await.unwrap(), BatchOutcome::new(0, 1));
        let row = h.queue.get(n.id).await.unwrap();
        assert_eq!(
            row.error_message.as_deref(),
            Some("secondary channel failed: carrier rejected (after: mailbox unavailable)")
        );
        let entries = h.log.by_recipient("a@example.com").await.unwrap();
        assert_eq!(entries[0].status, DeliveryStatus::Failed);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: every item of a batch is counted exactly once and a
        /// failing item never blocks a succeeding one.
        #[test]
        fn batch_outcome_accounts_for_every_item(fails in prop::collection::vec(any::<bool>(), 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let h = harness();
                let mut ids = Vec::new();
                for (i, fail) in fails.iter().enumerate() {
                    let to = format!("guest{i}@example.com");
                    if *fail {
                        h.mail.fail_for(to.clone(), "rejected");
                    }
                    ids.push(h.queue.schedule(note(&to, 1 + i as i64)).await.unwrap().id);
                }
                h.clock.advance(Duration::hours(1));

                let outcome = h.queue.process_due().await.unwrap();
                let expected_failed = fails.iter().filter(|f| **f).count() as u64;
                prop_assert_eq!(outcome.items_processed + outcome.items_failed, fails.len() as u64);
                prop_assert_eq!(outcome.items_failed, expected_failed);

                for (id, fail) in ids.iter().zip(&fails) {
                    let status = h.queue.get(*id).await.unwrap().status;
                    let expected = if *fail { NotificationStatus::Failed } else { NotificationStatus::Sent };
                    prop_assert_eq!(status, expected);
                }
                Ok(())
            })?;
        }
    }
}
