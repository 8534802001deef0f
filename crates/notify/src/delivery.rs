//! Primary/secondary delivery with a per-attempt delivery log.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vowline_core::{Clock, DeliveryLogId, Entity, InMemoryTable, PipelineError, PipelineResult, SystemClock};

use crate::message::{OutboundMessage, validate_phone};
use crate::transport::{MailTransport, SentMessage, SmsTransport};

// ─────────────────────────────────────────────────────────────────────────────
// Log records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    /// Electronic mail.
    Primary,
    /// Short text message.
    Secondary,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryChannel::Primary => "primary",
            DeliveryChannel::Secondary => "secondary",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "primary" => Ok(DeliveryChannel::Primary),
            "secondary" => Ok(DeliveryChannel::Secondary),
            other => Err(PipelineError::validation(format!("unknown delivery channel: {other}"))),
        }
    }
}

impl core::fmt::Display for DeliveryChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(PipelineError::validation(format!("unknown delivery status: {other}"))),
        }
    }
}

impl core::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one delivery attempt on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: DeliveryLogId,
    pub recipient_address: String,
    pub channel: DeliveryChannel,
    pub subject: String,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryLogEntry {
    fn attempt(
        channel: DeliveryChannel,
        to: &str,
        subject: &str,
        outcome: &PipelineResult<SentMessage>,
        now: DateTime<Utc>,
    ) -> Self {
        let (status, provider_message_id, sent_at, error_message) = match outcome {
            Ok(sent) => (DeliveryStatus::Sent, Some(sent.id.clone()), Some(now), None),
            Err(e) => (DeliveryStatus::Failed, None, None, Some(e.message().to_string())),
        };
        Self {
            id: DeliveryLogId::new(),
            recipient_address: to.to_string(),
            channel,
            subject: subject.to_string(),
            status,
            provider_message_id,
            sent_at,
            delivered_at: None,
            error_message,
            created_at: now,
        }
    }
}

impl Entity for DeliveryLogEntry {
    type Id = DeliveryLogId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

/// Totals over the delivery log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryAnalytics {
    pub total: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub primary: u64,
    pub secondary: u64,
}

impl DeliveryAnalytics {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DeliveryLogEntry>) -> Self {
        let mut totals = Self::default();
        for entry in entries {
            totals.total += 1;
            match entry.status {
                DeliveryStatus::Sent => totals.sent += 1,
                DeliveryStatus::Delivered => totals.delivered += 1,
                DeliveryStatus::Failed => totals.failed += 1,
            }
            match entry.channel {
                DeliveryChannel::Primary => totals.primary += 1,
                DeliveryChannel::Secondary => totals.secondary += 1,
            }
        }
        totals
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait DeliveryLogStore: Send + Sync {
    async fn insert(&self, entry: &DeliveryLogEntry) -> PipelineResult<()>;

    async fn get(&self, id: DeliveryLogId) -> PipelineResult<Option<DeliveryLogEntry>>;

    /// Overwrite an existing entry. Missing id is `not-found`.
    async fn update(&self, entry: &DeliveryLogEntry) -> PipelineResult<()>;

    /// Entries for one address, oldest first.
    async fn by_recipient(&self, recipient: &str) -> PipelineResult<Vec<DeliveryLogEntry>>;

    /// Totals over entries created at or after `since` (all when `None`).
    async fn analytics(&self, since: Option<DateTime<Utc>>) -> PipelineResult<DeliveryAnalytics>;

    /// Delete entries created before `cutoff`. Returns the number removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64>;
}

#[async_trait]
impl<S> DeliveryLogStore for Arc<S>
where
    S: DeliveryLogStore + ?Sized,
{
    async fn insert(&self, entry: &DeliveryLogEntry) -> PipelineResult<()> {
        (**self).insert(entry).await
    }

    async fn get(&self, id: DeliveryLogId) -> PipelineResult<Option<DeliveryLogEntry>> {
        (**self).get(id).await
    }

    async fn update(&self, entry: &DeliveryLogEntry) -> PipelineResult<()> {
        (**self).update(entry).await
    }

    async fn by_recipient(&self, recipient: &str) -> PipelineResult<Vec<DeliveryLogEntry>> {
        (**self).by_recipient(recipient).await
    }

    async fn analytics(&self, since: Option<DateTime<Utc>>) -> PipelineResult<DeliveryAnalytics> {
        (**self).analytics(since).await
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        (**self).purge_before(cutoff).await
    }
}

/// In-memory delivery log for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeliveryLogStore {
    table: InMemoryTable<DeliveryLogEntry>,
}

impl InMemoryDeliveryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.table.set_unavailable(unavailable);
    }
}

#[async_trait]
impl DeliveryLogStore for InMemoryDeliveryLogStore {
    async fn insert(&self, entry: &DeliveryLogEntry) -> PipelineResult<()> {
        self.table.insert(entry.clone())
    }

    async fn get(&self, id: DeliveryLogId) -> PipelineResult<Option<DeliveryLogEntry>> {
        self.table.get(id)
    }

    async fn update(&self, entry: &DeliveryLogEntry) -> PipelineResult<()> {
        let replacement = entry.clone();
        self.table
            .update(entry.id, move |row| *row = replacement)?
            .ok_or_else(|| PipelineError::not_found(format!("delivery log {}", entry.id)))
    }

    async fn by_recipient(&self, recipient: &str) -> PipelineResult<Vec<DeliveryLogEntry>> {
        let mut entries = self.table.select(|e| e.recipient_address == recipient)?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn analytics(&self, since: Option<DateTime<Utc>>) -> PipelineResult<DeliveryAnalytics> {
        let entries = self
            .table
            .select(|e| since.is_none_or(|s| e.created_at >= s))?;
        Ok(DeliveryAnalytics::from_entries(&entries))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        let old = self.table.select(|e| e.created_at < cutoff)?;
        let mut removed = 0;
        for entry in old {
            if self.table.remove(entry.id)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Where a message was ultimately accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Provider message id.
    pub id: String,
    pub channel: DeliveryChannel,
}

/// Sends through mail first and falls back to SMS when a phone number is known.
///
/// Every attempt is written to the delivery log before `deliver` returns. A log
/// write that fails is reported through tracing only.
pub struct DeliveryRouter {
    mail: Arc<dyn MailTransport>,
    sms: Arc<dyn SmsTransport>,
    log: Arc<dyn DeliveryLogStore>,
    clock: Arc<dyn Clock>,
}

impl DeliveryRouter {
    pub fn new(
        mail: Arc<dyn MailTransport>,
        sms: Arc<dyn SmsTransport>,
        log: Arc<dyn DeliveryLogStore>,
    ) -> Self {
        Self::with_clock(mail, sms, log, Arc::new(SystemClock))
    }

    pub fn with_clock(
        mail: Arc<dyn MailTransport>,
        sms: Arc<dyn SmsTransport>,
        log: Arc<dyn DeliveryLogStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            mail,
            sms,
            log,
            clock,
        }
    }

    pub fn log_store(&self) -> &Arc<dyn DeliveryLogStore> {
        &self.log
    }

    /// Deliver `message`, trying `fallback_address` on the secondary channel if
    /// the primary fails.
    ///
    /// Without a fallback the primary error is returned as is. When both fail,
    /// the error is a transport error whose cause is the primary failure.
    pub async fn deliver(
        &self,
        message: &OutboundMessage,
        fallback_address: Option<&str>,
    ) -> PipelineResult<DeliveryReceipt> {
        let primary = self
            .mail
            .send(&message.to, &message.subject, &message.html, &message.text)
            .await;
        self.record(DeliveryChannel::Primary, &message.to, &message.subject, &primary)
            .await;

        let primary_err = match primary {
            Ok(sent) => {
                debug!(to = %message.to, message_id = %sent.id, "delivered on primary channel");
                return Ok(DeliveryReceipt {
                    id: sent.id,
                    channel: DeliveryChannel::Primary,
                });
            }
            Err(e) => e,
        };

        let Some(phone) = fallback_address.filter(|p| !p.trim().is_empty()) else {
            warn!(to = %message.to, error = %primary_err, "primary delivery failed; no fallback address");
            return Err(primary_err);
        };

        warn!(to = %message.to, error = %primary_err, "primary delivery failed; trying secondary channel");

        let secondary = match validate_phone(phone) {
            Ok(()) => self.sms.send(phone, &message.short_text()).await,
            Err(e) => Err(e),
        };
        self.record(DeliveryChannel::Secondary, phone, &message.subject, &secondary)
            .await;

        match secondary {
            Ok(sent) => {
                info!(to = %phone, message_id = %sent.id, "delivered on secondary channel");
                Ok(DeliveryReceipt {
                    id: sent.id,
                    channel: DeliveryChannel::Secondary,
                })
            }
            Err(e) => {
                warn!(to = %phone, error = %e, "secondary delivery failed");
                Err(PipelineError::transport_after(
                    format!("secondary channel failed: {}", e.message()),
                    primary_err,
                ))
            }
        }
    }

    /// Apply a provider delivery callback to a log entry.
    ///
    /// Only `sent → delivered` and `sent → failed` are accepted.
    pub async fn confirm_delivery(
        &self,
        id: DeliveryLogId,
        status: DeliveryStatus,
        error_message: Option<String>,
    ) -> PipelineResult<DeliveryLogEntry> {
        let mut entry = self
            .log
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("delivery log {id}")))?;

        if entry.status != DeliveryStatus::Sent || status == DeliveryStatus::Sent {
            return Err(PipelineError::validation(format!(
                "cannot move delivery log {id} from {} to {status}",
                entry.status
            )));
        }

        entry.status = status;
        match status {
            DeliveryStatus::Delivered => entry.delivered_at = Some(self.clock.now()),
            DeliveryStatus::Failed => entry.error_message = error_message,
            DeliveryStatus::Sent => {}
        }
        self.log.update(&entry).await?;

        debug!(log_id = %id, status = %status, "delivery status confirmed");
        Ok(entry)
    }

    pub async fn analytics(&self, since: Option<DateTime<Utc>>) -> PipelineResult<DeliveryAnalytics> {
        self.log.analytics(since).await
    }

    async fn record(
        &self,
        channel: DeliveryChannel,
        to: &str,
        subject: &str,
        outcome: &PipelineResult<SentMessage>,
    ) {
        let entry = DeliveryLogEntry::attempt(channel, to, subject, outcome, self.clock.now());
        if let Err(e) = self.log.insert(&entry).await {
            warn!(channel = %channel, to, error = %e, "failed to write delivery log");
        }
    }
}
