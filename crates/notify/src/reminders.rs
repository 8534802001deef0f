//! RSVP deadline reminders.
//!
//! A scan walks every event and activity whose RSVP deadline falls inside the
//! lookahead window, finds invited guests without a final answer and sends
//! each of them one reminder through the [`DeliveryRouter`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vowline_core::{
    Clock, DeadlineEntityId, Entity, InMemoryTable, PartyId, PipelineError, PipelineResult,
    ReminderRecordId, SystemClock,
};
use vowline_jobs::BatchOutcome;

use crate::delivery::DeliveryRouter;
use crate::message::OutboundMessage;

pub const DEFAULT_LOOKAHEAD_DAYS: u32 = 7;
pub const DEFAULT_APP_URL: &str = "http://localhost:3000";

const SECONDS_PER_DAY: i64 = 86_400;

// ─────────────────────────────────────────────────────────────────────────────
// Source records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineKind {
    Event,
    Activity,
}

impl DeadlineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlineKind::Event => "event",
            DeadlineKind::Activity => "activity",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "event" => Ok(DeadlineKind::Event),
            "activity" => Ok(DeadlineKind::Activity),
            other => Err(PipelineError::validation(format!("unknown deadline kind: {other}"))),
        }
    }
}

impl core::fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event or activity with an RSVP deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineEntity {
    pub id: DeadlineEntityId,
    pub kind: DeadlineKind,
    pub name: String,
    /// `YYYY-MM-DD` as stored; rows that do not parse are skipped by the scan.
    pub deadline: String,
}

impl DeadlineEntity {
    pub fn new(kind: DeadlineKind, name: impl Into<String>, deadline: NaiveDate) -> Self {
        Self {
            id: DeadlineEntityId::new(),
            kind,
            name: name.into(),
            deadline: deadline.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn deadline_date(&self) -> PipelineResult<NaiveDate> {
        NaiveDate::parse_from_str(self.deadline.trim(), "%Y-%m-%d").map_err(|e| {
            PipelineError::validation(format!(
                "malformed deadline {:?} on {} {}: {e}",
                self.deadline, self.kind, self.id
            ))
        })
    }
}

/// A guest invited to a deadline entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitee {
    pub id: PartyId,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Invitee {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: PartyId::new(),
            name: name.into(),
            email: Some(email.into()),
            phone: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    fn email(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }
}

/// A guest's answer for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Pending,
    Attending,
    Declined,
    Maybe,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Pending => "pending",
            ResponseStatus::Attending => "attending",
            ResponseStatus::Declined => "declined",
            ResponseStatus::Maybe => "maybe",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "pending" => Ok(ResponseStatus::Pending),
            "attending" => Ok(ResponseStatus::Attending),
            "declined" => Ok(ResponseStatus::Declined),
            "maybe" => Ok(ResponseStatus::Maybe),
            other => Err(PipelineError::validation(format!("unknown response status: {other}"))),
        }
    }

    /// Anything other than `pending` is a final answer.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseStatus::Pending)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Candidates & sent records
// ─────────────────────────────────────────────────────────────────────────────

/// A guest due a reminder for one entity. Computed fresh on every scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderCandidate {
    pub subject_id: PartyId,
    pub subject_name: String,
    pub recipient_address: String,
    pub fallback_address: Option<String>,
    pub parent_entity_id: DeadlineEntityId,
    pub parent_entity_kind: DeadlineKind,
    pub parent_entity_name: String,
    pub deadline: NaiveDate,
    pub days_until_deadline: i64,
}

impl ReminderCandidate {
    /// Render the reminder, linking to the guest portal under `app_url`.
    pub fn message(&self, app_url: &str) -> OutboundMessage {
        let portal = format!("{}/guest/rsvp", app_url.trim_end_matches('/'));
        let deadline = format_deadline(self.deadline);
        let days = self.days_until_deadline;
        let name = &self.parent_entity_name;

        let subject = format!("RSVP Reminder: {name} - {days} days left");
        let html = format!(
            "<div>\
             <h2>RSVP Reminder</h2>\
             <p>Hi {guest},</p>\
             <p>We still need your RSVP for <strong>{name}</strong>.</p>\
             <p><strong>Deadline:</strong> {deadline} ({days} days from now)</p>\
             <p><a href=\"{portal}\">Submit your RSVP</a></p>\
             </div>",
            guest = self.subject_name,
        );
        let text = format!(
            "Hi {guest},\n\n\
             We still need your RSVP for {name}.\n\n\
             Deadline: {deadline} ({days} days from now)\n\n\
             Reply on the guest portal: {portal}\n",
            guest = self.subject_name,
        );

        OutboundMessage::new(self.recipient_address.clone(), subject, html, text)
    }
}

/// Audit row written after a reminder was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderSentRecord {
    pub id: ReminderRecordId,
    pub subject_id: PartyId,
    pub parent_entity_id: DeadlineEntityId,
    pub parent_entity_kind: DeadlineKind,
    pub sent_at: DateTime<Utc>,
    pub days_before_deadline: i64,
}

impl Entity for ReminderSentRecord {
    type Id = ReminderRecordId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

/// Reminder counts, overall and per entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderStats {
    pub total_reminders: u64,
    pub by_event: BTreeMap<DeadlineEntityId, u64>,
    pub by_activity: BTreeMap<DeadlineEntityId, u64>,
}

impl ReminderStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ReminderSentRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total_reminders += 1;
            let bucket = match record.parent_entity_kind {
                DeadlineKind::Event => &mut stats.by_event,
                DeadlineKind::Activity => &mut stats.by_activity,
            };
            *bucket.entry(record.parent_entity_id).or_default() += 1;
        }
        stats
    }
}

/// Whole days from `now` until midnight UTC of `deadline`, rounded up.
pub fn days_until(deadline: NaiveDate, now: DateTime<Utc>) -> i64 {
    let due = deadline.and_time(NaiveTime::MIN).and_utc();
    let seconds = (due - now).num_seconds();
    let whole = seconds.div_euclid(SECONDS_PER_DAY);
    if seconds.rem_euclid(SECONDS_PER_DAY) > 0 {
        whole + 1
    } else {
        whole
    }
}

/// `Monday, October 26, 2026`.
pub fn format_deadline(date: NaiveDate) -> String {
    date.format("%A, %B %-d, %Y").to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Read access to entities, invitees and responses.
#[async_trait]
pub trait ReminderSource: Send + Sync {
    /// Entities whose stored deadline lies in `[from, to]`.
    async fn deadline_entities(&self, from: NaiveDate, to: NaiveDate) -> PipelineResult<Vec<DeadlineEntity>>;

    /// Guests who were sent an invitation to `entity`.
    async fn invitees(&self, entity: &DeadlineEntity) -> PipelineResult<Vec<Invitee>>;

    /// Every response `party` gave for `entity`.
    async fn responses(&self, party: PartyId, entity: &DeadlineEntity) -> PipelineResult<Vec<ResponseStatus>>;
}

/// Append-only log of delivered reminders.
#[async_trait]
pub trait ReminderLog: Send + Sync {
    async fn record(&self, record: &ReminderSentRecord) -> PipelineResult<()>;

    /// Latest `sent_at` for this guest and entity.
    async fn last_sent(&self, party: PartyId, entity: DeadlineEntityId) -> PipelineResult<Option<DateTime<Utc>>>;

    /// Records sent at or after `since` (all when `None`).
    async fn records(&self, since: Option<DateTime<Utc>>) -> PipelineResult<Vec<ReminderSentRecord>>;
}

#[async_trait]
impl<S> ReminderSource for Arc<S>
where
    S: ReminderSource + ?Sized,
{
    async fn deadline_entities(&self, from: NaiveDate, to: NaiveDate) -> PipelineResult<Vec<DeadlineEntity>> {
        (**self).deadline_entities(from, to).await
    }

    async fn invitees(&self, entity: &DeadlineEntity) -> PipelineResult<Vec<Invitee>> {
        (**self).invitees(entity).await
    }

    async fn responses(&self, party: PartyId, entity: &DeadlineEntity) -> PipelineResult<Vec<ResponseStatus>> {
        (**self).responses(party, entity).await
    }
}

#[async_trait]
impl<L> ReminderLog for Arc<L>
where
    L: ReminderLog + ?Sized,
{
    async fn record(&self, record: &ReminderSentRecord) -> PipelineResult<()> {
        (**self).record(record).await
    }

    async fn last_sent(&self, party: PartyId, entity: DeadlineEntityId) -> PipelineResult<Option<DateTime<Utc>>> {
        (**self).last_sent(party, entity).await
    }

    async fn records(&self, since: Option<DateTime<Utc>>) -> PipelineResult<Vec<ReminderSentRecord>> {
        (**self).records(since).await
    }
}

#[derive(Debug, Default)]
struct SourceState {
    entities: Vec<DeadlineEntity>,
    invitees: HashMap<DeadlineEntityId, Vec<Invitee>>,
    responses: HashMap<(PartyId, DeadlineEntityId), Vec<ResponseStatus>>,
    broken_entities: Vec<DeadlineEntityId>,
    broken_parties: Vec<PartyId>,
    unavailable: bool,
}

/// In-memory reminder source for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReminderSource {
    state: Mutex<SourceState>,
}

impl InMemoryReminderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add_entity(&self, entity: DeadlineEntity) {
        self.lock().entities.push(entity);
    }

    pub fn invite(&self, entity: DeadlineEntityId, invitee: Invitee) {
        self.lock().invitees.entry(entity).or_default().push(invitee);
    }

    pub fn respond(&self, party: PartyId, entity: DeadlineEntityId, status: ResponseStatus) {
        self.lock().responses.entry((party, entity)).or_default().push(status);
    }

    /// Make the invitee lookup of `entity` fail.
    pub fn break_entity(&self, entity: DeadlineEntityId) {
        self.lock().broken_entities.push(entity);
    }

    /// Make the response lookup of `party` fail.
    pub fn break_party(&self, party: PartyId) {
        self.lock().broken_parties.push(party);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ReminderSource for InMemoryReminderSource {
    async fn deadline_entities(&self, from: NaiveDate, to: NaiveDate) -> PipelineResult<Vec<DeadlineEntity>> {
        let state = self.lock();
        if state.unavailable {
            return Err(PipelineError::store("store unavailable"));
        }
        // Text comparison, the way a date column holding raw strings filters.
        let (from, to) = (from.format("%Y-%m-%d").to_string(), to.format("%Y-%m-%d").to_string());
        Ok(state
            .entities
            .iter()
            .filter(|e| e.deadline.as_str() >= from.as_str() && e.deadline.as_str() <= to.as_str())
            .cloned()
            .collect())
    }

    async fn invitees(&self, entity: &DeadlineEntity) -> PipelineResult<Vec<Invitee>> {
        let state = self.lock();
        if state.broken_entities.contains(&entity.id) {
            return Err(PipelineError::store(format!("guest lookup failed for {}", entity.id)));
        }
        Ok(state.invitees.get(&entity.id).cloned().unwrap_or_default())
    }

    async fn responses(&self, party: PartyId, entity: &DeadlineEntity) -> PipelineResult<Vec<ResponseStatus>> {
        let state = self.lock();
        if state.broken_parties.contains(&party) {
            return Err(PipelineError::store(format!("response lookup failed for {party}")));
        }
        Ok(state.responses.get(&(party, entity.id)).cloned().unwrap_or_default())
    }
}

/// In-memory reminder log for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReminderLog {
    table: InMemoryTable<ReminderSentRecord>,
}

impl InMemoryReminderLog {
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
impl ReminderLog for InMemoryReminderLog {
    async fn record(&self, record: &ReminderSentRecord) -> PipelineResult<()> {
        self.table.insert(record.clone())
    }

    async fn last_sent(&self, party: PartyId, entity: DeadlineEntityId) -> PipelineResult<Option<DateTime<Utc>>> {
        Ok(self
            .table
            .select(|r| r.subject_id == party && r.parent_entity_id == entity)?
            .into_iter()
            .map(|r| r.sent_at)
            .max())
    }

    async fn records(&self, since: Option<DateTime<Utc>>) -> PipelineResult<Vec<ReminderSentRecord>> {
        let mut records = self.table.select(|r| since.is_none_or(|s| r.sent_at >= s))?;
        records.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scanner
// ─────────────────────────────────────────────────────────────────────────────

/// Finds guests with outstanding RSVPs near a deadline and reminds them.
///
/// By default every scan reminds every outstanding guest again. With
/// [`with_suppression`](Self::with_suppression), a guest already reminded for
/// the same entity inside the window is skipped.
pub struct ReminderScanner<S, L> {
    source: S,
    log: L,
    router: Arc<DeliveryRouter>,
    clock: Arc<dyn Clock>,
    lookahead_days: u32,
    suppression: Option<chrono::Duration>,
    app_url: String,
}

impl<S: ReminderSource, L: ReminderLog> ReminderScanner<S, L> {
    pub fn new(source: S, log: L, router: Arc<DeliveryRouter>) -> Self {
        Self::with_clock(source, log, router, Arc::new(SystemClock))
    }

    pub fn with_clock(source: S, log: L, router: Arc<DeliveryRouter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            log,
            router,
            clock,
            lookahead_days: DEFAULT_LOOKAHEAD_DAYS,
            suppression: None,
            app_url: DEFAULT_APP_URL.to_string(),
        }
    }

    pub fn with_lookahead(mut self, days: u32) -> Self {
        self.lookahead_days = days;
        self
    }

    pub fn with_suppression(mut self, window: chrono::Duration) -> Self {
        self.suppression = Some(window);
        self
    }

    pub fn with_app_url(mut self, app_url: impl Into<String>) -> Self {
        self.app_url = app_url.into();
        self
    }

    pub fn lookahead_days(&self) -> u32 {
        self.lookahead_days
    }

    /// Guests due a reminder right now.
    ///
    /// Only the entity query can fail the call. Malformed entities and failing
    /// per-entity or per-guest lookups are logged and skipped.
    pub async fn find_candidates(&self) -> PipelineResult<Vec<ReminderCandidate>> {
        let now = self.clock.now();
        let today = now.date_naive();
        let until = today
            .checked_add_days(Days::new(u64::from(self.lookahead_days)))
            .ok_or_else(|| PipelineError::validation("reminder window out of range"))?;

        let entities = self.source.deadline_entities(today, until).await?;
        let mut candidates = Vec::new();

        for entity in entities {
            let deadline = match entity.deadline_date() {
                Ok(date) => date,
                Err(e) => {
                    warn!(entity_id = %entity.id, error = %e, "skipping entity with malformed deadline");
                    continue;
                }
            };
            if deadline < today || deadline > until {
                debug!(entity_id = %entity.id, %deadline, "deadline outside reminder window");
                continue;
            }

            let invitees = match self.source.invitees(&entity).await {
                Ok(invitees) => invitees,
                Err(e) => {
                    warn!(entity_id = %entity.id, error = %e, "skipping entity: guest lookup failed");
                    continue;
                }
            };

            for invitee in invitees {
                let Some(email) = invitee.email() else {
                    continue;
                };
                if !self.needs_reminder(&invitee, &entity, now).await {
                    continue;
                }

                candidates.push(ReminderCandidate {
                    subject_id: invitee.id,
                    subject_name: invitee.name.clone(),
                    recipient_address: email.to_string(),
                    fallback_address: invitee.phone.clone(),
                    parent_entity_id: entity.id,
                    parent_entity_kind: entity.kind,
                    parent_entity_name: entity.name.clone(),
                    deadline,
                    days_until_deadline: days_until(deadline, now),
                });
            }
        }

        Ok(candidates)
    }

    async fn needs_reminder(&self, invitee: &Invitee, entity: &DeadlineEntity, now: DateTime<Utc>) -> bool {
        match self.source.responses(invitee.id, entity).await {
            Ok(responses) if responses.iter().any(ResponseStatus::is_terminal) => return false,
            Ok(_) => {}
            Err(e) => {
                warn!(party_id = %invitee.id, entity_id = %entity.id, error = %e, "skipping guest: response lookup failed");
                return false;
            }
        }

        let Some(window) = self.suppression else {
            return true;
        };
        match self.log.last_sent(invitee.id, entity.id).await {
            Ok(Some(sent_at)) if sent_at > now - window => {
                debug!(party_id = %invitee.id, entity_id = %entity.id, "reminder suppressed");
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(party_id = %invitee.id, entity_id = %entity.id, error = %e, "skipping guest: reminder history lookup failed");
                false
            }
        }
    }

    /// Send one reminder per candidate.
    pub async fn scan(&self) -> PipelineResult<BatchOutcome> {
        let candidates = self.find_candidates().await?;
        let mut outcome = BatchOutcome::default();

        for candidate in &candidates {
            let message = candidate.message(&self.app_url);
            match self
                .router
                .deliver(&message, candidate.fallback_address.as_deref())
                .await
            {
                Ok(receipt) => {
                    outcome.items_processed += 1;
                    let record = ReminderSentRecord {
                        id: ReminderRecordId::new(),
                        subject_id: candidate.subject_id,
                        parent_entity_id: candidate.parent_entity_id,
                        parent_entity_kind: candidate.parent_entity_kind,
                        sent_at: self.clock.now(),
                        days_before_deadline: candidate.days_until_deadline,
                    };
                    if let Err(e) = self.log.record(&record).await {
                        warn!(party_id = %candidate.subject_id, error = %e, "failed to record sent reminder");
                    }
                    debug!(party_id = %candidate.subject_id, channel = %receipt.channel, "reminder sent");
                }
                Err(e) => {
                    outcome.items_failed += 1;
                    warn!(
                        party_id = %candidate.subject_id,
                        to = %candidate.recipient_address,
                        error = %e,
                        "failed to send reminder"
                    );
                }
            }
        }

        info!(
            candidates = candidates.len(),
            sent = outcome.items_processed,
            failed = outcome.items_failed,
            "rsvp reminder scan finished"
        );
        Ok(outcome)
    }

    pub async fn stats(&self, since: Option<DateTime<Utc>>) -> PipelineResult<ReminderStats> {
        let records = self.log.records(since).await?;
        Ok(ReminderStats::from_records(&records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryChannel, DeliveryLogStore, InMemoryDeliveryLogStore};
    use crate::transport::ScriptedTransport;
    use chrono::{Duration, TimeZone};
    use vowline_core::{ErrorKind, FixedClock};

    type Scanner = ReminderScanner<Arc<InMemoryReminderSource>, Arc<InMemoryReminderLog>>;

    struct Harness {
        scanner: Scanner,
        source: Arc<InMemoryReminderSource>,
        log: Arc<InMemoryReminderLog>,
        mail: Arc<ScriptedTransport>,
        sms: Arc<ScriptedTransport>,
        deliveries: Arc<InMemoryDeliveryLogStore>,
        clock: Arc<FixedClock>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap()
    }

    fn today_plus(days: u64) -> NaiveDate {
        now().date_naive() + Days::new(days)
    }

    fn harness() -> Harness {
        let clock = Arc::new(FixedClock::new(now()));
        let mail = ScriptedTransport::arc("m");
        let sms = ScriptedTransport::arc("s");
        let deliveries = InMemoryDeliveryLogStore::arc();
        let router = Arc::new(DeliveryRouter::with_clock(
            mail.clone(),
            sms.clone(),
            deliveries.clone(),
            clock.clone(),
        ));
        let source = InMemoryReminderSource::arc();
        let log = InMemoryReminderLog::arc();
        let scanner = ReminderScanner::with_clock(source.clone(), log.clone(), router, clock.clone())
            .with_app_url("https://wedding.example.com/");
        Harness { scanner, source, log, mail, sms, deliveries, clock }
    }

    fn event(h: &Harness, name: &str, deadline: NaiveDate) -> DeadlineEntity {
        let entity = DeadlineEntity::new(DeadlineKind::Event, name, deadline);
        h.source.add_entity(entity.clone());
        entity
    }

    fn guest(h: &Harness, entity: &DeadlineEntity, name: &str) -> Invitee {
        let invitee = Invitee::new(name, format!("{}@example.com", name.to_lowercase()));
        h.source.invite(entity.id, invitee.clone());
        invitee
    }

    #[test]
    fn days_until_rounds_up_partial_days() {
        let deadline = NaiveDate::from_ymd_opt(2026, 10, 26).unwrap();
        assert_eq!(days_until(deadline, now()), 7);
        assert_eq!(
            days_until(deadline, Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap()),
            7
        );
        assert_eq!(
            days_until(deadline, Utc.with_ymd_and_hms(2026, 10, 25, 23, 0, 0).unwrap()),
            1
        );
        assert_eq!(
            days_until(deadline, Utc.with_ymd_and_hms(2026, 10, 26, 12, 0, 0).unwrap()),
            0
        );
    }

    #[test]
    fn deadline_formats_as_long_english_date() {
        let deadline = NaiveDate::from_ymd_opt(2026, 10, 26).unwrap();
        assert_eq!(format_deadline(deadline), "Monday, October 26, 2026");
    }

    #[test]
    fn reminder_message_embeds_name_deadline_and_portal() {
        let candidate = ReminderCandidate {
            subject_id: PartyId::new(),
            subject_name: "Ana Mora".into(),
            recipient_address: "ana@example.com".into(),
            fallback_address: None,
            parent_entity_id: DeadlineEntityId::new(),
            parent_entity_kind: DeadlineKind::Activity,
            parent_entity_name: "Sunset Cruise".into(),
            deadline: NaiveDate::from_ymd_opt(2026, 10, 26).unwrap(),
            days_until_deadline: 7,
        };

        let msg = candidate.message("https://wedding.example.com/");
        assert_eq!(msg.subject, "RSVP Reminder: Sunset Cruise - 7 days left");
        assert!(msg.text.contains("Monday, October 26, 2026 (7 days from now)"));
        assert!(msg.text.contains("https://wedding.example.com/guest/rsvp"));
        assert!(msg.html.contains("<strong>Sunset Cruise</strong>"));
    }

    #[tokio::test]
    async fn window_includes_last_day_and_excludes_the_day_after() {
        let h = harness();
        let inside = event(&h, "Welcome Dinner", today_plus(7));
        let outside = event(&h, "Farewell Brunch", today_plus(8));
        guest(&h, &inside, "Ana");
        guest(&h, &outside, "Ben");

        let candidates = h.scanner.find_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].parent_entity_id, inside.id);
        assert!((6..=7).contains(&candidates[0].days_until_deadline));
    }

    #[tokio::test]
    async fn deadline_today_is_included_and_yesterday_is_not() {
        let h = harness();
        let today = event(&h, "Ceremony", today_plus(0));
        guest(&h, &today, "Ana");
        let past = DeadlineEntity::new(DeadlineKind::Event, "Rehearsal", now().date_naive() - Days::new(1));
        h.source.add_entity(past.clone());
        guest(&h, &past, "Ben");

        let candidates = h.scanner.find_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].days_until_deadline, 0);
    }

    #[tokio::test]
    async fn terminal_responses_exclude_the_guest() {
        let h = harness();
        let dinner = event(&h, "Welcome Dinner", today_plus(3));
        let ana = guest(&h, &dinner, "Ana");
        let ben = guest(&h, &dinner, "Ben");
        let cai = guest(&h, &dinner, "Cai");
        h.source.respond(ana.id, dinner.id, ResponseStatus::Attending);
        h.source.respond(ben.id, dinner.id, ResponseStatus::Pending);
        h.source.respond(cai.id, dinner.id, ResponseStatus::Pending);
        h.source.respond(cai.id, dinner.id, ResponseStatus::Declined);

        let candidates = h.scanner.find_candidates().await.unwrap();
        let names: Vec<_> = candidates.iter().map(|c| c.subject_name.as_str()).collect();
        assert_eq!(names, ["Ben"]);
    }

    #[tokio::test]
    async fn guests_without_email_are_skipped() {
        let h = harness();
        let dinner = event(&h, "Welcome Dinner", today_plus(3));
        let mut no_email = Invitee::new("Dee", "");
        no_email.email = None;
        h.source.invite(dinner.id, no_email);
        h.source.invite(dinner.id, Invitee::new("Eve", "   "));

        assert!(h.scanner.find_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_records_are_skipped_not_fatal() {
        let h = harness();
        let broken = event(&h, "Broken Event", today_plus(2));
        guest(&h, &broken, "Ana");
        h.source.break_entity(broken.id);

        let mut malformed = DeadlineEntity::new(DeadlineKind::Activity, "Typo", today_plus(2));
        malformed.deadline.push_str(" ??");
        h.source.add_entity(malformed.clone());
        guest(&h, &malformed, "Ben");

        let fine = event(&h, "Welcome Dinner", today_plus(2));
        let cai = guest(&h, &fine, "Cai");
        let dee = guest(&h, &fine, "Dee");
        h.source.break_party(dee.id);

        let candidates = h.scanner.find_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].subject_id, cai.id);
    }

    #[tokio::test]
    async fn entity_query_failure_fails_the_scan() {
        let h = harness();
        h.source.set_unavailable(true);
        let err = h.scanner.scan().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[tokio::test]
    async fn scan_records_sent_reminders_and_counts_failures() {
        let h = harness();
        let dinner = event(&h, "Welcome Dinner", today_plus(5));
        let ana = guest(&h, &dinner, "Ana");
        let ben = guest(&h, &dinner, "Ben");
        h.mail.fail_for("ben@example.com", "mailbox unavailable");

        let outcome = h.scanner.scan().await.unwrap();
        assert_eq!(outcome, BatchOutcome::new(1, 1));

        let records = h.log.records(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject_id, ana.id);
        assert_eq!(records[0].days_before_deadline, 5);
        assert!(h.log.last_sent(ben.id, dinner.id).await.unwrap().is_none());

        let sent = h.mail.sent();
        assert_eq!(sent[0].subject.as_deref(), Some("RSVP Reminder: Welcome Dinner - 5 days left"));
    }

    #[tokio::test]
    async fn reminders_fall_back_to_the_guest_phone() {
        let h = harness();
        let cruise = DeadlineEntity::new(DeadlineKind::Activity, "Sunset Cruise", today_plus(4));
        h.source.add_entity(cruise.clone());
        let ana = Invitee::new("Ana", "ana@example.com").with_phone("+50688887777");
        h.source.invite(cruise.id, ana.clone());
        h.mail.fail_for("ana@example.com", "mailbox unavailable");

        assert_eq!(h.scanner.scan().await.unwrap(), BatchOutcome::new(1, 0));
        let sms = h.sms.sent();
        assert!(sms[0].body.starts_with("[RSVP Reminder: Sunset Cruise - 4 days left]"));

        let entries = h.deliveries.by_recipient("+50688887777").await.unwrap();
        assert_eq!(entries[0].channel, DeliveryChannel::Secondary);
    }

    #[tokio::test]
    async fn repeated_scans_remind_again_unless_suppressed() {
        let h = harness();
        let dinner = event(&h, "Welcome Dinner", today_plus(5));
        guest(&h, &dinner, "Ana");

        assert_eq!(h.scanner.scan().await.unwrap().items_processed, 1);
        h.clock.advance(Duration::days(1));
        assert_eq!(h.scanner.scan().await.unwrap().items_processed, 1);
        assert_eq!(h.log.records(None).await.unwrap().len(), 2);

        let router = Arc::new(DeliveryRouter::with_clock(
            h.mail.clone(),
            h.sms.clone(),
            h.deliveries.clone(),
            h.clock.clone(),
        ));
        let suppressed = ReminderScanner::with_clock(h.source.clone(), h.log.clone(), router, h.clock.clone())
            .with_suppression(Duration::hours(36));
        assert!(suppressed.find_candidates().await.unwrap().is_empty());

        h.clock.advance(Duration::days(2));
        assert_eq!(suppressed.find_candidates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stats_split_events_and_activities() {
        let h = harness();
        let dinner = event(&h, "Welcome Dinner", today_plus(5));
        let cruise = DeadlineEntity::new(DeadlineKind::Activity, "Sunset Cruise", today_plus(6));
        h.source.add_entity(cruise.clone());
        guest(&h, &dinner, "Ana");
        guest(&h, &dinner, "Ben");
        guest(&h, &cruise, "Cai");

        h.scanner.scan().await.unwrap();
        let stats = h.scanner.stats(None).await.unwrap();
        assert_eq!(stats.total_reminders, 3);
        assert_eq!(stats.by_event.get(&dinner.id), Some(&2));
        assert_eq!(stats.by_activity.get(&cruise.id), Some(&1));

        let later = h.scanner.stats(Some(now() + Duration::hours(1))).await.unwrap();
        assert_eq!(later.total_reminders, 0);
    }
}
