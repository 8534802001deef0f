//! Notification delivery for the wedding site.
//!
//! - [`DeliveryRouter`]: mail first, SMS fallback, one log row per attempt
//! - [`NotificationQueue`]: scheduled messages, processed in bounded batches
//! - [`ReminderScanner`]: RSVP deadline reminders for guests without an answer
//!
//! Queue and scanner return a [`vowline_jobs::BatchOutcome`] so they can run as
//! the work of a job.

pub mod delivery;
pub mod message;
pub mod queue;
pub mod reminders;
pub mod transport;

pub use delivery::{
    DeliveryAnalytics, DeliveryChannel, DeliveryLogEntry, DeliveryLogStore, DeliveryReceipt,
    DeliveryRouter, DeliveryStatus, InMemoryDeliveryLogStore,
};
pub use message::{OutboundMessage, SMS_MAX_CHARS, strip_markup, truncate_chars, validate_phone};
pub use queue::{
    InMemoryNotificationStore, NewNotification, NotificationQueue, NotificationStatus,
    NotificationStore, QueueStats, QueuedNotification, RetryOutcome,
};
pub use reminders::{
    DeadlineEntity, DeadlineKind, InMemoryReminderLog, InMemoryReminderSource, Invitee,
    ReminderCandidate, ReminderLog, ReminderScanner, ReminderSentRecord, ReminderSource,
    ReminderStats, ResponseStatus, days_until, format_deadline,
};
pub use transport::{MailTransport, ScriptedTransport, SendRecord, SentMessage, SmsTransport};
