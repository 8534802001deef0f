//! `vowline-core`: shared building blocks for the notification pipeline.
//!
//! Pure types only: the error model, strongly-typed identifiers, the injectable
//! clock and a keyed in-memory table used by the dev/test stores.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod memory;

pub use clock::{Clock, FixedClock, SystemClock};
pub use entity::Entity;
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use id::{
    AccountId, DeadlineEntityId, DeliveryLogId, ExecutionLogId, NotificationId, PartyId,
    ReminderRecordId,
};
pub use memory::InMemoryTable;
