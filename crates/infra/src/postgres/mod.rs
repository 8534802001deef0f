//! PostgreSQL-backed stores.
//!
//! Each store wraps an `Arc<PgPool>` and implements one of the store traits of
//! the domain crates, so the in-memory stores and these are interchangeable.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | PipelineError |
//! |------------|-----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (raise exception) | `P0001` | `Forbidden` (last-owner trigger) |
//! | Database (other) | any other | `Store` |
//! | PoolClosed / RowNotFound / other | n/a | `Store` |

mod accounts;
mod deliveries;
mod jobs;
mod notifications;
mod reminders;
mod schema;

pub use accounts::PgAccountStore;
pub use deliveries::PgDeliveryLogStore;
pub use jobs::PgJobLogStore;
pub use notifications::PgNotificationStore;
pub use reminders::PgReminderStore;
pub use schema::ensure_schema;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use vowline_core::{PipelineError, PipelineResult};

const MAX_CONNECTIONS: u32 = 5;

/// Open a connection pool.
pub async fn connect(database_url: &str) -> PipelineResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;
    info!(max_connections = MAX_CONNECTIONS, "connected to postgres");
    Ok(pool)
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PipelineError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => PipelineError::conflict(msg),
                Some("P0001") => PipelineError::forbidden(db_err.message().to_string()),
                _ => PipelineError::store(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            PipelineError::store(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            PipelineError::store(format!("unexpected row not found in {}", operation))
        }
        _ => PipelineError::store(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Row values that fail to map back onto a domain type.
pub(crate) fn decode_error(operation: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::store(format!("failed to decode row in {}: {}", operation, err))
}

/// Counters are stored as `BIGINT`; negative values never reach the domain.
pub(crate) fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

pub(crate) fn to_bigint(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
