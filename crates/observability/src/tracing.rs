//! Tracing/logging initialization.
//!
//! Job runs, batch items and delivery attempts are logged as structured
//! events; this module decides how they are rendered.

use tracing_subscriber::EnvFilter;

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (production).
    #[default]
    Json,
    /// Human-readable, for local runs.
    Pretty,
}

/// Initialize JSON logging with `RUST_LOG`, falling back to `info`.
pub fn init() {
    init_with(LogFormat::Json, "info");
}

/// Initialize logging with an explicit format and fallback filter.
///
/// `RUST_LOG` still wins when set. Safe to call multiple times.
pub fn init_with(format: LogFormat, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_no_op() {
        init_with(LogFormat::Pretty, "debug");
        init();
        ::tracing::info!(job_type = "scheduled_email_processing", "logging initialized");
    }
}
