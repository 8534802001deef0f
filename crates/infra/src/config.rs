//! Pipeline configuration loaded from environment variables.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vowline_notify::queue::DEFAULT_STALE_AFTER_MINUTES;
use vowline_observability::LogFormat;

use crate::cleanup::{
    DEFAULT_DELIVERY_LOG_RETENTION_DAYS, DEFAULT_JOB_LOG_RETENTION_DAYS, RetentionPolicy,
};

pub const DEFAULT_BATCH_LIMIT: usize = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_LOOKAHEAD_DAYS: u32 = 7;
pub const DEFAULT_APP_URL: &str = "http://localhost:3000";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Runtime settings of the notification pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// PostgreSQL URL; in-memory stores are used when absent.
    pub database_url: Option<String>,
    pub batch_limit: usize,
    pub max_retries: u32,
    pub reminder_lookahead_days: u32,
    /// Skip guests reminded for the same entity within this many hours.
    pub reminder_suppress_hours: Option<u32>,
    pub app_url: String,
    /// `processing` rows older than this are recovered by the retry job.
    pub stale_processing_minutes: u32,
    pub job_log_retention_days: u32,
    pub delivery_log_retention_days: u32,
    /// `json` (default) or `pretty`.
    pub log_format: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            batch_limit: DEFAULT_BATCH_LIMIT,
            max_retries: DEFAULT_MAX_RETRIES,
            reminder_lookahead_days: DEFAULT_LOOKAHEAD_DAYS,
            reminder_suppress_hours: None,
            app_url: DEFAULT_APP_URL.to_string(),
            stale_processing_minutes: DEFAULT_STALE_AFTER_MINUTES as u32,
            job_log_retention_days: DEFAULT_JOB_LOG_RETENTION_DAYS,
            delivery_log_retention_days: DEFAULT_DELIVERY_LOG_RETENTION_DAYS,
            log_format: "json".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset or empty variables keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        config.database_url = get("DATABASE_URL");
        if let Some(v) = get("VOWLINE_BATCH_LIMIT") {
            config.batch_limit = parse_positive("VOWLINE_BATCH_LIMIT", &v)?;
        }
        if let Some(v) = get("VOWLINE_MAX_RETRIES") {
            config.max_retries = parse_number("VOWLINE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("VOWLINE_REMINDER_LOOKAHEAD_DAYS") {
            config.reminder_lookahead_days = parse_number("VOWLINE_REMINDER_LOOKAHEAD_DAYS", &v)?;
        }
        if let Some(v) = get("VOWLINE_REMINDER_SUPPRESS_HOURS") {
            config.reminder_suppress_hours =
                Some(parse_positive("VOWLINE_REMINDER_SUPPRESS_HOURS", &v)?);
        }
        if let Some(v) = get("VOWLINE_APP_URL") {
            if !(v.starts_with("http://") || v.starts_with("https://")) {
                return Err(ConfigError::invalid("VOWLINE_APP_URL", &v, "expected an http(s) URL"));
            }
            config.app_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("VOWLINE_STALE_PROCESSING_MINUTES") {
            config.stale_processing_minutes = parse_positive("VOWLINE_STALE_PROCESSING_MINUTES", &v)?;
        }
        if let Some(v) = get("VOWLINE_JOB_LOG_RETENTION_DAYS") {
            config.job_log_retention_days = parse_positive("VOWLINE_JOB_LOG_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("VOWLINE_DELIVERY_LOG_RETENTION_DAYS") {
            config.delivery_log_retention_days =
                parse_positive("VOWLINE_DELIVERY_LOG_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("VOWLINE_LOG_FORMAT") {
            parse_log_format(&v)?;
            config.log_format = v.to_lowercase();
        }

        Ok(config)
    }

    pub fn log_format(&self) -> LogFormat {
        parse_log_format(&self.log_format).unwrap_or_default()
    }

    /// Install the tracing subscriber for this configuration.
    pub fn init_logging(&self) {
        vowline_observability::init_with(self.log_format(), "info");
    }

    pub fn reminder_suppression(&self) -> Option<chrono::Duration> {
        self.reminder_suppress_hours
            .map(|h| chrono::Duration::hours(i64::from(h)))
    }

    pub fn stale_processing(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.stale_processing_minutes))
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            job_log_days: self.job_log_retention_days,
            delivery_log_days: self.delivery_log_retention_days,
        }
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(var, value, e.to_string()))
}

fn parse_positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse_number(var, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::invalid(var, value, "must be greater than zero"));
    }
    Ok(parsed)
}

fn parse_log_format(value: &str) -> Result<LogFormat, ConfigError> {
    match value.to_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        _ => Err(ConfigError::invalid("VOWLINE_LOG_FORMAT", value, "expected json or pretty")),
    }
}
