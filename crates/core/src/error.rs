//! Pipeline error model.
//!
//! Every public operation in the workspace returns [`PipelineResult`]. Only the
//! work closure handed to the job runner may fail with an arbitrary error, and
//! the runner converts that into [`PipelineError::JobExecution`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Discriminant of a [`PipelineError`], stable for callers that render errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Store,
    Transport,
    JobExecution,
    Unknown,
}

impl ErrorKind {
    /// Upper-snake error code (e.g. `FORBIDDEN`).
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Store => "DATABASE_ERROR",
            ErrorKind::Transport => "EXTERNAL_SERVICE_ERROR",
            ErrorKind::JobExecution => "CRON_JOB_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

/// Pipeline-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate or otherwise conflicting state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A protected invariant refused the operation (e.g. last active owner).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The relational store failed.
    #[error("store error: {0}")]
    Store(String),

    /// A mail/SMS transport failed. `cause` carries an earlier failure that
    /// led to this attempt (the primary channel error for a failed fallback).
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        cause: Option<Box<PipelineError>>,
    },

    /// The work function of a job returned an error.
    #[error("job execution failed: {0}")]
    JobExecution(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            cause: None,
        }
    }

    /// Transport failure that happened after (and because of) `cause`.
    pub fn transport_after(msg: impl Into<String>, cause: PipelineError) -> Self {
        Self::Transport {
            message: msg.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn job_execution(msg: impl Into<String>) -> Self {
        Self::JobExecution(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Conflict(_) => ErrorKind::Conflict,
            PipelineError::Forbidden(_) => ErrorKind::Forbidden,
            PipelineError::Store(_) => ErrorKind::Store,
            PipelineError::Transport { .. } => ErrorKind::Transport,
            PipelineError::JobExecution(_) => ErrorKind::JobExecution,
            PipelineError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// The earlier failure this error wraps, if any.
    pub fn cause(&self) -> Option<&PipelineError> {
        match self {
            PipelineError::Transport { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            PipelineError::Validation(m)
            | PipelineError::NotFound(m)
            | PipelineError::Conflict(m)
            | PipelineError::Forbidden(m)
            | PipelineError::Store(m)
            | PipelineError::JobExecution(m)
            | PipelineError::Unknown(m) => m,
            PipelineError::Transport { message, .. } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_is_distinct_from_validation() {
        let forbidden = PipelineError::forbidden("cannot delete the last owner account");
        let invalid = PipelineError::validation("bad email");

        assert_eq!(forbidden.kind(), ErrorKind::Forbidden);
        assert_eq!(invalid.kind(), ErrorKind::Validation);
        assert_ne!(forbidden.code(), invalid.code());
    }

    #[test]
    fn transport_error_keeps_primary_cause() {
        let primary = PipelineError::transport("mailbox unavailable");
        let err = PipelineError::transport_after("sms gateway down", primary.clone());

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.cause(), Some(&primary));
        assert_eq!(err.message(), "sms gateway down");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::JobExecution).unwrap();
        assert_eq!(json, "\"job_execution\"");
    }
}
