//! Message bodies and their short-text projection.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use vowline_core::{PipelineError, PipelineResult};

/// Character limit of one secondary-channel message.
pub const SMS_MAX_CHARS: usize = 160;

const ELLIPSIS: &str = "...";

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern compiles"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));
static E164: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("e164 pattern compiles"));

/// A rendered message ready for the primary (mail) channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl OutboundMessage {
    pub fn new(
        to: impl Into<String>,
        subject: impl Into<String>,
        html: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            html: html.into(),
            text: text.into(),
        }
    }

    /// Text body when present, otherwise the HTML body with markup removed.
    pub fn plain_text(&self) -> String {
        if self.text.trim().is_empty() {
            strip_markup(&self.html)
        } else {
            collapse_whitespace(&self.text)
        }
    }

    /// `"[subject] body"`, cut to the secondary channel's limit.
    pub fn short_text(&self) -> String {
        truncate_chars(&format!("[{}] {}", self.subject, self.plain_text()), SMS_MAX_CHARS)
    }
}

/// Remove tags and collapse runs of whitespace.
pub fn strip_markup(html: &str) -> String {
    collapse_whitespace(&TAG.replace_all(html, " "))
}

fn collapse_whitespace(s: &str) -> String {
    WHITESPACE.replace_all(s, " ").trim().to_string()
}

/// Cut `s` to at most `max` characters, ending in `...` when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

/// Accept only E.164 numbers (`+` followed by 2-15 digits).
pub fn validate_phone(number: &str) -> PipelineResult<()> {
    if E164.is_match(number) {
        Ok(())
    } else {
        Err(PipelineError::validation(format!(
            "invalid phone number format: {number}"
        )))
    }
}
