//! Outbound transports and scriptable fakes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vowline_core::{PipelineError, PipelineResult};

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
}

impl SentMessage {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Primary channel: electronic mail.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str, text: &str) -> PipelineResult<SentMessage>;
}

/// Secondary channel: short text message. `body` is at most 160 characters.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> PipelineResult<SentMessage>;
}

#[async_trait]
impl<T> MailTransport for Arc<T>
where
    T: MailTransport + ?Sized,
{
    async fn send(&self, to: &str, subject: &str, html: &str, text: &str) -> PipelineResult<SentMessage> {
        (**self).send(to, subject, html, text).await
    }
}

#[async_trait]
impl<T> SmsTransport for Arc<T>
where
    T: SmsTransport + ?Sized,
{
    async fn send(&self, to: &str, body: &str) -> PipelineResult<SentMessage> {
        (**self).send(to, body).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────────────────────────

/// One message accepted (or refused) by a [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Default)]
struct Script {
    /// Recipients whose sends always fail.
    failures: Vec<(String, String)>,
    /// Replies for the next calls, consumed in order.
    replies: VecDeque<PipelineResult<SentMessage>>,
    sent: Vec<SendRecord>,
    counter: u64,
}

/// In-process transport for tests/dev.
///
/// By default every send succeeds with a generated id (`{prefix}-{n}`).
/// Scripted replies and per-recipient failures override that.
#[derive(Debug)]
pub struct ScriptedTransport {
    prefix: String,
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            script: Mutex::new(Script::default()),
        }
    }

    pub fn arc(prefix: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(prefix))
    }

    /// Queue the reply for the next send.
    pub fn push_reply(&self, reply: PipelineResult<SentMessage>) {
        self.lock().replies.push_back(reply);
    }

    /// Every send to `to` fails with a transport error carrying `message`.
    pub fn fail_for(&self, to: impl Into<String>, message: impl Into<String>) {
        self.lock().failures.push((to.into(), message.into()));
    }

    /// Messages the transport was asked to send, in order.
    pub fn sent(&self) -> Vec<SendRecord> {
        self.lock().sent.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, record: SendRecord) -> PipelineResult<SentMessage> {
        let mut script = self.lock();
        let to = record.to.clone();
        script.sent.push(record);

        if let Some((_, message)) = script.failures.iter().find(|(addr, _)| *addr == to) {
            return Err(PipelineError::transport(message.clone()));
        }
        if let Some(reply) = script.replies.pop_front() {
            return reply;
        }
        script.counter += 1;
        Ok(SentMessage::new(format!("{}-{}", self.prefix, script.counter)))
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn send(&self, to: &str, subject: &str, _html: &str, text: &str) -> PipelineResult<SentMessage> {
        self.dispatch(SendRecord {
            to: to.to_string(),
            subject: Some(subject.to_string()),
            body: text.to_string(),
        })
    }
}

#[async_trait]
impl SmsTransport for ScriptedTransport {
    async fn send(&self, to: &str, body: &str) -> PipelineResult<SentMessage> {
        self.dispatch(SendRecord {
            to: to.to_string(),
            subject: None,
            body: body.to_string(),
        })
    }
}
