//! Outbound mail delivery.

mod postmark;

pub use postmark::PostmarkMailer;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Mail delivery errors.
#[derive(Error, Debug)]
pub enum MailError {
    /// The message could not be built.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The provider could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The provider rejected the message.
    #[error("Provider rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<reqwest::Error> for MailError {
    fn from(err: reqwest::Error) -> Self {
        MailError::Transport(err.to_string())
    }
}

/// A templated message.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplatedMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub template: String,
    pub payload: Value,
}

impl TemplatedMessage {
    /// Checks that the addressing fields are present.
    pub fn validate(&self) -> Result<(), MailError> {
        if self.to.trim().is_empty() {
            return Err(MailError::InvalidMessage("recipient not set".to_string()));
        }
        if self.from.trim().is_empty() {
            return Err(MailError::InvalidMessage("sender not set".to_string()));
        }
        if self.template.trim().is_empty() {
            return Err(MailError::InvalidMessage("template not set".to_string()));
        }
        Ok(())
    }
}

/// Sends templated mail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sends one message rendered from `message.template`.
    async fn send(&self, message: &TemplatedMessage) -> Result<(), MailError>;
}

/// Mailer that only logs messages. Used in development.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

impl LogMailer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &TemplatedMessage) -> Result<(), MailError> {
        message.validate()?;

        info!(
            to = %message.to,
            from = %message.from,
            subject = %message.subject,
            template = %message.template,
            payload = %message.payload,
            "Mail delivery skipped, logging message"
        );

        Ok(())
    }
}
