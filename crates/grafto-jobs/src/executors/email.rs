//! Transactional email executor.

use super::mail_error;
use crate::error::JobResult;
use crate::executor::Executor;
use crate::job::{JobContext, NewJob};
use crate::mail::{Mailer, TemplatedMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Registry name of the email executor.
pub const EMAIL_EXECUTOR: &str = "email_job_executor";

/// Subject used when neither the job nor the executor sets one.
pub const DEFAULT_EMAIL_SUBJECT: &str = "Please confirm your email";

/// Instructions for one templated email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailInstructions {
    pub to: String,

    /// Falls back to the executor's default sender when empty.
    #[serde(default)]
    pub from: String,

    /// Falls back to the executor's default subject when empty.
    #[serde(default)]
    pub subject: String,

    /// Template rendered by the mail provider.
    pub tmpl_name: String,

    #[serde(default)]
    pub payload: Value,
}

/// Sends one templated email per job.
pub struct EmailExecutor {
    mailer: Arc<dyn Mailer>,
    default_from: String,
    default_subject: String,
}

impl EmailExecutor {
    pub fn new(mailer: Arc<dyn Mailer>, default_from: impl Into<String>) -> Self {
        Self {
            mailer,
            default_from: default_from.into(),
            default_subject: DEFAULT_EMAIL_SUBJECT.to_string(),
        }
    }

    /// Sets the subject used for jobs that carry none.
    #[must_use]
    pub fn with_default_subject(mut self, subject: impl Into<String>) -> Self {
        self.default_subject = subject.into();
        self
    }

    /// Builds a job for this executor.
    pub fn job(instructions: &EmailInstructions) -> JobResult<NewJob> {
        NewJob::from_payload(EMAIL_EXECUTOR, instructions)
    }
}

#[async_trait]
impl Executor for EmailExecutor {
    fn name(&self) -> &str {
        EMAIL_EXECUTOR
    }

    async fn process(&self, ctx: &JobContext, instructions: &[u8]) -> JobResult<()> {
        let instructions: EmailInstructions = serde_json::from_slice(instructions)?;

        let from = if instructions.from.trim().is_empty() {
            self.default_from.clone()
        } else {
            instructions.from
        };

        let subject = if instructions.subject.trim().is_empty() {
            self.default_subject.clone()
        } else {
            instructions.subject
        };

        let message = TemplatedMessage {
            to: instructions.to,
            from,
            subject,
            template: instructions.tmpl_name,
            payload: instructions.payload,
        };

        debug!(
            job_id = %ctx.job_id,
            to = %message.to,
            template = %message.template,
            "Sending email"
        );

        self.mailer.send(&message).await.map_err(mail_error)
    }
}
