//! Recurring weekly status report.

use super::mail_error;
use crate::error::{JobError, JobResult};
use crate::executor::{Executor, RepeatableExecutor};
use crate::job::{JobContext, NewJob, RepeatableJob};
use crate::mail::{Mailer, TemplatedMessage};
use crate::schedule::CronSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use grafto_config::WeeklyReportConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

/// Registry name of the weekly report executor.
pub const WEEKLY_REPORT_EXECUTOR: &str = "weekly_report_executor";

/// Mail template used for the report.
pub const WEEKLY_REPORT_TEMPLATE: &str = "weekly_report";

const REPORT_SUBJECT: &str = "Weekly status report";

/// Supplies the figures in the report.
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Number of users that signed up at or after `since`.
    async fn new_users_since(&self, since: DateTime<Utc>) -> JobResult<u64>;
}

/// Reads report figures from the `users` table.
#[derive(Clone)]
pub struct PgReportSource {
    pool: PgPool,
}

impl PgReportSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportSource for PgReportSource {
    async fn new_users_since(&self, since: DateTime<Utc>) -> JobResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE created_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyReportInstructions {
    pub to: String,
}

/// Mails a summary of the past week on a cron schedule.
pub struct WeeklyReportExecutor {
    schedule: CronSchedule,
    recipient: String,
    sender: String,
    mailer: Arc<dyn Mailer>,
    source: Arc<dyn ReportSource>,
}

impl WeeklyReportExecutor {
    /// Creates the executor. Fails if `cron` is not a valid schedule.
    pub fn new(
        cron: &str,
        recipient: impl Into<String>,
        sender: impl Into<String>,
        mailer: Arc<dyn Mailer>,
        source: Arc<dyn ReportSource>,
    ) -> JobResult<Self> {
        let recipient = recipient.into();
        if recipient.trim().is_empty() {
            return Err(JobError::Configuration(
                "Weekly report recipient is not set".to_string(),
            ));
        }

        Ok(Self {
            schedule: CronSchedule::parse(cron)?,
            recipient,
            sender: sender.into(),
            mailer,
            source,
        })
    }

    /// Creates the executor from the scheduler configuration.
    pub fn from_config(
        config: &WeeklyReportConfig,
        mailer: Arc<dyn Mailer>,
        source: Arc<dyn ReportSource>,
    ) -> JobResult<Self> {
        Self::new(
            &config.cron,
            config.recipient.clone(),
            config.sender.clone(),
            mailer,
            source,
        )
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }
}

#[async_trait]
impl Executor for WeeklyReportExecutor {
    fn name(&self) -> &str {
        WEEKLY_REPORT_EXECUTOR
    }

    async fn process(&self, ctx: &JobContext, instructions: &[u8]) -> JobResult<()> {
        let instructions: WeeklyReportInstructions = serde_json::from_slice(instructions)?;

        let since = ctx.started_at - Duration::days(7);
        let new_users = self.source.new_users_since(since).await?;

        let message = TemplatedMessage {
            to: instructions.to,
            from: self.sender.clone(),
            subject: REPORT_SUBJECT.to_string(),
            template: WEEKLY_REPORT_TEMPLATE.to_string(),
            payload: json!({ "NewUsers": new_users }),
        };

        self.mailer.send(&message).await.map_err(mail_error)?;

        info!(job_id = %ctx.job_id, new_users, to = %message.to, "Weekly report sent");
        Ok(())
    }
}

impl RepeatableExecutor for WeeklyReportExecutor {
    fn generate_job(&self) -> JobResult<RepeatableJob> {
        let next = self.reschedule_job(Utc::now())?;
        let job = NewJob::from_payload(
            WEEKLY_REPORT_EXECUTOR,
            &WeeklyReportInstructions {
                to: self.recipient.clone(),
            },
        )?;

        RepeatableJob::new(job, next)
    }

    fn reschedule_job(&self, now: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
        self.schedule.next_after(now).ok_or_else(|| {
            JobError::Schedule(format!(
                "Cron '{}' has no occurrence after {}",
                self.schedule, now
            ))
        })
    }
}
