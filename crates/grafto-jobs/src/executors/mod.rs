//! Built-in executors.

mod email;
mod weekly_report;

pub use email::{EmailExecutor, EmailInstructions, DEFAULT_EMAIL_SUBJECT, EMAIL_EXECUTOR};
pub use weekly_report::{
    PgReportSource, ReportSource, WeeklyReportExecutor, WeeklyReportInstructions,
    WEEKLY_REPORT_EXECUTOR, WEEKLY_REPORT_TEMPLATE,
};

use crate::error::JobError;
use crate::mail::MailError;

/// Invalid messages can never succeed, so they are not retried.
pub(crate) fn mail_error(err: MailError) -> JobError {
    match err {
        MailError::InvalidMessage(msg) => JobError::InvalidJob(msg),
        other => JobError::Mail(other),
    }
}
