//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Executor reported a business-logic failure.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Mail transport rejected or could not deliver a message.
    #[error("Mail delivery failed: {0}")]
    Mail(#[from] crate::mail::MailError),

    /// Job exceeded its execution timeout.
    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    /// Executor panicked while processing the job.
    #[error("Executor panicked: {0}")]
    Panicked(String),

    /// Instructions could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No executor is registered under the job's executor name.
    #[error("No executor registered with name: {0}")]
    UnknownExecutor(String),

    /// Job was rejected before it was persisted.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Storage backend error not originating from the database driver.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The job is no longer running under the claim that tried to update it.
    #[error("Job claim lost: {0}")]
    ClaimLost(String),

    /// Cron expression could not be parsed or never fires.
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if retrying the job can never succeed.
    ///
    /// Permanent failures are marked failed immediately without consuming
    /// the retry budget.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            JobError::Serialization(_) | JobError::UnknownExecutor(_) | JobError::InvalidJob(_)
        )
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::ExecutionFailed(_)
                | JobError::Mail(_)
                | JobError::Timeout(_)
                | JobError::Panicked(_)
                | JobError::Database(_)
                | JobError::Storage(_)
        )
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::ExecutionFailed(_) => "execution_failed",
            JobError::Mail(_) => "mail",
            JobError::Timeout(_) => "timeout",
            JobError::Panicked(_) => "panicked",
            JobError::Serialization(_) => "serialization",
            JobError::UnknownExecutor(_) => "unknown_executor",
            JobError::InvalidJob(_) => "invalid_job",
            JobError::Database(_) | JobError::Migration(_) => "database",
            JobError::Storage(_) => "storage",
            JobError::NotFound(_) => "not_found",
            JobError::ClaimLost(_) => "claim_lost",
            JobError::Schedule(_) => "schedule",
            JobError::Configuration(_) => "configuration",
            JobError::Internal(_) => "internal",
        }
    }
}

impl From<grafto_core::GraftoError> for JobError {
    fn from(err: grafto_core::GraftoError) -> Self {
        JobError::Internal(err.to_string())
    }
}

impl From<JobError> for grafto_core::GraftoError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Database(e) => grafto_core::GraftoError::Database(e.to_string()),
            JobError::Migration(e) => grafto_core::GraftoError::Database(e.to_string()),
            JobError::Schedule(msg) | JobError::Configuration(msg) => {
                grafto_core::GraftoError::Configuration(msg)
            }
            other => grafto_core::GraftoError::Internal(other.to_string()),
        }
    }
}
