//! Durable job storage.
//!
//! The queue only talks to storage through [`JobStorage`], so the backing
//! store can be swapped. [`PgJobStorage`] is the production backend and
//! [`InMemoryJobStorage`] backs tests and single-process setups.

mod memory;
mod postgres;

pub use memory::InMemoryJobStorage;
pub use postgres::{create_pool, run_migrations, PgJobStorage};

use crate::error::JobResult;
use crate::job::{Job, JobId, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Selects jobs that are ready to run.
#[derive(Debug, Clone, Copy)]
pub struct ClaimFilter {
    /// Only jobs scheduled at or before this time are claimed.
    pub now: DateTime<Utc>,

    /// Maximum number of jobs to claim.
    pub limit: u32,

    /// Jobs with this many failed attempts or more are skipped.
    pub max_retries: u32,

    /// Running jobs claimed before this time are claimed again. Their
    /// worker is assumed gone. `None` leaves running jobs alone.
    pub stale_before: Option<DateTime<Utc>>,
}

/// Outcome written back for a failed execution.
#[derive(Debug, Clone)]
pub struct FailJobParams {
    pub id: JobId,

    /// Claim stamp of the execution being recorded.
    pub claimed_at: DateTime<Utc>,

    /// `Queued` to retry, `Failed` when the job is given up.
    pub state: JobState,

    pub failed_attempts: u32,

    /// Next run time when retried.
    pub scheduled_for: DateTime<Utc>,

    pub error: String,

    pub updated_at: DateTime<Utc>,
}

/// Storage contract for the job queue.
///
/// Writes that finish an execution only apply while the job is still
/// running under the claim that produced it: a claimed job's `updated_at`
/// is its claim stamp. A write against a job that was re-claimed or is no
/// longer running fails with [`JobError::ClaimLost`].
///
/// [`JobError::ClaimLost`]: crate::error::JobError::ClaimLost
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Persists a new queued job.
    async fn insert_job(&self, job: &Job) -> JobResult<()>;

    /// Persists a repeatable occurrence unless one with the same key is
    /// already queued or running. Returns `false` when nothing was inserted.
    async fn insert_repeatable_job(&self, job: &Job) -> JobResult<bool>;

    /// Atomically claims ready jobs and marks them running.
    ///
    /// Claimed jobs are ordered by `scheduled_for`, then creation order.
    /// Two concurrent calls never return the same job. Each claimed job's
    /// `updated_at` is set to `filter.now`.
    async fn claim_jobs(&self, filter: &ClaimFilter) -> JobResult<Vec<Job>>;

    /// Marks a claimed job done.
    async fn complete_job(&self, job: &Job, now: DateTime<Utc>) -> JobResult<()>;

    /// Records a failed execution.
    async fn fail_job(&self, params: &FailJobParams) -> JobResult<()>;

    /// Re-queues a repeatable job in place for its next occurrence and
    /// resets its failed attempts.
    async fn reschedule_repeatable_job(
        &self,
        job: &Job,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobResult<()>;

    /// Returns true if an occurrence with `key` is queued or running.
    async fn repeatable_job_exists(&self, key: &str) -> JobResult<bool>;

    /// Fetches a job by ID.
    async fn get_job(&self, id: JobId) -> JobResult<Option<Job>>;

    /// Deletes every job. Returns the number of deleted jobs.
    async fn clear_jobs(&self) -> JobResult<u64>;

    /// Deletes done jobs last updated before `before`.
    async fn purge_completed(&self, before: DateTime<Utc>) -> JobResult<u64>;
}
