//! Durable job queue.

use crate::error::{JobError, JobResult};
use crate::executor::RepeatableExecutor;
use crate::job::{Job, JobId, JobState, NewJob};
use crate::metrics::JobMetrics;
use crate::retry::RetryPolicy;
use crate::storage::{ClaimFilter, FailJobParams, JobStorage};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use grafto_config::QueueConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happened to a job after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued for another attempt.
    Retried {
        attempt: u32,
        next_run: DateTime<Utc>,
    },
    /// Marked failed; never pulled again.
    Failed { attempts: u32 },
}

impl FailOutcome {
    /// Returns true if the job will not run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailOutcome::Failed { .. })
    }
}

/// Job queue over a [`JobStorage`] backend.
///
/// Owns the push defaults and the retry policy; the backend owns the
/// persisted state.
#[derive(Clone)]
pub struct Queue {
    storage: Arc<dyn JobStorage>,
    retry_policy: RetryPolicy,
    default_delay: Duration,
    stale_after: Option<Duration>,
}

impl Queue {
    /// Creates a queue from configuration.
    pub fn new(storage: Arc<dyn JobStorage>, config: &QueueConfig) -> Self {
        Self {
            storage,
            retry_policy: RetryPolicy::from_config(config),
            default_delay: config.default_delay(),
            stale_after: None,
        }
    }

    /// Creates a queue with an explicit retry policy and no push delay.
    pub fn with_policy(storage: Arc<dyn JobStorage>, retry_policy: RetryPolicy) -> Self {
        Self {
            storage,
            retry_policy,
            default_delay: Duration::ZERO,
            stale_after: None,
        }
    }

    /// Sets the delay applied to pushed jobs without an explicit schedule.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Lets pulls re-claim jobs that have been running longer than
    /// `stale_after`, recovering claims whose worker died or whose final
    /// write failed.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Attempts allowed per job.
    pub fn max_retries(&self) -> u32 {
        self.retry_policy.max_retries
    }

    /// Returns the storage backend.
    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    /// Persists a new queued job.
    ///
    /// Jobs without an explicit schedule run after the default delay.
    pub async fn push(&self, job: NewJob) -> JobResult<JobId> {
        let now = Utc::now();
        let record = job.into_job(now + to_chrono(self.default_delay), now);

        self.storage.insert_job(&record).await?;

        JobMetrics::job_pushed(&record.executor);
        debug!(
            job_id = %record.id,
            executor = %record.executor,
            scheduled_for = %record.scheduled_for,
            "Job pushed"
        );

        Ok(record.id)
    }

    /// Claims up to `limit` ready jobs, marking them running.
    pub async fn pull(&self, limit: u32) -> JobResult<Vec<Job>> {
        self.pull_at(Utc::now(), limit).await
    }

    /// Claims up to `limit` jobs ready at `now`.
    pub async fn pull_at(&self, now: DateTime<Utc>, limit: u32) -> JobResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let filter = ClaimFilter {
            now,
            limit,
            max_retries: self.retry_policy.max_retries,
            stale_before: self.stale_after.map(|after| now - to_chrono(after)),
        };

        let jobs = self.storage.claim_jobs(&filter).await?;
        if !jobs.is_empty() {
            JobMetrics::jobs_claimed(jobs.len());
            debug!(count = jobs.len(), "Jobs claimed");
        }

        Ok(jobs)
    }

    /// Marks a claimed job done.
    pub async fn complete(&self, job: &Job) -> JobResult<()> {
        self.storage.complete_job(job, Utc::now()).await
    }

    /// Records a failed execution and decides whether the job runs again.
    ///
    /// Permanent errors fail the job immediately. Other errors re-queue it
    /// after the backoff delay until `max_retries` attempts are used up.
    pub async fn fail(&self, job: &Job, error: &JobError) -> JobResult<FailOutcome> {
        self.fail_at(job, error, Utc::now()).await
    }

    pub async fn fail_at(
        &self,
        job: &Job,
        error: &JobError,
        now: DateTime<Utc>,
    ) -> JobResult<FailOutcome> {
        let attempts = job.failed_attempts.saturating_add(1);
        let give_up = error.is_permanent() || !self.retry_policy.should_retry(attempts);

        let (state, scheduled_for, outcome) = if give_up {
            (JobState::Failed, job.scheduled_for, FailOutcome::Failed { attempts })
        } else {
            let next_run = now + to_chrono(self.retry_policy.delay_for_attempt(attempts));
            (
                JobState::Queued,
                next_run,
                FailOutcome::Retried {
                    attempt: attempts,
                    next_run,
                },
            )
        };

        let params = FailJobParams {
            id: job.id,
            claimed_at: job.updated_at,
            state,
            failed_attempts: attempts,
            scheduled_for,
            error: error.to_string(),
            updated_at: now,
        };
        self.storage.fail_job(&params).await?;

        match outcome {
            FailOutcome::Retried { next_run, .. } => {
                JobMetrics::job_retried(&job.executor, attempts);
                debug!(
                    job_id = %job.id,
                    executor = %job.executor,
                    attempt = attempts,
                    next_run = %next_run,
                    "Job re-queued"
                );
            }
            FailOutcome::Failed { .. } => {
                JobMetrics::job_failed(&job.executor, error.kind());
                warn!(
                    job_id = %job.id,
                    executor = %job.executor,
                    attempt = attempts,
                    error = %error,
                    "Job marked failed"
                );
            }
        }

        Ok(outcome)
    }

    /// Re-queues a processed repeatable job for its next occurrence.
    pub async fn reschedule_repeatable(&self, job: &Job, next_run: DateTime<Utc>) -> JobResult<()> {
        self.storage
            .reschedule_repeatable_job(job, next_run, Utc::now())
            .await?;

        JobMetrics::job_rescheduled(&job.executor);
        debug!(job_id = %job.id, executor = %job.executor, next_run = %next_run, "Repeatable job rescheduled");
        Ok(())
    }

    /// Pushes the next occurrence of `executor` unless one is already
    /// queued or running. Returns the new job's ID if one was pushed.
    pub async fn initialize_repeatable(
        &self,
        executor: &dyn RepeatableExecutor,
    ) -> JobResult<Option<JobId>> {
        let key = executor.name().to_string();

        if self.storage.repeatable_job_exists(&key).await? {
            debug!(executor = %key, "Repeatable job already scheduled");
            return Ok(None);
        }

        let occurrence = executor.generate_job()?;
        if occurrence.job.executor() != key {
            return Err(JobError::InvalidJob(format!(
                "Repeatable executor '{}' generated a job for '{}'",
                key,
                occurrence.job.executor()
            )));
        }

        let now = Utc::now();
        let record = occurrence.into_new_job(&key).into_job(now, now);

        if !self.storage.insert_repeatable_job(&record).await? {
            debug!(executor = %key, "Repeatable job scheduled concurrently");
            return Ok(None);
        }

        JobMetrics::job_pushed(&record.executor);
        info!(
            job_id = %record.id,
            executor = %key,
            scheduled_for = %record.scheduled_for,
            "Repeatable job scheduled"
        );

        Ok(Some(record.id))
    }

    /// Fetches a job by ID.
    pub async fn get(&self, id: JobId) -> JobResult<Option<Job>> {
        self.storage.get_job(id).await
    }

    /// Deletes every job.
    pub async fn clear(&self) -> JobResult<u64> {
        let count = self.storage.clear_jobs().await?;
        info!(count, "Queue cleared");
        Ok(count)
    }

    /// Deletes done jobs older than `retention`.
    pub async fn purge_completed(&self, retention: Duration) -> JobResult<u64> {
        let before = Utc::now() - to_chrono(retention);
        let count = self.storage.purge_completed(before).await?;
        if count > 0 {
            info!(count, "Purged completed jobs");
        }
        Ok(count)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("retry_policy", &self.retry_policy)
            .field("default_delay", &self.default_delay)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}
