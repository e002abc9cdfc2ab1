//! In-process job storage.

use super::{ClaimFilter, FailJobParams, JobStorage};
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Job storage held in memory behind a single lock.
///
/// Claims happen under the lock, so concurrent pollers never receive the
/// same job. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryJobStorage {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs in any state.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Snapshot of all stored jobs.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().values().cloned().collect()
    }

    /// Looks up a job that is still running under the claim stamped
    /// `claimed_at`.
    fn claimed_mut(
        jobs: &mut HashMap<JobId, Job>,
        id: JobId,
        claimed_at: DateTime<Utc>,
    ) -> JobResult<&mut Job> {
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if job.state != JobState::Running || job.updated_at != claimed_at {
            return Err(JobError::ClaimLost(id.to_string()));
        }
        Ok(job)
    }

    fn active_key_exists(jobs: &HashMap<JobId, Job>, key: &str) -> bool {
        jobs.values().any(|job| {
            job.repeatable_key.as_deref() == Some(key)
                && matches!(job.state, JobState::Queued | JobState::Running)
        })
    }
}

#[async_trait]
impl JobStorage for InMemoryJobStorage {
    async fn insert_job(&self, job: &Job) -> JobResult<()> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(JobError::Storage(format!("Duplicate job id: {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn insert_repeatable_job(&self, job: &Job) -> JobResult<bool> {
        let mut jobs = self.jobs.lock();
        if let Some(key) = job.repeatable_key.as_deref() {
            if Self::active_key_exists(&jobs, key) {
                return Ok(false);
            }
        }
        jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn claim_jobs(&self, filter: &ClaimFilter) -> JobResult<Vec<Job>> {
        let mut jobs = self.jobs.lock();

        let mut ready: Vec<&Job> = jobs
            .values()
            .filter(|job| {
                let ready = match job.state {
                    JobState::Queued => job.scheduled_for <= filter.now,
                    JobState::Running => filter
                        .stale_before
                        .is_some_and(|before| job.updated_at < before),
                    JobState::Failed | JobState::Done => false,
                };
                ready && job.failed_attempts < filter.max_retries
            })
            .collect();
        ready.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let ids: Vec<JobId> = ready
            .into_iter()
            .take(filter.limit as usize)
            .map(|job| job.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = jobs.get_mut(&id) {
                job.state = JobState::Running;
                job.updated_at = filter.now;
                claimed.push(job.clone());
            }
        }

        Ok(claimed)
    }

    async fn complete_job(&self, job: &Job, now: DateTime<Utc>) -> JobResult<()> {
        let mut jobs = self.jobs.lock();
        let job = Self::claimed_mut(&mut jobs, job.id, job.updated_at)?;
        job.state = JobState::Done;
        job.updated_at = now;
        Ok(())
    }

    async fn fail_job(&self, params: &FailJobParams) -> JobResult<()> {
        let mut jobs = self.jobs.lock();
        let job = Self::claimed_mut(&mut jobs, params.id, params.claimed_at)?;
        job.state = params.state;
        job.failed_attempts = params.failed_attempts;
        job.scheduled_for = params.scheduled_for;
        job.last_error = Some(params.error.clone());
        job.updated_at = params.updated_at;
        Ok(())
    }

    async fn reschedule_repeatable_job(
        &self,
        job: &Job,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        let mut jobs = self.jobs.lock();
        let job = Self::claimed_mut(&mut jobs, job.id, job.updated_at)?;
        job.state = JobState::Queued;
        job.scheduled_for = scheduled_for;
        job.failed_attempts = 0;
        job.last_error = None;
        job.updated_at = now;
        Ok(())
    }

    async fn repeatable_job_exists(&self, key: &str) -> JobResult<bool> {
        Ok(Self::active_key_exists(&self.jobs.lock(), key))
    }

    async fn get_job(&self, id: JobId) -> JobResult<Option<Job>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn clear_jobs(&self) -> JobResult<u64> {
        let mut jobs = self.jobs.lock();
        let count = jobs.len() as u64;
        jobs.clear();
        Ok(count)
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> JobResult<u64> {
        let mut jobs = self.jobs.lock();
        let before_len = jobs.len();
        jobs.retain(|_, job| !(job.state == JobState::Done && job.updated_at < before));
        Ok((before_len - jobs.len()) as u64)
    }
}
