//! Job records and their lifecycle.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
///
/// Identifiers are UUIDv7, so ordering by id follows creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Creates a new time-ordered job ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the inner UUID.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Job lifecycle state.
///
/// ```text
/// Queued --pull--> Running --ok--> Done
///    ^                |
///    +--retry---------+--exhausted/permanent--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `scheduled_for` and a poller.
    Queued,
    /// Claimed by a worker.
    Running,
    /// Permanently failed; never pulled again.
    Failed,
    /// Processed successfully.
    Done,
}

impl JobState {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Failed => "failed",
            JobState::Done => "done",
        }
    }

    /// Returns true for states a job never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Done)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "failed" => Ok(JobState::Failed),
            "done" => Ok(JobState::Done),
            other => Err(JobError::Storage(format!("Unknown job state: {}", other))),
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: JobId,

    /// Opaque payload, meaningful only to the named executor.
    pub instructions: Vec<u8>,

    /// Name of the executor that processes this job.
    pub executor: String,

    /// Lifecycle state.
    pub state: JobState,

    /// Earliest time the job may be pulled.
    pub scheduled_for: DateTime<Utc>,

    /// Number of failed executions so far.
    pub failed_attempts: u32,

    /// Set on occurrences generated by a repeatable executor.
    pub repeatable_key: Option<String>,

    /// Error from the last failed attempt.
    pub last_error: Option<String>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Returns true if this job is an occurrence of a repeatable executor.
    pub fn is_repeatable(&self) -> bool {
        self.repeatable_key.is_some()
    }

    /// Deserialize the instructions as JSON.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> JobResult<T> {
        Ok(serde_json::from_slice(&self.instructions)?)
    }
}

/// A job that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    id: JobId,
    instructions: Vec<u8>,
    executor: String,
    scheduled_for: Option<DateTime<Utc>>,
    repeatable_key: Option<String>,
}

impl NewJob {
    /// Creates a job from raw instruction bytes.
    ///
    /// Fails if either the instructions or the executor name is empty.
    pub fn new(executor: impl Into<String>, instructions: impl Into<Vec<u8>>) -> JobResult<Self> {
        let executor = executor.into();
        let instructions = instructions.into();

        if instructions.is_empty() {
            return Err(JobError::InvalidJob("instructions not set".to_string()));
        }
        if executor.trim().is_empty() {
            return Err(JobError::InvalidJob("executor not set".to_string()));
        }

        Ok(Self {
            id: JobId::new(),
            instructions,
            executor,
            scheduled_for: None,
            repeatable_key: None,
        })
    }

    /// Creates a job whose instructions are `payload` serialized as JSON.
    pub fn from_payload<T: Serialize>(executor: impl Into<String>, payload: &T) -> JobResult<Self> {
        let instructions = serde_json::to_vec(payload)?;
        Self::new(executor, instructions)
    }

    /// Schedule for a specific time.
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Schedule relative to now.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.scheduled_for = Some(Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero()));
        self
    }

    /// Marks the job as an occurrence of a repeatable executor.
    pub(crate) fn repeatable(mut self, key: impl Into<String>) -> Self {
        self.repeatable_key = Some(key.into());
        self
    }

    /// Job ID assigned at creation.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Executor name.
    pub fn executor(&self) -> &str {
        &self.executor
    }

    /// Instruction bytes.
    pub fn instructions(&self) -> &[u8] {
        &self.instructions
    }

    /// Explicit schedule, if any.
    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.scheduled_for
    }

    /// Builds the queued record, using `default_at` when no schedule was set.
    pub(crate) fn into_job(self, default_at: DateTime<Utc>, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            instructions: self.instructions,
            executor: self.executor,
            state: JobState::Queued,
            scheduled_for: self.scheduled_for.unwrap_or(default_at),
            failed_attempts: 0,
            repeatable_key: self.repeatable_key,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The next occurrence produced by a repeatable executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatableJob {
    /// Job to push.
    pub job: NewJob,

    /// When the occurrence fires.
    pub scheduled_for: DateTime<Utc>,
}

impl RepeatableJob {
    /// Creates an occurrence; `scheduled_for` must lie in the future.
    pub fn new(job: NewJob, scheduled_for: DateTime<Utc>) -> JobResult<Self> {
        if scheduled_for <= Utc::now() {
            return Err(JobError::InvalidJob(format!(
                "cannot schedule a repeatable job in the past: {}",
                scheduled_for
            )));
        }

        Ok(Self { job, scheduled_for })
    }

    /// Converts into a pushable job tagged with `key`.
    pub(crate) fn into_new_job(self, key: &str) -> NewJob {
        self.job.schedule_at(self.scheduled_for).repeatable(key)
    }
}

/// Execution context passed to executors.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Executor name.
    pub executor: String,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Attempts allowed before the job is marked failed.
    pub max_attempts: u32,

    /// Job was scheduled for this time.
    pub scheduled_for: DateTime<Utc>,

    /// Job started executing at this time.
    pub started_at: DateTime<Utc>,

    /// Worker processing this job.
    pub worker_id: String,
}

impl JobContext {
    /// Builds the context for executing `job`.
    pub fn for_job(job: &Job, max_attempts: u32, worker_id: &str) -> Self {
        Self {
            job_id: job.id,
            executor: job.executor.clone(),
            attempt: job.failed_attempts + 1,
            max_attempts,
            scheduled_for: job.scheduled_for,
            started_at: Utc::now(),
            worker_id: worker_id.to_string(),
        }
    }

    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
