//! Grafto Jobs - Durable Polling Job Queue
//!
//! A PostgreSQL-backed job queue with:
//! - Atomic claiming, so concurrent workers never hold the same job at once
//! - Recovery of claims left running by a dead worker
//! - A poll/dispatch worker with bounded concurrency and per-job timeouts
//! - Retries with configurable backoff, then a terminal failed state
//! - Repeatable executors driven by five-field cron schedules
//! - Built-in email and weekly report executors
//!
//! # Architecture
//!
//! ```text
//!  Producer ──push──► ┌──────────────┐
//!                     │    Queue     │──► JobStorage (Postgres / memory)
//!  Worker ◄──pull──── └──────────────┘
//!    │                       ▲
//!    ▼                       │ complete / fail / reschedule
//!  ExecutorRegistry ──► Executor::process
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use grafto_jobs::{EmailExecutor, EmailInstructions, ExecutorRegistry, Queue, Worker, WorkerOptions};
//!
//! let queue = Queue::new(storage, &config.jobs.queue);
//! queue.push(EmailExecutor::job(&EmailInstructions {
//!     to: "user@example.com".to_string(),
//!     from: String::new(),
//!     subject: "Welcome!".to_string(),
//!     tmpl_name: "welcome".to_string(),
//!     payload: serde_json::json!({"name": "Ada"}),
//! })?).await?;
//!
//! let mut registry = ExecutorRegistry::new();
//! registry.register(Arc::new(EmailExecutor::new(mailer, "noreply@grafto.dev")))?;
//!
//! let mut worker = Worker::new(queue, registry, WorkerOptions::from_config(&config.jobs));
//! worker.run(shutdown_signal()).await?;
//! ```

pub mod error;
pub mod executor;
pub mod executors;
pub mod job;
pub mod mail;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod storage;
pub mod worker;

pub use error::{JobError, JobResult};
pub use executor::{Executor, ExecutorEntry, ExecutorRegistry, RepeatableExecutor};
pub use executors::{
    EmailExecutor, EmailInstructions, PgReportSource, ReportSource, WeeklyReportExecutor,
    WeeklyReportInstructions, DEFAULT_EMAIL_SUBJECT, EMAIL_EXECUTOR, WEEKLY_REPORT_EXECUTOR,
};
pub use job::{Job, JobContext, JobId, JobState, NewJob, RepeatableJob};
pub use mail::{LogMailer, MailError, Mailer, PostmarkMailer, TemplatedMessage};
pub use metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use queue::{FailOutcome, Queue};
pub use retry::RetryPolicy;
pub use schedule::CronSchedule;
pub use storage::{
    create_pool, run_migrations, ClaimFilter, FailJobParams, InMemoryJobStorage, JobStorage,
    PgJobStorage,
};
pub use worker::{Worker, WorkerOptions, WorkerStats};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::executor::{Executor, RepeatableExecutor};
    pub use crate::job::{JobContext, NewJob, RepeatableJob};
    pub use crate::storage::JobStorage;
    pub use crate::{JobError, JobId, JobResult};
}
