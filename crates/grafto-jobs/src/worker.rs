//! Poll, dispatch and retry loop.

use crate::error::{JobError, JobResult};
use crate::executor::{ExecutorEntry, ExecutorRegistry};
use crate::job::{Job, JobContext};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::queue::Queue;
use chrono::Utc;
use futures::FutureExt;
use grafto_config::JobsConfig;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum jobs claimed per poll.
    pub batch_size: u32,

    /// Sleep between polls.
    pub poll_interval: Duration,

    /// Maximum jobs executing at once.
    pub concurrency: usize,

    /// Executions running longer than this fail with a timeout.
    pub job_timeout: Duration,

    /// How long shutdown waits for in-flight jobs.
    pub shutdown_timeout: Duration,

    /// Consecutive failed pulls after which `run` returns the error.
    /// Zero keeps polling forever.
    pub max_consecutive_pull_failures: u32,

    /// Jobs running longer than `job_timeout + stale_grace` are claimed
    /// again.
    pub stale_grace: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

impl WorkerOptions {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            batch_size: config.queue.batch_size,
            poll_interval: config.worker.poll_interval(),
            concurrency: config.worker.concurrency,
            job_timeout: config.worker.job_timeout(),
            shutdown_timeout: config.worker.shutdown_timeout(),
            max_consecutive_pull_failures: config.worker.max_consecutive_pull_failures,
            stale_grace: config.worker.stale_grace(),
        }
    }
}

/// Worker counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub id: String,
    pub processed: u64,
    pub failed: u64,
    pub in_flight: usize,
}

/// State shared with job tasks.
struct Dispatcher {
    worker_id: String,
    queue: Queue,
    registry: Arc<ExecutorRegistry>,
    job_timeout: Duration,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Pulls jobs from a [`Queue`] and runs them on their executors.
///
/// Jobs run as separate tasks, at most `concurrency` at a time. Job
/// failures never stop the loop; they become retries or failed jobs.
pub struct Worker {
    dispatcher: Arc<Dispatcher>,
    options: WorkerOptions,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl Worker {
    /// Creates a worker. The queue re-claims jobs left running longer than
    /// the job timeout plus `stale_grace`.
    pub fn new(queue: Queue, registry: ExecutorRegistry, options: WorkerOptions) -> Self {
        let concurrency = options.concurrency.max(1);
        let queue = queue.with_stale_after(options.job_timeout.saturating_add(options.stale_grace));

        Self {
            dispatcher: Arc::new(Dispatcher {
                worker_id: format!("worker-{}", Uuid::new_v4()),
                queue,
                registry: Arc::new(registry),
                job_timeout: options.job_timeout,
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            options,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            tasks: JoinSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.dispatcher.worker_id
    }

    pub fn queue(&self) -> &Queue {
        &self.dispatcher.queue
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.dispatcher.worker_id.clone(),
            processed: self.dispatcher.processed.load(Ordering::Relaxed),
            failed: self.dispatcher.failed.load(Ordering::Relaxed),
            in_flight: self.tasks.len(),
        }
    }

    /// Runs until `shutdown` resolves, then waits for in-flight jobs.
    ///
    /// Repeatable executors are scheduled first; failing to do so is
    /// returned as an error. Pull errors are logged and retried on the
    /// next poll unless `max_consecutive_pull_failures` is reached.
    pub async fn run<F>(&mut self, shutdown: F) -> JobResult<()>
    where
        F: Future<Output = ()>,
    {
        self.initialize_repeatables().await?;

        info!(
            worker_id = %self.id(),
            executors = ?self.dispatcher.registry.names(),
            batch_size = self.options.batch_size,
            concurrency = self.options.concurrency,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "Worker started"
        );

        tokio::pin!(shutdown);
        let mut consecutive_failures = 0u32;

        loop {
            self.reap_finished();

            match self.poll_once().await {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    JobMetrics::pull_error();
                    error!(
                        worker_id = %self.id(),
                        error = %e,
                        consecutive_failures,
                        "Failed to pull jobs"
                    );

                    let limit = self.options.max_consecutive_pull_failures;
                    if limit > 0 && consecutive_failures >= limit {
                        error!(worker_id = %self.id(), "Too many consecutive pull failures, stopping");
                        self.drain().await;
                        return Err(e);
                    }
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!(worker_id = %self.id(), "Received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }

        self.drain().await;

        let stats = self.stats();
        info!(
            worker_id = %stats.id,
            processed = stats.processed,
            failed = stats.failed,
            "Worker stopped"
        );

        Ok(())
    }

    /// Runs one poll and waits for the claimed jobs to finish.
    /// Returns the number of jobs claimed.
    pub async fn run_once(&mut self) -> JobResult<usize> {
        let claimed = self.poll_once().await?;
        while let Some(result) = self.tasks.join_next().await {
            log_join_result(result);
        }
        WorkerMetrics::update_in_flight(self.id(), 0);
        Ok(claimed)
    }

    /// Schedules the next occurrence of every repeatable executor that
    /// has none outstanding.
    pub async fn initialize_repeatables(&self) -> JobResult<()> {
        for executor in self.dispatcher.registry.repeatables() {
            self.dispatcher
                .queue
                .initialize_repeatable(executor.as_ref())
                .await?;
        }
        Ok(())
    }

    /// Claims as many jobs as there are free slots and spawns them.
    async fn poll_once(&mut self) -> JobResult<usize> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            debug!(worker_id = %self.id(), "All slots busy, skipping poll");
            return Ok(0);
        }

        let limit = self.options.batch_size.min(available as u32);
        let jobs = self.dispatcher.queue.pull(limit).await?;
        let claimed = jobs.len();

        for job in jobs {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| JobError::Internal(format!("Worker semaphore closed: {}", e)))?;

            let dispatcher = self.dispatcher.clone();
            let span = tracing::info_span!(
                "job",
                job_id = %job.id,
                executor = %job.executor,
                attempt = job.failed_attempts + 1,
                worker_id = %dispatcher.worker_id,
            );

            self.tasks.spawn(
                async move {
                    let _permit = permit;
                    dispatcher.execute(job).await;
                }
                .instrument(span),
            );
        }

        WorkerMetrics::update_in_flight(self.id(), self.tasks.len());
        Ok(claimed)
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            log_join_result(result);
        }
    }

    /// Waits for in-flight jobs up to the shutdown timeout. Jobs still
    /// running afterwards are detached, not aborted.
    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }

        info!(
            worker_id = %self.id(),
            in_flight = self.tasks.len(),
            "Waiting for in-flight jobs to finish..."
        );

        let tasks = &mut self.tasks;
        let drained = timeout(self.options.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_join_result(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                worker_id = %self.dispatcher.worker_id,
                remaining = self.tasks.len(),
                "Shutdown timeout elapsed, detaching in-flight jobs"
            );
            self.tasks.detach_all();
        }
    }
}

impl Dispatcher {
    async fn execute(&self, job: Job) {
        let started = Instant::now();
        let ctx = JobContext::for_job(&job, self.queue.max_retries(), &self.worker_id);

        if let Ok(lag) = (ctx.started_at - job.scheduled_for).to_std() {
            JobMetrics::job_lag(&job.executor, lag);
        }

        let Some(entry) = self.registry.get(&job.executor) else {
            error!("No executor registered for job");
            let err = JobError::UnknownExecutor(job.executor.clone());
            self.on_failure(&job, None, err, started).await;
            return;
        };

        debug!("Processing job");
        match self.run_executor(entry, &ctx, &job).await {
            Ok(()) => self.on_success(&job, entry, started).await,
            Err(e) => self.on_failure(&job, Some(entry), e, started).await,
        }
    }

    /// Runs the executor with the job timeout, turning panics into errors.
    async fn run_executor(&self, entry: &ExecutorEntry, ctx: &JobContext, job: &Job) -> JobResult<()> {
        let execution = AssertUnwindSafe(entry.process(ctx, &job.instructions)).catch_unwind();

        match timeout(self.job_timeout, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(JobError::Panicked(panic_message(panic))),
            Err(_) => {
                JobMetrics::job_timed_out(&job.executor);
                Err(JobError::Timeout(self.job_timeout.as_secs()))
            }
        }
    }

    async fn on_success(&self, job: &Job, entry: &ExecutorEntry, started: Instant) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_completed(&job.executor, started.elapsed());

        let repeatable = entry.as_repeatable().filter(|_| job.is_repeatable());

        let Some(executor) = repeatable else {
            if let Err(e) = self.queue.complete(job).await {
                log_write_error(&e, "Failed to mark job as complete");
                return;
            }
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "Job completed");
            return;
        };

        match executor.reschedule_job(Utc::now()) {
            Ok(next_run) => {
                if let Err(e) = self.queue.reschedule_repeatable(job, next_run).await {
                    log_write_error(&e, "Failed to reschedule repeatable job");
                    return;
                }
                info!(next_run = %next_run, "Repeatable job completed and rescheduled");
            }
            Err(e) => {
                error!(error = %e, "Failed to compute next occurrence, completing job");
                if let Err(e) = self.queue.complete(job).await {
                    log_write_error(&e, "Failed to mark job as complete");
                }
            }
        }
    }

    async fn on_failure(
        &self,
        job: &Job,
        entry: Option<&ExecutorEntry>,
        err: JobError,
        started: Instant,
    ) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_errored(&job.executor, err.kind(), started.elapsed());
        warn!(
            job_id = %job.id,
            executor = %job.executor,
            attempt = job.failed_attempts + 1,
            error = %err,
            "Job execution failed"
        );

        let outcome = match self.queue.fail(job, &err).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log_write_error(&e, "Failed to record job failure");
                return;
            }
        };

        // A failed occurrence would leave its executor with nothing scheduled.
        if outcome.is_terminal() && job.is_repeatable() {
            if let Some(executor) = entry.and_then(ExecutorEntry::as_repeatable) {
                if let Err(e) = self.queue.initialize_repeatable(executor.as_ref()).await {
                    error!(error = %e, "Failed to schedule next occurrence");
                }
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Logs a failed state write. A lost claim means another worker owns the
/// job now, so the result is dropped. Other errors leave the job running
/// until its claim goes stale.
fn log_write_error(err: &JobError, message: &str) {
    if matches!(err, JobError::ClaimLost(_)) {
        warn!(error = %err, "Job claim lost, discarding result");
    } else {
        error!(error = %err, "{}", message);
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Job task panicked");
        } else {
            warn!(error = %e, "Job task cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::job::NewJob;
    use crate::retry::RetryPolicy;
    use crate::storage::MockJobStorage;
    use async_trait::async_trait;
    use chrono::DateTime;

    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        fn name(&self) -> &str {
            "noop"
        }

        async fn process(&self, _ctx: &JobContext, _instructions: &[u8]) -> JobResult<()> {
            Ok(())
        }
    }

    fn claimed_job(now: DateTime<Utc>) -> Job {
        let mut job = NewJob::new("noop", b"{}".to_vec()).unwrap().into_job(now, now);
        job.state = crate::job::JobState::Running;
        job
    }

    fn options(max_consecutive_pull_failures: u32) -> WorkerOptions {
        WorkerOptions {
            batch_size: 10,
            poll_interval: Duration::from_millis(5),
            concurrency: 2,
            job_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            max_consecutive_pull_failures,
            stale_grace: Duration::from_secs(5),
        }
    }

    fn worker(storage: MockJobStorage, options: WorkerOptions) -> Worker {
        let queue = Queue::with_policy(Arc::new(storage), RetryPolicy::fixed(5, 1));
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor)).unwrap();
        Worker::new(queue, registry, options)
    }

    #[test]
    fn test_options_from_default_config() {
        let options = WorkerOptions::default();
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.poll_interval, Duration::from_millis(125));
        assert_eq!(options.concurrency, 10);
        assert_eq!(options.max_consecutive_pull_failures, 0);
        assert_eq!(options.stale_grace, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_run_keeps_polling_after_pull_errors() {
        let mut storage = MockJobStorage::new();
        let mut pulls = 0u32;
        storage.expect_claim_jobs().returning(move |filter| {
            pulls += 1;
            match pulls {
                1..=3 => Err(JobError::Storage("connection reset".to_string())),
                4 => Ok(vec![claimed_job(filter.now)]),
                _ => Ok(Vec::new()),
            }
        });
        storage.expect_complete_job().times(1).returning(|_, _| Ok(()));

        let mut worker = worker(storage, options(0));
        worker
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        assert_eq!(worker.stats().processed, 1);
        assert_eq!(worker.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_run_stops_after_consecutive_pull_errors() {
        let mut storage = MockJobStorage::new();
        storage
            .expect_claim_jobs()
            .times(3)
            .returning(|_| Err(JobError::Storage("connection refused".to_string())));

        let mut worker = worker(storage, options(3));
        let result = timeout(Duration::from_secs(5), worker.run(std::future::pending::<()>())).await;

        let err = result.expect("run should stop on its own").unwrap_err();
        assert!(matches!(err, JobError::Storage(_)));
    }

    #[tokio::test]
    async fn test_successful_pull_resets_failure_count() {
        let mut storage = MockJobStorage::new();
        let mut pulls = 0u32;
        storage.expect_claim_jobs().returning(move |_| {
            pulls += 1;
            if pulls % 2 == 0 {
                Ok(Vec::new())
            } else {
                Err(JobError::Storage("flapping".to_string()))
            }
        });

        let mut worker = worker(storage, options(2));
        worker
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_enables_stale_claim_recovery() {
        let mut storage = MockJobStorage::new();
        storage
            .expect_claim_jobs()
            .withf(|filter| {
                filter.stale_before.is_some_and(|before| {
                    let window = filter.now - before;
                    window == chrono::Duration::seconds(10)
                })
            })
            .times(1)
            .returning(|_| Ok(Vec::new()));

        let mut worker = worker(storage, options(0));
        assert_eq!(worker.run_once().await.unwrap(), 0);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
