//! Queue and worker metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! binary installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs pushed.
    pub const JOBS_PUSHED_TOTAL: &str = "grafto_jobs_pushed_total";
    /// Total jobs claimed by a pull.
    pub const JOBS_CLAIMED_TOTAL: &str = "grafto_jobs_claimed_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "grafto_jobs_completed_total";
    /// Total failed executions that were re-queued.
    pub const JOBS_RETRIED_TOTAL: &str = "grafto_jobs_retried_total";
    /// Total jobs marked permanently failed.
    pub const JOBS_FAILED_TOTAL: &str = "grafto_jobs_failed_total";
    /// Total executions that hit the job timeout.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "grafto_jobs_timed_out_total";
    /// Total repeatable jobs rescheduled.
    pub const JOBS_RESCHEDULED_TOTAL: &str = "grafto_jobs_rescheduled_total";
    /// Total pull errors.
    pub const PULL_ERRORS_TOTAL: &str = "grafto_jobs_pull_errors_total";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "grafto_job_duration_seconds";
    /// Delay between `scheduled_for` and execution start, in seconds.
    pub const JOB_LAG_SECONDS: &str = "grafto_job_lag_seconds";

    /// Jobs currently executing on this worker.
    pub const WORKER_IN_FLIGHT: &str = "grafto_worker_in_flight";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_PUSHED_TOTAL, "Total number of jobs pushed");
    describe_counter!(
        names::JOBS_CLAIMED_TOTAL,
        "Total number of jobs claimed for processing"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of failed executions scheduled for retry"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs marked permanently failed"
    );
    describe_counter!(
        names::JOBS_TIMED_OUT_TOTAL,
        "Total number of executions that timed out"
    );
    describe_counter!(
        names::JOBS_RESCHEDULED_TOTAL,
        "Total number of repeatable jobs rescheduled"
    );
    describe_counter!(names::PULL_ERRORS_TOTAL, "Total number of failed pulls");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );
    describe_histogram!(
        names::JOB_LAG_SECONDS,
        "Time between a job's schedule and its execution in seconds"
    );

    describe_gauge!(
        names::WORKER_IN_FLIGHT,
        "Number of jobs currently executing"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job pushed.
    pub fn job_pushed(executor: &str) {
        counter!(names::JOBS_PUSHED_TOTAL, "executor" => executor.to_string()).increment(1);
    }

    /// Record jobs claimed by one pull.
    pub fn jobs_claimed(count: usize) {
        counter!(names::JOBS_CLAIMED_TOTAL).increment(count as u64);
    }

    /// Record a job completed.
    pub fn job_completed(executor: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED_TOTAL, "executor" => executor.to_string()).increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "executor" => executor.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed execution.
    pub fn job_errored(executor: &str, error_type: &str, duration: Duration) {
        histogram!(
            names::JOB_DURATION_SECONDS,
            "executor" => executor.to_string(),
            "status" => "failed",
            "error_type" => error_type.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job re-queued after a failure.
    pub fn job_retried(executor: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "executor" => executor.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a job given up on.
    pub fn job_failed(executor: &str, error_type: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "executor" => executor.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);
    }

    /// Record a job timeout.
    pub fn job_timed_out(executor: &str) {
        counter!(names::JOBS_TIMED_OUT_TOTAL, "executor" => executor.to_string()).increment(1);
    }

    /// Record a repeatable job rescheduled in place.
    pub fn job_rescheduled(executor: &str) {
        counter!(names::JOBS_RESCHEDULED_TOTAL, "executor" => executor.to_string()).increment(1);
    }

    /// Record scheduling lag.
    pub fn job_lag(executor: &str, lag: Duration) {
        histogram!(names::JOB_LAG_SECONDS, "executor" => executor.to_string())
            .record(lag.as_secs_f64());
    }

    /// Record a pull error.
    pub fn pull_error() {
        counter!(names::PULL_ERRORS_TOTAL).increment(1);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update in-flight job count.
    pub fn update_in_flight(worker_id: &str, in_flight: usize) {
        gauge!(names::WORKER_IN_FLIGHT, "worker_id" => worker_id.to_string()).set(in_flight as f64);
    }
}
