//! Job queue configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the job queue subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker loop configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Repeatable job configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs claimed per pull.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Failed attempts after which a job is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay applied to pushed jobs without an explicit schedule.
    #[serde(default)]
    pub default_delay_ms: u64,

    /// Retention period in seconds for completed jobs.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Delay applied before a failed job becomes eligible again.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            default_delay_ms: 0,
            retention_secs: default_retention(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_batch_size() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_retention() -> u64 {
    86400 * 7 // 7 days
}

impl QueueConfig {
    /// Returns the default push delay as Duration.
    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(self.default_delay_ms)
    }

    /// Returns the completed-job retention as Duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// How the retry delay grows with each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay for every retry.
    #[default]
    Fixed,
    /// Delay grows by `initial_delay_ms` per attempt.
    Linear,
    /// Delay is multiplied by `multiplier` per attempt.
    Exponential,
}

/// Retry backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Backoff strategy.
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for any retry delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Exponential multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random jitter as a fraction of the delay (0.0 to 1.0).
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: 0.0,
        }
    }
}

fn default_initial_delay() -> u64 {
    1500
}

fn default_max_delay() -> u64 {
    3600000 // 1 hour
}

fn default_multiplier() -> f64 {
    2.0
}

/// Worker loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between poll cycles in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum number of jobs executing at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Job execution timeout in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// How long shutdown waits for in-flight jobs, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Consecutive pull failures before the run loop gives up (0 = never).
    #[serde(default)]
    pub max_consecutive_pull_failures: u32,

    /// Extra seconds past the job timeout before a running job is treated
    /// as abandoned and claimed again.
    #[serde(default = "default_stale_grace")]
    pub stale_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            concurrency: default_concurrency(),
            job_timeout_secs: default_job_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_consecutive_pull_failures: 0,
            stale_grace_secs: default_stale_grace(),
        }
    }
}

fn default_poll_interval() -> u64 {
    125
}

fn default_concurrency() -> usize {
    10
}

fn default_job_timeout() -> u64 {
    300 // 5 minutes
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_stale_grace() -> u64 {
    60
}

impl WorkerConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns job timeout as Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns the stale-claim grace period as Duration.
    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }
}

/// Repeatable job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Register repeatable executors at start-up.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Weekly status report settings.
    #[serde(default)]
    pub weekly_report: WeeklyReportConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            weekly_report: WeeklyReportConfig::default(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

/// Weekly status report settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyReportConfig {
    /// Register the report executor.
    #[serde(default)]
    pub enabled: bool,

    /// Five-field cron expression.
    #[serde(default = "default_report_cron")]
    pub cron: String,

    /// Report recipient.
    #[serde(default)]
    pub recipient: String,

    /// Report sender.
    #[serde(default = "default_report_sender")]
    pub sender: String,
}

impl Default for WeeklyReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: default_report_cron(),
            recipient: String::new(),
            sender: default_report_sender(),
        }
    }
}

fn default_report_cron() -> String {
    "0 8 * * 1".to_string() // Mondays 08:00
}

fn default_report_sender() -> String {
    "reports@grafto.dev".to_string()
}
