//! Retry policy applied when an execution fails.

use grafto_config::{BackoffConfig, BackoffStrategy, QueueConfig};
use std::time::Duration;

/// Retry policy for failed jobs.
///
/// A job is attempted at most `max_retries` times in total. The delay before
/// the next attempt grows according to the configured backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed before a job is marked failed.
    pub max_retries: u32,

    /// Backoff strategy.
    pub strategy: BackoffStrategy,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, 1500)
    }
}

impl RetryPolicy {
    /// Creates a fixed delay policy.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            strategy: BackoffStrategy::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff policy without jitter.
    pub fn exponential(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms,
            max_delay_ms: 3_600_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Builds a policy from backoff settings.
    pub fn from_backoff(max_retries: u32, backoff: &BackoffConfig) -> Self {
        Self {
            max_retries,
            strategy: backoff.strategy,
            initial_delay_ms: backoff.initial_delay_ms,
            max_delay_ms: backoff.max_delay_ms.max(backoff.initial_delay_ms),
            multiplier: backoff.multiplier,
            jitter_factor: backoff.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Builds a policy from the queue section of the configuration.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::from_backoff(config.max_retries, &config.backoff)
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Enables jitter.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Returns true if a job that has failed `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }

    /// Delay before the next attempt after `attempt` failures.
    ///
    /// Never shorter than one millisecond, so a retried job is always
    /// rescheduled strictly after the failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);

        let base_delay = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Linear => self.initial_delay_ms.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => {
                let delay = self.initial_delay_ms as f64 * self.multiplier.powi((attempt - 1) as i32);
                if delay.is_finite() {
                    delay as u64
                } else {
                    self.max_delay_ms
                }
            }
        };

        let capped_delay = base_delay.min(self.max_delay_ms);

        let final_delay = if self.jitter_factor > 0.0 {
            let jitter_range = (capped_delay as f64 * self.jitter_factor) as u64;
            let jitter = rand_jitter(jitter_range);
            capped_delay.saturating_add(jitter).saturating_sub(jitter_range / 2)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay.max(1))
    }
}

/// Generate random jitter using a simple LCG.
fn rand_jitter(range: u64) -> u64 {
    use std::time::SystemTime;

    if range == 0 {
        return 0;
    }

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    let a: u64 = 6364136223846793005;
    let c: u64 = 1442695040888963407;

    seed.wrapping_mul(a).wrapping_add(c) % range
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_1500ms() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1500));
    }

    #[test]
    fn test_should_retry_counts_total_attempts() {
        let policy = RetryPolicy::fixed(3, 100);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(5, 1000);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = BackoffConfig {
            strategy: BackoffStrategy::Linear,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            multiplier: 1.0,
            jitter_factor: 0.0,
        };
        let policy = RetryPolicy::from_backoff(5, &backoff);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential(50, 1000).with_max_delay(Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_is_never_zero() {
        let policy = RetryPolicy::fixed(5, 0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::fixed(5, 1000).with_jitter(0.2);
        let delay = policy.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(900));
        assert!(delay <= Duration::from_millis(1100));
    }

    #[test]
    fn test_from_config_uses_queue_settings() {
        let config = QueueConfig::default();
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, config.max_retries);
        assert_eq!(policy.initial_delay_ms, config.backoff.initial_delay_ms);
    }
}
