//! Retry policies for failed broker jobs.

use imgq_config::QueueConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// No retry.
    None,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff with optional jitter.
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0). Zero disables jitter.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Creates a policy that runs a job once.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff retry policy.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts,
            initial_delay_ms: 1000,
            max_delay_ms: 300_000, // 5 minutes
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Exponential policy from queue configuration.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::exponential(config.max_attempts)
            .with_initial_delay(Duration::from_millis(config.backoff_initial_ms))
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Returns true if a job that has made `attempts_made` attempts may run
    /// again.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        self.strategy != RetryStrategy::None && attempts_made < self.max_attempts
    }

    /// Delay before the retry following attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = match self.strategy {
            RetryStrategy::None => return Duration::ZERO,
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                (self.initial_delay_ms as f64 * self.multiplier.powi(exp)) as u64
            }
        };

        let capped_delay = base_delay.min(self.max_delay_ms);

        let final_delay = if self.jitter_factor > 0.0 {
            let jitter_range = (capped_delay as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
            capped_delay
                .saturating_add(random_below(jitter_range))
                .saturating_sub(jitter_range / 2)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay)
    }
}

fn random_below(range: u64) -> u64 {
    if range == 0 {
        return 0;
    }
    (Uuid::new_v4().as_u128() % u128::from(range)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::none();
        assert!(!policy.should_retry(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_attempt_limit() {
        let policy = RetryPolicy::fixed(3, 500);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(4).without_jitter();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(3);
        for _ in 0..20 {
            let delay = policy.delay_for_attempt(1).as_millis();
            assert!((950..=1050).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential(20)
            .with_max_delay(Duration::from_secs(10))
            .without_jitter();

        assert_eq!(policy.delay_for_attempt(15), Duration::from_secs(10));
    }

    #[test]
    fn test_from_config() {
        let config = QueueConfig {
            max_attempts: 5,
            backoff_initial_ms: 250,
            ..QueueConfig::default()
        };
        let policy = RetryPolicy::from_config(&config).without_jitter();

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
    }
}
