// src/delivery/retry.rs

//! Exponential backoff for transient sink failures.

use crate::config::ConfigError;
use std::time::{Duration, Instant};

/// Mirrors `[receivers.retry_on_failure]` after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Zero means retry until cancelled.
    pub max_elapsed_time: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            enabled: true,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(300),
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_interval.is_zero() {
            return Err(ConfigError::InvalidRetry("initial_interval must be positive".into()));
        }
        if self.max_interval < self.initial_interval {
            return Err(ConfigError::InvalidRetry(
                "max_interval must not be smaller than initial_interval".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidRetry("multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    /// Start a fresh backoff sequence; the elapsed clock starts now.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current: self.initial_interval,
            started: Instant::now(),
        }
    }
}

/// State of one retry sequence (one batch).
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    started: Instant,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once the sequence is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.enabled {
            return None;
        }
        let delay = self.current;
        let max_elapsed = self.policy.max_elapsed_time;
        if !max_elapsed.is_zero() && self.started.elapsed() + delay > max_elapsed {
            return None;
        }
        self.current = self
            .current
            .mul_f64(self.policy.multiplier)
            .min(self.policy.max_interval);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial_ms: u64, max_ms: u64, elapsed_ms: u64) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            initial_interval: Duration::from_millis(initial_ms),
            max_interval: Duration::from_millis(max_ms),
            max_elapsed_time: Duration::from_millis(elapsed_ms),
            multiplier: 2.0,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut b = policy(100, 300, 0).backoff();
        let delays: Vec<_> = (0..4).map(|_| b.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn gives_up_when_the_next_sleep_overshoots() {
        let mut b = policy(100, 1_000, 250).backoff();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(200)));
        // 400ms would end past the 250ms budget
        assert_eq!(b.next_delay(), None);
    }

    #[test]
    fn disabled_policy_never_retries() {
        let mut p = policy(100, 200, 0);
        p.enabled = false;
        assert_eq!(p.backoff().next_delay(), None);
    }

    #[test]
    fn validate_rejects_nonsense() {
        assert!(policy(0, 10, 0).validate().is_err());
        assert!(policy(100, 10, 0).validate().is_err());
        let mut p = policy(10, 100, 0);
        p.multiplier = 0.5;
        assert!(p.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }
}
