//! Retry policies - exponential backoff with jitter
//!
//! Step invocations are governed by a [`RetryPolicy`]. Classification is by
//! error kind ([`WorkflowError::is_transient`]): transient failures retry
//! with exponentially growing, jittered delays; fatal failures skip retries
//! and bubble to the nearest failure handler. The engine schedules retry
//! delays durably through the outbox's not-before column rather than
//! sleeping in-process.

use rand::Rng;
use std::time::Duration;

use crate::error::WorkflowError;

/// How the engine should react to a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-dispatch after the given delay
    Retry(Duration),
    /// Attempts exhausted or the error is fatal
    GiveUp,
}

/// Exponential backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum invocation attempts, including the first
    pub max_attempts: u32,
    /// First delay, in seconds
    pub initial_interval: f64,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Delay ceiling, in seconds
    pub max_interval: f64,
    /// Randomize delays by 0.5x–1.5x to spread thundering herds
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts` tries
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Backoff before the attempt following `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(32);
        let mut secs = self.initial_interval * self.backoff_factor.powi(exp as i32);
        if secs > self.max_interval {
            secs = self.max_interval;
        }
        if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
            secs *= factor;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Classify a failure after `attempts` tries
    pub fn decide(&self, error: &WorkflowError, attempts: u32) -> RetryDecision {
        if error.is_transient() && self.should_retry(attempts) {
            RetryDecision::Retry(self.calculate_delay(attempts.saturating_sub(1)))
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Attempt bookkeeping for one dispatch
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, error: Option<String>) {
        self.attempts += 1;
        if error.is_some() {
            self.last_error = error;
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(8.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(8));
        assert_eq!(policy.calculate_delay(6), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::new(3)
            .with_initial_interval(2.0)
            .with_backoff_factor(1.0)
            .with_jitter(true);
        for _ in 0..50 {
            let delay = policy.calculate_delay(0).as_secs_f64();
            assert!((1.0..3.0).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn test_transient_errors_retry_until_exhaustion() {
        let policy = RetryPolicy::new(3).with_jitter(false);
        let err = WorkflowError::Network("connection reset".into());

        assert!(matches!(policy.decide(&err, 1), RetryDecision::Retry(_)));
        assert!(matches!(policy.decide(&err, 2), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(&err, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_fatal_errors_never_retry() {
        let policy = RetryPolicy::new(5);
        let err = WorkflowError::Validation("bad input".into());
        assert_eq!(policy.decide(&err, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_state_tracks_attempts() {
        let mut state = RetryState::new();
        state.record_attempt(Some("timeout".into()));
        state.record_attempt(Some("rate limited".into()));

        assert_eq!(state.attempts, 2);
        assert_eq!(state.last_error.as_deref(), Some("rate limited"));

        state.reset();
        assert_eq!(state.attempts, 0);
        assert!(state.last_error.is_none());
    }
}
