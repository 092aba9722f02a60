//! Retry policy: exponential backoff with jitter for step retries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for step retries (§4.2 step-task lifecycle).
///
/// # Example
///
/// ```
/// use durable_workflow::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means +-10% randomness.
    pub jitter: f64,

    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Backoff before the step's next attempt. `attempt` is the `Step`
    /// model's own 0-based counter (`Step::attempt`, bumped once per failed
    /// try), so `attempt == 0` — nothing has failed yet — has no delay.
    ///
    /// `per_attempt_timeout`, when the step was started with one, caps the
    /// result: a policy that keeps growing past a step's own attempt budget
    /// would otherwise schedule a retry no worker will still be waiting on.
    pub fn delay_for_attempt(&self, attempt: u32, per_attempt_timeout: Option<Duration>) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let growth = self.backoff_coefficient.powi(attempt as i32 - 1);
        let base = (self.initial_interval.as_secs_f64() * growth).min(self.max_interval.as_secs_f64());

        let with_jitter = if self.jitter > 0.0 {
            let span = base * self.jitter;
            base + rand::thread_rng().gen_range(0.0..=span)
        } else {
            base
        };

        let bounded = match per_attempt_timeout {
            Some(timeout) => with_jitter.min(timeout.as_secs_f64()),
            None => with_jitter,
        };

        Duration::from_secs_f64(bounded.max(0.0))
    }

    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        if let Some(error_type) = error_type {
            !self.non_retryable_errors.contains(&error_type.to_string())
        } else {
            true
        }
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for `Duration` as milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for `Option<Duration>` as milliseconds.
pub mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn no_retry_has_one_attempt() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn fixed_interval_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);
        assert_eq!(policy.delay_for_attempt(1, None), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2, None), Duration::from_secs(5));
    }

    #[test]
    fn delay_grows_exponentially_from_the_first_failed_attempt() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);
        // attempt 0: nothing has failed yet, no backoff.
        assert_eq!(policy.delay_for_attempt(0, None), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3, None), Duration::from_secs(4));
    }

    #[test]
    fn max_interval_caps_delay() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(10, None), Duration::from_secs(5));
    }

    #[test]
    fn per_attempt_timeout_caps_delay_below_the_policy_interval() {
        // A step given only a 2s per-attempt timeout shouldn't be told to
        // wait 4s for its next try even though the policy would allow it.
        let policy = RetryPolicy::exponential().with_jitter(0.0);
        let delay = policy.delay_for_attempt(3, Some(Duration::from_secs(2)));
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn jitter_only_ever_adds_to_the_base_delay() {
        let policy = RetryPolicy::exponential().with_jitter(0.5);
        for _ in 0..20 {
            let delay = policy.delay_for_attempt(2, None);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(3_000));
        }
    }

    #[test]
    fn non_retryable_errors_are_excluded() {
        let policy = RetryPolicy::exponential()
            .with_non_retryable_error("INVALID_INPUT")
            .with_non_retryable_error("NOT_FOUND");

        assert!(!policy.should_retry(Some("INVALID_INPUT")));
        assert!(!policy.should_retry(Some("NOT_FOUND")));
        assert!(policy.should_retry(Some("TIMEOUT")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn attempts_remaining() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn serialization_round_trip() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_non_retryable_error("TEST");
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
