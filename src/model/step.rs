//! Step record: durable summary of one logical invocation of a step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::reliability::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Deterministically derives `step_id = hash(run_id, step_name, call_index)`
/// (§3.1) so correlation survives across ticks without a central counter.
pub fn derive_step_id(run_id: Uuid, step_name: &str, call_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(step_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(call_index.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Durable index entry for one step invocation, derivable from events but
/// persisted separately so lookups don't require replaying the full log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub run_id: Uuid,
    pub step_name: String,
    pub call_index: u32,
    pub status: StepStatus,
    pub attempt: u32,
    pub retry_policy: RetryPolicy,
    /// Wall-clock budget for one attempt, carried over from the call's
    /// `StepOptions::timeout` so `fail_step` can cap backoff against it.
    pub timeout_ms: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn new(
        run_id: Uuid,
        step_name: impl Into<String>,
        call_index: u32,
        retry_policy: RetryPolicy,
        timeout_ms: Option<u64>,
    ) -> Self {
        let step_name = step_name.into();
        let now = Utc::now();
        Self {
            step_id: derive_step_id(run_id, &step_name, call_index),
            run_id,
            step_name,
            call_index,
            status: StepStatus::Pending,
            attempt: 0,
            retry_policy,
            timeout_ms,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `self.attempt` counts *prior* failures, so the failure just recorded
    /// is attempt number `self.attempt + 1` against the policy's 1-based
    /// `max_attempts` budget.
    pub fn has_attempts_remaining(&self) -> bool {
        self.retry_policy.has_attempts_remaining(self.attempt + 1)
    }

    /// Backoff before the next attempt, capped against `timeout_ms` so a
    /// slow-growing policy never schedules a retry past a step's own
    /// per-attempt budget.
    pub fn next_retry_delay(&self) -> std::time::Duration {
        let timeout = self.timeout_ms.map(std::time::Duration::from_millis);
        self.retry_policy.delay_for_attempt(self.attempt, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_id_is_deterministic() {
        let run_id = Uuid::now_v7();
        let a = derive_step_id(run_id, "charge", 1);
        let b = derive_step_id(run_id, "charge", 1);
        assert_eq!(a, b);
    }

    #[test]
    fn step_id_differs_by_call_index_and_name() {
        let run_id = Uuid::now_v7();
        let a = derive_step_id(run_id, "charge", 1);
        let b = derive_step_id(run_id, "charge", 2);
        let c = derive_step_id(run_id, "notify", 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn attempts_remaining() {
        let run_id = Uuid::now_v7();
        let policy = RetryPolicy::exponential().with_max_attempts(3);
        let mut step = Step::new(run_id, "flaky", 0, policy, None);
        assert!(step.has_attempts_remaining());
        step.attempt = 3;
        assert!(!step.has_attempts_remaining());
    }

    #[test]
    fn retry_delay_is_capped_by_step_timeout() {
        let run_id = Uuid::now_v7();
        let policy = RetryPolicy::exponential().with_jitter(0.0);
        let mut step = Step::new(run_id, "flaky", 0, policy, Some(500));
        step.attempt = 4;
        assert_eq!(step.next_retry_delay(), std::time::Duration::from_millis(500));
    }
}
