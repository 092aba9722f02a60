//! Per-operation options a workflow body attaches to a step or child spawn.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::CancellationPolicy;
use crate::reliability::RetryPolicy;

/// Options attached to a `step` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOptions {
    pub retry_policy: RetryPolicy,

    #[serde(with = "crate::reliability::retry::option_duration_millis", default)]
    pub timeout: Option<Duration>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            timeout: None,
        }
    }
}

impl StepOptions {
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options attached to `start_child_workflow` (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildWorkflowOptions {
    /// Whether the parent awaits the child's terminal event before proceeding.
    pub wait: bool,
    pub cancellation_policy: CancellationPolicy,
}

impl Default for ChildWorkflowOptions {
    fn default() -> Self {
        Self {
            wait: true,
            cancellation_policy: CancellationPolicy::default(),
        }
    }
}

impl ChildWorkflowOptions {
    pub fn fire_and_forget(cancellation_policy: CancellationPolicy) -> Self {
        Self {
            wait: false,
            cancellation_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_options_defaults() {
        let opts = StepOptions::default();
        assert_eq!(opts.retry_policy.max_attempts, 5);
        assert!(opts.timeout.is_none());
    }

    #[test]
    fn child_options_defaults_to_waiting_terminate() {
        let opts = ChildWorkflowOptions::default();
        assert!(opts.wait);
        assert_eq!(opts.cancellation_policy, CancellationPolicy::Terminate);
    }

    #[test]
    fn fire_and_forget_does_not_wait() {
        let opts = ChildWorkflowOptions::fire_and_forget(CancellationPolicy::Abandon);
        assert!(!opts.wait);
    }
}
