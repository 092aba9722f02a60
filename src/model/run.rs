//! Run record: one end-to-end execution of a workflow definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default bound on parent/child nesting depth (§3.1).
pub const DEFAULT_NESTING_LIMIT: u32 = 3;

/// Status of a run. COMPLETED, FAILED, CANCELLED and INTERRUPTED are terminal
/// and sticky: once reached, no further event changes a run's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Interrupted,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses are sticky: no further event may change them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Interrupted | Self::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// How cancellation of a parent propagates to an outstanding child run (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Write `cancellation.requested` on the child too. Default.
    #[default]
    Terminate,
    /// Leave the child running independently of the parent.
    Abandon,
    /// Block the parent's own termination until the child reaches a terminal state.
    Wait,
}

/// A single execution of a workflow definition against concrete inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub input_args: Value,
    pub input_kwargs: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_run_id: Option<Uuid>,
    pub nesting_depth: u32,
    pub idempotency_key: Option<String>,
    pub recovery_attempts: u32,
    pub max_recovery_attempts: u32,
    pub max_duration_ms: Option<i64>,
    pub metadata: Value,
    pub tags: Vec<String>,
    /// Set when this run finalized via `continue_as_new`; points at the successor.
    pub continued_to_run_id: Option<Uuid>,
}

impl Run {
    pub fn new(workflow_name: impl Into<String>, input_args: Value, input_kwargs: Value) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            input_args,
            input_kwargs,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            parent_run_id: None,
            nesting_depth: 0,
            idempotency_key: None,
            recovery_attempts: 0,
            max_recovery_attempts: 5,
            max_duration_ms: None,
            metadata: Value::Null,
            tags: Vec::new(),
            continued_to_run_id: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_parent(mut self, parent_run_id: Uuid, parent_nesting_depth: u32) -> Self {
        self.parent_run_id = Some(parent_run_id);
        self.nesting_depth = parent_nesting_depth + 1;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_duration_ms(mut self, max_duration_ms: i64) -> Self {
        self.max_duration_ms = Some(max_duration_ms);
        self
    }

    pub fn exceeds_nesting_limit(&self, limit: u32) -> bool {
        self.nesting_depth > limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Interrupted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn new_run_defaults() {
        let run = Run::new("order_wf", Value::Null, Value::Null);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.nesting_depth, 0);
        assert!(run.parent_run_id.is_none());
        assert!(run.idempotency_key.is_none());
    }

    #[test]
    fn child_nesting_depth_derives_from_parent() {
        let parent_id = Uuid::now_v7();
        let child = Run::new("child_wf", Value::Null, Value::Null).with_parent(parent_id, 2);
        assert_eq!(child.parent_run_id, Some(parent_id));
        assert_eq!(child.nesting_depth, 3);
        assert!(child.exceeds_nesting_limit(2));
        assert!(!child.exceeds_nesting_limit(3));
    }
}
