//! The storage contract (C2, §4.5): the single interface every persistence
//! backend implements. Pool settings, statement caches, and retry budgets
//! belong to each implementation, not here (§9 "storage backends -> one
//! interface").

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Event, EventData, Hook, Run, RunStatus, Step};
use crate::reliability::ClaimLease;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("hook not found: {0}")]
    HookNotFound(String),

    #[error("concurrency conflict on run {run_id}: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict {
        run_id: Uuid,
        expected: i32,
        actual: i32,
    },

    #[error("run {0} is already claimed")]
    AlreadyClaimed(Uuid),

    #[error("claim on run {0} is not held by this worker")]
    ClaimNotHeld(Uuid),

    #[error("hook {0} already resolved")]
    HookAlreadyResolved(String),

    #[error("run {run_id} status CAS failed: expected {expected}, actual {actual}")]
    InvalidStatusTransition {
        run_id: Uuid,
        expected: RunStatus,
        actual: RunStatus,
    },

    #[error("idempotency conflict for ({workflow_name}, {key}); existing run {existing_run_id}")]
    IdempotencyConflict {
        workflow_name: String,
        key: String,
        existing_run_id: Uuid,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// What a scheduled wake is for, so the sweeper/poller can dispatch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeKind {
    SleepElapsed,
    HookExpiry,
    MaxDuration,
}

/// A persistent timer, used when the broker has no native delayed delivery
/// (§4.4, §4.5 `schedule_wake`/`pop_due_wakes`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledWake {
    pub wake_id: Uuid,
    pub run_id: Uuid,
    pub wake_at: DateTime<Utc>,
    pub kind: WakeKind,
    /// The subject id (sleep_id/hook_id) this wake concerns, if any.
    pub subject_id: Option<String>,
}

/// Filter for `list_runs` (observability; not in the hot path).
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub cursor: Option<i64>,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPage {
    pub runs: Vec<Run>,
    pub next_cursor: Option<i64>,
}

/// The storage contract every persistence backend implements (§4.5).
///
/// Atomicity requirement: appending an event and updating run status for a
/// workflow-state transition must be committed together, or via a
/// reconciling pattern where the event is the source of truth (status is
/// derivable from the log).
#[async_trait]
pub trait StorageContract: Send + Sync {
    /// Insert atomically with a unique `(workflow_name, idempotency_key)`
    /// constraint. On conflict, returns the existing run instead of erroring.
    async fn create_run(&self, run: Run) -> Result<Run, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError>;

    async fn find_run_by_idempotency_key(
        &self,
        workflow_name: &str,
        key: &str,
    ) -> Result<Option<Run>, StoreError>;

    /// CAS on `(run_id, from_status)`. A terminal `from_status` is rejected
    /// by every implementation (terminal stickiness, §3.1).
    async fn update_run_status(
        &self,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<(), StoreError>;

    async fn set_run_result(
        &self,
        run_id: Uuid,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    async fn increment_recovery_attempts(&self, run_id: Uuid) -> Result<u32, StoreError>;

    /// Records that `run_id` finalized via `continue_as_new` into `successor_run_id` (§4.8).
    async fn set_continued_to(&self, run_id: Uuid, successor_run_id: Uuid) -> Result<(), StoreError>;

    /// Append with CAS on the next sequence number; callers retry
    /// read+compose on `ConcurrencyConflict`.
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_next_sequence: i32,
        events: Vec<EventData>,
    ) -> Result<i32, StoreError>;

    async fn read_events(
        &self,
        run_id: Uuid,
        from_sequence: Option<i32>,
    ) -> Result<Vec<Event>, StoreError>;

    async fn upsert_step(&self, step: Step) -> Result<(), StoreError>;
    async fn get_step(&self, step_id: &str) -> Result<Option<Step>, StoreError>;

    async fn upsert_hook(&self, hook: Hook) -> Result<(), StoreError>;
    async fn get_hook(&self, hook_id: &str) -> Result<Option<Hook>, StoreError>;

    /// CAS PENDING -> RECEIVED with payload. Returns `false` if the hook
    /// was not PENDING (already received, expired, or disposed).
    async fn resolve_hook(
        &self,
        hook_id: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Exclusive, time-bounded lease on a run (§4.5 `claim_run`). Acts as a
    /// lease, not a mutex: it auto-expires and tolerates worker death.
    async fn claim_run(
        &self,
        run_id: Uuid,
        worker_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<ClaimLease, StoreError>;

    async fn renew_claim(
        &self,
        run_id: Uuid,
        worker_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<ClaimLease, StoreError>;

    async fn release_claim(&self, run_id: Uuid, worker_id: Uuid) -> Result<(), StoreError>;

    /// Runs whose claim lease expired without the run reaching a terminal
    /// status (recovery sweeper input, §4.7).
    async fn list_expired_claims(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    async fn schedule_wake(&self, wake: ScheduledWake) -> Result<(), StoreError>;

    /// Pop (remove and return) every wake due at or before `now`.
    async fn pop_due_wakes(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledWake>, StoreError>;

    async fn cancel_wakes_for_run(&self, run_id: Uuid) -> Result<(), StoreError>;

    async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
    ) -> Result<RunPage, StoreError>;

    /// Child runs whose `parent_run_id` is `run_id` and that have not yet
    /// reached a terminal status (for cancellation propagation, §4.6).
    async fn list_outstanding_children(&self, run_id: Uuid) -> Result<Vec<Run>, StoreError>;
}
