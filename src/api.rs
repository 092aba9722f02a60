//! Public API surface (C8, §4.1): the operations an embedding application,
//! CLI, or REST layer calls. Thin by design — every mutation here either
//! delegates straight to [`WorkflowExecutor`]/[`HookBus`] or does the one
//! extra read needed to turn a storage result into the right `ApiError`.

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::engine::{StartOptions, WorkflowExecutor};
use crate::error::ApiError;
use crate::hooks::{HookBus, HookBusError};
use crate::model::event::EventData;
use crate::model::run::RunStatus;
use crate::model::{Event, Run};
use crate::persistence::{Pagination, RunFilter, RunPage, StorageContract, StoreError};
use crate::scheduler::{Broker, BrokerMessage, QueueKind};

impl From<HookBusError> for ApiError {
    fn from(err: HookBusError) -> Self {
        match err {
            HookBusError::NoPendingHook(name, run_id) => ApiError::HookNotFound { run_id, hook_name: name },
            HookBusError::Store(e) => ApiError::Storage(e),
            HookBusError::Broker(e) => ApiError::Validation(format!("broker error: {e}")),
        }
    }
}

/// Parameters accepted by [`Api::start`], mirroring §4.1's `start(...)`.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub idempotency_key: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub max_duration_ms: Option<i64>,
}

/// The operator/application-facing handle onto the engine. Holds the same
/// `(store, broker)` pair as the executor and hook bus it wraps, so
/// constructing one is cheap and many can coexist (e.g. one per HTTP
/// handler invocation) without coordination.
pub struct Api<S: StorageContract, B: Broker> {
    executor: Arc<WorkflowExecutor<S, B>>,
    hooks: HookBus<S, B>,
}

impl<S: StorageContract, B: Broker> Api<S, B> {
    pub fn new(store: Arc<S>, broker: Arc<B>, executor: Arc<WorkflowExecutor<S, B>>) -> Self {
        let hooks = HookBus::new(store, broker);
        Self { executor, hooks }
    }

    /// §4.1 `start`. Idempotent on `(workflow_name, idempotency_key)`.
    #[instrument(skip(self, args), fields(%workflow_name))]
    pub async fn start(&self, workflow_name: &str, args: Value, request: StartRequest) -> Result<Uuid, ApiError> {
        let options = StartOptions {
            idempotency_key: request.idempotency_key,
            parent: None,
            continuation_of: None,
            tags: request.tags,
            metadata: request.metadata,
            max_duration_ms: request.max_duration_ms,
            max_recovery_attempts: None,
        };
        let run = self
            .executor
            .start_run(workflow_name, args, options)
            .await
            .map_err(|e| match e {
                crate::error::EngineError::UnknownWorkflowType(t) => ApiError::UnknownWorkflow(t),
                crate::error::EngineError::Store(e) => ApiError::Storage(e),
                other => ApiError::Validation(other.to_string()),
            })?;
        Ok(run.run_id)
    }

    /// §4.1 `cancel`. Writes `cancellation.requested` and wakes the run;
    /// terminal runs are ignored, matching the spec's "no-op on terminal".
    #[instrument(skip(self, reason), fields(%run_id))]
    pub async fn cancel(&self, run_id: Uuid, reason: Option<String>) -> Result<(), ApiError> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let events = self.executor.store().read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;
        self.executor
            .store()
            .append_events(run_id, next_sequence, vec![EventData::CancellationRequested { reason }])
            .await?;
        self.executor
            .broker()
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .map_err(|e| ApiError::Validation(format!("broker error: {e}")))?;
        Ok(())
    }

    /// §4.1 `signal_hook`. Returns `{accepted: true}` on success; a hook
    /// that is missing, already received, or expired surfaces as an error
    /// instead of `{accepted: false}` so callers can't miss it via `?`.
    #[instrument(skip(self, payload), fields(%run_id, hook_name))]
    pub async fn signal_hook(&self, run_id: Uuid, hook_name: &str, payload: Value) -> Result<(), ApiError> {
        self.hooks.signal_hook(run_id, hook_name, payload).await?;
        Ok(())
    }

    /// §4.1 `resume`. A no-op unless the run is currently SUSPENDED.
    #[instrument(skip(self), fields(%run_id))]
    pub async fn resume(&self, run_id: Uuid) -> Result<(), ApiError> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Suspended {
            return Ok(());
        }
        self.executor
            .broker()
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .map_err(|e| ApiError::Validation(format!("broker error: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), fields(%run_id))]
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, ApiError> {
        self.executor.store().get_run(run_id).await.map_err(|e| match e {
            StoreError::RunNotFound(id) => ApiError::RunNotFound(id),
            other => ApiError::Storage(other),
        })
    }

    #[instrument(skip(self), fields(%run_id))]
    pub async fn get_events(&self, run_id: Uuid) -> Result<Vec<Event>, ApiError> {
        Ok(self.executor.store().read_events(run_id, None).await?)
    }

    #[instrument(skip(self))]
    pub async fn list_runs(&self, filter: RunFilter, pagination: Pagination) -> Result<RunPage, ApiError> {
        Ok(self.executor.store().list_runs(filter, pagination).await?)
    }

    /// §6.1 `GET /workflows`: names of every registered workflow type.
    pub fn registered_workflow_types(&self) -> Vec<String> {
        self.executor.registry().workflow_types().map(str::to_string).collect()
    }

    /// Non-terminal children of `run_id` (§4.6, `runs children` in §6.2).
    /// Children that already finished are not returned; the event log for
    /// `run_id` still records their run ids if that history is needed.
    #[instrument(skip(self), fields(%run_id))]
    pub async fn list_outstanding_children(&self, run_id: Uuid) -> Result<Vec<Run>, ApiError> {
        Ok(self.executor.store().list_outstanding_children(run_id).await?)
    }

    /// Cancels the run and requests cancellation on every outstanding child
    /// per its `cancellation_policy`, without waiting for the next tick to
    /// observe it (an operator-initiated cancel, distinct from the
    /// in-tick propagation the executor does when a run finalizes as
    /// cancelled on its own).
    #[instrument(skip(self), fields(%run_id))]
    pub async fn cancel_tree(&self, run_id: Uuid, reason: Option<String>) -> Result<(), ApiError> {
        self.cancel(run_id, reason).await?;
        self.hooks
            .propagate_cancellation(run_id, crate::model::CancellationPolicy::Terminate)
            .await?;
        Ok(())
    }

    /// Best-effort: tries to cancel the pending broker message for a step
    /// task. The durable truth remains the event log (§4.4); this is only
    /// useful to avoid running a step that is about to be made moot.
    #[instrument(skip(self), fields(%run_id))]
    pub async fn cancel_pending_step_broadcast(&self, run_id: Uuid) -> Result<(), ApiError> {
        self.executor
            .broker()
            .cancel(run_id, QueueKind::StepTask)
            .await
            .map_err(|e| ApiError::Validation(format!("broker error: {e}")))
    }
}
