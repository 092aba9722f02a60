//! The replay engine and dispatcher (C3 + C4): drives one workflow tick at
//! a time, turning a `Workflow::decide` call into durable events, scheduled
//! work, and run-status transitions.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{EngineError, WorkflowError};
use crate::model::{CancellationPolicy, Event, EventData, Hook, HookStatus, Run, RunStatus, Step};
use crate::persistence::{ScheduledWake, StorageContract, StoreError, WakeKind};
use crate::scheduler::{Broker, BrokerMessage};
use crate::workflow::definition::{Outcome, Suspend};
use crate::workflow::DecisionContext;

use super::registry::{AnyWorkflow, WorkflowRegistry};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Safety valve on runaway event logs (§4.2).
    pub max_events_per_run: usize,
    pub claim_ttl: Duration,
    pub default_nesting_limit: u32,
    pub default_max_recovery_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: 100_000,
            claim_ttl: Duration::from_secs(30),
            default_nesting_limit: crate::model::run::DEFAULT_NESTING_LIMIT,
            default_max_recovery_attempts: 5,
        }
    }
}

/// What a single `tick` produced, for callers (the poller loop, tests) that
/// want to branch on it without re-reading the run.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// New events/tasks were persisted; the run is still in flight.
    Suspended,
    Completed(Value),
    Failed(WorkflowError),
    Cancelled,
    /// The run was already terminal when the tick was picked up (can happen
    /// under at-least-once delivery); a no-op.
    AlreadyTerminal,
}

/// Options accepted by [`WorkflowExecutor::start_run`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub idempotency_key: Option<String>,
    pub parent: Option<(Uuid, u32)>,
    /// Set by `continue_as_new` (§4.8): points `parent_run_id` at the run
    /// being continued without treating the successor as its child — the
    /// nesting depth resets to 0 rather than incrementing.
    pub continuation_of: Option<Uuid>,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub max_duration_ms: Option<i64>,
    pub max_recovery_attempts: Option<u32>,
}

/// Drives replay for every registered workflow type against one storage
/// backend and one broker. Stateless across ticks: all durable state lives
/// in `store`, so any number of executors can run concurrently against the
/// same backend (§5).
pub struct WorkflowExecutor<S: StorageContract, B: Broker> {
    store: Arc<S>,
    broker: Arc<B>,
    registry: WorkflowRegistry,
    config: EngineConfig,
    worker_id: Uuid,
}

impl<S: StorageContract, B: Broker> WorkflowExecutor<S, B> {
    pub fn new(store: Arc<S>, broker: Arc<B>) -> Self {
        Self::with_config(store, broker, EngineConfig::default())
    }

    pub fn with_config(store: Arc<S>, broker: Arc<B>, config: EngineConfig) -> Self {
        Self {
            store,
            broker,
            registry: WorkflowRegistry::new(),
            config,
            worker_id: Uuid::now_v7(),
        }
    }

    pub fn register<W: crate::workflow::Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Start a new run. Idempotent on `(workflow_name, idempotency_key)`:
    /// a repeat call with the same key returns the original run without
    /// creating a second one or re-enqueuing a tick (§8.4 S4).
    #[instrument(skip(self, input), fields(%workflow_name))]
    pub async fn start_run(
        &self,
        workflow_name: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<Run, EngineError> {
        if !self.registry.contains(workflow_name) {
            return Err(EngineError::UnknownWorkflowType(workflow_name.to_string()));
        }

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self
                .store
                .find_run_by_idempotency_key(workflow_name, key)
                .await?
            {
                debug!(run_id = %existing.run_id, "idempotent start returned existing run");
                return Ok(existing);
            }
        }

        let nesting_depth = options.parent.map(|(_, depth)| depth + 1).unwrap_or(0);
        if nesting_depth > self.config.default_nesting_limit {
            return Err(EngineError::NestingLimitExceeded(
                self.config.default_nesting_limit,
            ));
        }

        let mut run = Run::new(workflow_name, input.clone(), Value::Null)
            .with_tags(options.tags)
            .with_metadata(options.metadata);
        if let Some(key) = options.idempotency_key {
            run = run.with_idempotency_key(key);
        }
        if let Some((parent_run_id, parent_depth)) = options.parent {
            run = run.with_parent(parent_run_id, parent_depth);
        }
        if let Some(continued_from) = options.continuation_of {
            run.parent_run_id = Some(continued_from);
        }
        if let Some(max_duration_ms) = options.max_duration_ms {
            run = run.with_max_duration_ms(max_duration_ms);
        }
        if let Some(max_attempts) = options.max_recovery_attempts {
            run.max_recovery_attempts = max_attempts;
        }

        let run = self.store.create_run(run).await?;
        info!(run_id = %run.run_id, workflow_name, "starting new run");

        self.store
            .append_events(
                run.run_id,
                1,
                vec![EventData::WorkflowStarted {
                    workflow_name: workflow_name.to_string(),
                    input_args: input,
                    input_kwargs: Value::Null,
                }],
            )
            .await?;

        self.broker
            .enqueue(BrokerMessage::workflow_tick(run.run_id))
            .await
            .map_err(|e| EngineError::Broker(e.to_string()))?;

        Ok(run)
    }

    /// Run one decision tick: claim the run, replay it against its event
    /// log, persist whatever the tick produced, and leave the run either
    /// in flight or terminal.
    #[instrument(skip(self))]
    pub async fn tick(&self, run_id: Uuid) -> Result<DispatchOutcome, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(DispatchOutcome::AlreadyTerminal);
        }

        self.store
            .claim_run(run_id, self.worker_id, self.config.claim_ttl)
            .await?;

        let result = self.tick_claimed(run).await;

        if let Err(e) = self.store.release_claim(run_id, self.worker_id).await {
            warn!(%run_id, error = %e, "failed to release claim after tick");
        }

        result
    }

    async fn tick_claimed(&self, run: Run) -> Result<DispatchOutcome, EngineError> {
        let run_id = run.run_id;
        let events = self.store.read_events(run_id, None).await?;
        if events.len() > self.config.max_events_per_run {
            return Err(EngineError::ReplayDivergence(format!(
                "run {run_id} exceeded max_events_per_run ({})",
                self.config.max_events_per_run
            )));
        }

        // §4.2 step 3: a cancellation already recorded is honored before the
        // body runs again, not only once it happens to hit a fresh
        // checkpoint — a run parked on an already-started sleep/hook/child
        // await would otherwise never see it. A step mid-flight still runs
        // to completion first (§4.2 "Checkpoints").
        let cancellation_requested = events.iter().any(|e| matches!(e.data, EventData::CancellationRequested { .. }));
        if cancellation_requested && !Self::has_unresolved_step(&events) {
            let next_sequence = events.len() as i32 + 1;
            self.finalize(
                run_id,
                run.status,
                next_sequence,
                EventData::WorkflowCancelled { reason: None },
                RunStatus::Cancelled,
                None,
                None,
            )
            .await?;
            self.settle_parent(&run).await?;
            self.propagate_cancellation(&run).await?;
            return Ok(DispatchOutcome::Cancelled);
        }

        let mut workflow = self.registry.create(&run.workflow_name, run.input_args.clone())?;
        let nesting_limit = self.config.default_nesting_limit;
        let mut ctx = DecisionContext::new(run_id, &events, chrono::Utc::now(), run.nesting_depth, nesting_limit);
        let decision = workflow.decide(&mut ctx);
        let output = ctx.into_output();

        let mut next_sequence = events.len() as i32 + 1;
        if !output.new_events.is_empty() {
            next_sequence = self
                .store
                .append_events(run_id, next_sequence, output.new_events)
                .await?
                + 1;
        }

        for new_step in output.step_tasks {
            self.store
                .upsert_step(Step::new(
                    run_id,
                    &new_step.step_name,
                    new_step.call_index,
                    new_step.options.retry_policy.clone(),
                    new_step.options.timeout.map(|d| d.as_millis() as u64),
                ))
                .await?;
            self.broker
                .enqueue(BrokerMessage::step_task(run_id, new_step.step_id))
                .await
                .map_err(|e| EngineError::Broker(e.to_string()))?;
        }

        for timer in output.sleep_timers {
            self.store
                .schedule_wake(ScheduledWake {
                    wake_id: Uuid::now_v7(),
                    run_id,
                    wake_at: timer.wake_at,
                    kind: WakeKind::SleepElapsed,
                    subject_id: Some(timer.sleep_id),
                })
                .await?;
        }

        for new_hook in output.hooks_created {
            self.store
                .upsert_hook(Hook::new(
                    run_id,
                    &new_hook.name,
                    new_hook.call_index,
                    new_hook.schema,
                    new_hook.expires_at,
                ))
                .await?;
            if let Some(expires_at) = new_hook.expires_at {
                self.store
                    .schedule_wake(ScheduledWake {
                        wake_id: Uuid::now_v7(),
                        run_id,
                        wake_at: expires_at,
                        kind: WakeKind::HookExpiry,
                        subject_id: Some(new_hook.hook_id),
                    })
                    .await?;
            }
        }

        for child in output.child_starts {
            let mut child_options = StartOptions {
                parent: Some((run_id, run.nesting_depth)),
                ..Default::default()
            };
            child_options.tags = Vec::new();
            let started = Box::pin(self.start_run(&child.workflow_name, child.input, child_options)).await;
            if let Err(e) = started {
                warn!(%run_id, child = %child.child_run_id, error = %e, "failed to start child run");
            }
        }

        match decision {
            Ok(Outcome::Complete(value)) => {
                self.finalize(run_id, run.status, next_sequence, EventData::WorkflowCompleted { result: value.clone() }, RunStatus::Completed, Some(value), None).await?;
                self.settle_parent(&run).await?;
                Ok(DispatchOutcome::Completed(self.store.get_run(run_id).await?.result.unwrap_or(Value::Null)))
            }
            Ok(Outcome::Failed(err)) => {
                let error_value = err.to_value();
                self.finalize(run_id, run.status, next_sequence, EventData::WorkflowFailed { error: error_value.clone() }, RunStatus::Failed, None, Some(error_value)).await?;
                self.settle_parent(&run).await?;
                Ok(DispatchOutcome::Failed(err))
            }
            Ok(Outcome::Cancelled) => {
                self.finalize(run_id, run.status, next_sequence, EventData::WorkflowCancelled { reason: None }, RunStatus::Cancelled, None, None).await?;
                self.settle_parent(&run).await?;
                self.propagate_cancellation(&run).await?;
                Ok(DispatchOutcome::Cancelled)
            }
            Err(Suspend::Pending) => {
                self.mark_in_flight(run_id, run.status, &events).await?;
                Ok(DispatchOutcome::Suspended)
            }
            Err(Suspend::Cancelled) => {
                self.finalize(run_id, run.status, next_sequence, EventData::WorkflowCancelled { reason: Some("cancellation checkpoint".into()) }, RunStatus::Cancelled, None, None).await?;
                self.settle_parent(&run).await?;
                self.propagate_cancellation(&run).await?;
                Ok(DispatchOutcome::Cancelled)
            }
            Err(Suspend::StepFailed(step_error)) => {
                let err = WorkflowError::from_step_error(&step_error);
                let error_value = err.to_value();
                self.finalize(run_id, run.status, next_sequence, EventData::WorkflowFailed { error: error_value.clone() }, RunStatus::Failed, None, Some(error_value)).await?;
                self.settle_parent(&run).await?;
                Ok(DispatchOutcome::Failed(err))
            }
            Err(Suspend::ChildFailed(err)) => {
                let error_value = err.to_value();
                self.finalize(run_id, run.status, next_sequence, EventData::WorkflowFailed { error: error_value.clone() }, RunStatus::Failed, None, Some(error_value)).await?;
                self.settle_parent(&run).await?;
                Ok(DispatchOutcome::Failed(err))
            }
            Err(Suspend::ChildCancelled) => {
                self.finalize(run_id, run.status, next_sequence, EventData::WorkflowCancelled { reason: Some("child workflow cancelled".into()) }, RunStatus::Cancelled, None, None).await?;
                self.settle_parent(&run).await?;
                Ok(DispatchOutcome::Cancelled)
            }
            Err(Suspend::NestingLimitExceeded(limit)) => {
                let err = WorkflowError::nesting_limit_exceeded(limit);
                let error_value = err.to_value();
                self.finalize(run_id, run.status, next_sequence, EventData::WorkflowFailed { error: error_value.clone() }, RunStatus::Failed, None, Some(error_value)).await?;
                self.settle_parent(&run).await?;
                Ok(DispatchOutcome::Failed(err))
            }
            Err(Suspend::HookExpired { hook_id }) => {
                let err = WorkflowError::new(format!("hook expired: {hook_id}")).with_code("hook_expired");
                let error_value = err.to_value();
                self.finalize(run_id, run.status, next_sequence, EventData::WorkflowFailed { error: error_value.clone() }, RunStatus::Failed, None, Some(error_value)).await?;
                self.settle_parent(&run).await?;
                Ok(DispatchOutcome::Failed(err))
            }
            Ok(Outcome::ContinueAsNew(new_input)) => {
                let continuation_options = StartOptions {
                    continuation_of: Some(run_id),
                    tags: run.tags.clone(),
                    metadata: run.metadata.clone(),
                    max_duration_ms: run.max_duration_ms,
                    max_recovery_attempts: Some(run.max_recovery_attempts),
                    ..Default::default()
                };
                let successor =
                    Box::pin(self.start_run(&run.workflow_name, new_input, continuation_options)).await?;
                self.store
                    .append_events(
                        run_id,
                        next_sequence,
                        vec![EventData::WorkflowContinuedAsNew { next_run_id: successor.run_id }],
                    )
                    .await?;
                self.store.set_continued_to(run_id, successor.run_id).await?;
                self.store
                    .update_run_status(run_id, run.status, RunStatus::Completed)
                    .await?;
                self.store.cancel_wakes_for_run(run_id).await?;
                self.broker
                    .cancel(run_id, crate::scheduler::QueueKind::WorkflowTick)
                    .await
                    .map_err(|e| EngineError::Broker(e.to_string()))?;
                self.settle_parent(&run).await?;
                Ok(DispatchOutcome::Completed(Value::Null))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        run_id: Uuid,
        from_status: RunStatus,
        next_sequence: i32,
        terminal_event: EventData,
        to_status: RunStatus,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<(), EngineError> {
        self.store
            .append_events(run_id, next_sequence, vec![terminal_event])
            .await?;
        self.store.set_run_result(run_id, result, error).await?;
        self.store
            .update_run_status(run_id, from_status, to_status)
            .await?;
        self.store.cancel_wakes_for_run(run_id).await?;
        self.dispose_pending_hooks(run_id).await?;
        self.broker
            .cancel(run_id, crate::scheduler::QueueKind::WorkflowTick)
            .await
            .map_err(|e| EngineError::Broker(e.to_string()))?;
        Ok(())
    }

    /// A run that just went terminal can never receive another hook signal
    /// (§4.6 S5): any hook still PENDING on its log is marked DISPOSED
    /// instead of left to linger until its own `expires_at` wake fires.
    async fn dispose_pending_hooks(&self, run_id: Uuid) -> Result<(), EngineError> {
        let events = self.store.read_events(run_id, None).await?;
        for event in &events {
            if let EventData::HookCreated { hook_id, .. } = &event.data {
                if let Some(mut hook) = self.store.get_hook(hook_id).await? {
                    if hook.status == HookStatus::Pending {
                        hook.status = HookStatus::Disposed;
                        self.store.upsert_hook(hook).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// A tick that suspended leaves RUNNING as-is if it just dispatched step
    /// work (a worker will call back in), or moves to SUSPENDED if all it
    /// did was start waiting on a timer/hook/child (§4.2).
    async fn mark_in_flight(&self, run_id: Uuid, from_status: RunStatus, events: &[Event]) -> Result<(), EngineError> {
        let target = if Self::has_unresolved_step(events) {
            RunStatus::Running
        } else {
            RunStatus::Suspended
        };
        if from_status != target && !from_status.is_terminal() {
            let _ = self.store.update_run_status(run_id, from_status, target).await;
        }
        Ok(())
    }

    /// True while a dispatched step has no terminal event yet anywhere in
    /// the log — the simple "any step ever completed" read is a coarse
    /// stand-in for "the most recently started step is still open", but it
    /// only needs to distinguish RUNNING-with-a-step-in-flight from
    /// SUSPENDED-on-a-timer/hook/child, not track per-step state.
    fn has_unresolved_step(events: &[Event]) -> bool {
        events.iter().any(|e| matches!(e.data, EventData::StepStarted { .. }))
            && !events.iter().any(|e| matches!(e.data, EventData::StepCompleted { .. } | EventData::StepFailed { .. }))
    }

    /// When a child run reaches a terminal state, write the corresponding
    /// `child_workflow.*` event onto the parent's log and re-enqueue its
    /// tick, rather than keep an in-memory pointer across ticks (§9).
    async fn settle_parent(&self, run: &Run) -> Result<(), EngineError> {
        let Some(parent_run_id) = run.parent_run_id else {
            return Ok(());
        };
        let parent = match self.store.get_run(parent_run_id).await {
            Ok(parent) => parent,
            Err(StoreError::RunNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if parent.status.is_terminal() {
            return Ok(());
        }

        let refreshed = self.store.get_run(run.run_id).await?;
        let event = match refreshed.status {
            RunStatus::Completed => EventData::ChildWorkflowCompleted {
                child_run_id: run.run_id,
                result: refreshed.result.unwrap_or(Value::Null),
            },
            RunStatus::Failed => EventData::ChildWorkflowFailed {
                child_run_id: run.run_id,
                error: refreshed.error.unwrap_or(Value::Null),
            },
            RunStatus::Cancelled | RunStatus::Interrupted => {
                EventData::ChildWorkflowCancelled { child_run_id: run.run_id }
            }
            _ => return Ok(()),
        };

        let parent_events = self.store.read_events(parent_run_id, None).await?;
        let next_sequence = parent_events.len() as i32 + 1;
        self.store
            .append_events(parent_run_id, next_sequence, vec![event])
            .await?;
        self.broker
            .enqueue(BrokerMessage::workflow_tick(parent_run_id))
            .await
            .map_err(|e| EngineError::Broker(e.to_string()))?;
        Ok(())
    }

    /// TERMINATE cancellation policy: ask every outstanding child to cancel
    /// too (§4.6 S6). ABANDON and WAIT leave children alone; WAIT's
    /// "block the parent" half is enforced by the parent's own `decide`
    /// awaiting the child, not here.
    async fn propagate_cancellation(&self, run: &Run) -> Result<(), EngineError> {
        let children = self.store.list_outstanding_children(run.run_id).await?;
        for child in children {
            self.request_cancellation(child.run_id, CancellationPolicy::Terminate)
                .await?;
        }
        Ok(())
    }

    /// Write `cancellation.requested` onto a run's log and wake it, unless
    /// it is already terminal.
    pub async fn request_cancellation(&self, run_id: Uuid, _policy: CancellationPolicy) -> Result<(), EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let events = self.store.read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;
        self.store
            .append_events(run_id, next_sequence, vec![EventData::CancellationRequested { reason: None }])
            .await?;
        self.broker
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .map_err(|e| EngineError::Broker(e.to_string()))?;
        Ok(())
    }

    /// Called by a worker after successfully executing a step.
    #[instrument(skip(self, result))]
    pub async fn complete_step(&self, run_id: Uuid, step_id: &str, result: Value) -> Result<(), EngineError> {
        let events = self.store.read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;
        self.store
            .append_events(
                run_id,
                next_sequence,
                vec![EventData::StepCompleted {
                    step_id: step_id.to_string(),
                    result,
                }],
            )
            .await?;
        if let Some(mut step) = self.store.get_step(step_id).await? {
            step.status = crate::model::StepStatus::Completed;
            step.updated_at = chrono::Utc::now();
            self.store.upsert_step(step).await?;
        }
        self.broker
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .map_err(|e| EngineError::Broker(e.to_string()))?;
        Ok(())
    }

    /// Called by a worker after a step errored. Retries in place (writing a
    /// `step.retrying` event and re-enqueuing the same step task with
    /// backoff) while attempts remain and the error is retryable; otherwise
    /// writes a terminal `step.failed` event and wakes the workflow tick so
    /// the body's `?` can observe it (§4.2 step-task lifecycle).
    #[instrument(skip(self, error))]
    pub async fn fail_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        error: crate::error::StepError,
    ) -> Result<(), EngineError> {
        let mut step = self
            .store
            .get_step(step_id)
            .await?
            .ok_or_else(|| EngineError::ReplayDivergence(format!("step not found: {step_id}")))?;

        let events = self.store.read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;

        let retryable = error.retryable
            && step.retry_policy.should_retry(error.error_type.as_deref())
            && step.has_attempts_remaining();

        if retryable {
            step.attempt += 1;
            let delay_ms = step.next_retry_delay().as_millis() as u64;
            step.updated_at = chrono::Utc::now();
            self.store.upsert_step(step.clone()).await?;

            self.store
                .append_events(
                    run_id,
                    next_sequence,
                    vec![EventData::StepRetrying {
                        step_id: step_id.to_string(),
                        attempt: step.attempt,
                        delay_ms,
                    }],
                )
                .await?;

            let not_before = chrono::Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
            self.broker
                .enqueue(BrokerMessage::step_task(run_id, step_id).with_delay(not_before))
                .await
                .map_err(|e| EngineError::Broker(e.to_string()))?;
            return Ok(());
        }

        step.status = crate::model::StepStatus::Failed;
        step.error = Some(error.to_value());
        step.updated_at = chrono::Utc::now();
        self.store.upsert_step(step).await?;

        self.store
            .append_events(
                run_id,
                next_sequence,
                vec![EventData::StepFailed {
                    step_id: step_id.to_string(),
                    error: error.to_value(),
                }],
            )
            .await?;
        self.broker
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .map_err(|e| EngineError::Broker(e.to_string()))?;
        Ok(())
    }
}
