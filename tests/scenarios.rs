//! Concrete scenarios (§8.4): each drives `WorkflowExecutor` directly against
//! `InMemoryStore`/`InMemoryBroker`, playing the role a `WorkerPool` would —
//! ticking the workflow and resolving step tasks by hand — so the assertions
//! can pin down exact event sequences instead of racing a background loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use durable_workflow::engine::{EngineConfig, StartOptions, WorkflowExecutor};
use durable_workflow::error::StepError;
use durable_workflow::model::event::EventType;
use durable_workflow::model::{CancellationPolicy, HookStatus, RunStatus};
use durable_workflow::persistence::{InMemoryStore, StorageContract};
use durable_workflow::reliability::RetryPolicy;
use durable_workflow::scheduler::InMemoryBroker;
use durable_workflow::workflow::action::{ChildWorkflowOptions, StepOptions};
use durable_workflow::workflow::definition::{Outcome, Suspend, Workflow};
use durable_workflow::workflow::DecisionContext;
use serde_json::{json, Value};

fn setup() -> (Arc<InMemoryStore>, Arc<InMemoryBroker>, WorkflowExecutor<InMemoryStore, InMemoryBroker>) {
    let store = Arc::new(InMemoryStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let executor = WorkflowExecutor::with_config(store.clone(), broker.clone(), EngineConfig::default());
    (store, broker, executor)
}

/// Ticks until the run reaches a terminal status or `max_ticks` is spent,
/// resolving every step the workflow dispatches along the way with `step_fn`.
async fn drive(
    executor: &WorkflowExecutor<InMemoryStore, InMemoryBroker>,
    store: &InMemoryStore,
    run_id: uuid::Uuid,
    step_fn: impl Fn(&str, u32) -> Result<Value, StepError>,
    max_ticks: usize,
) {
    for _ in 0..max_ticks {
        executor.tick(run_id).await.unwrap();
        let run = store.get_run(run_id).await.unwrap();
        if run.status.is_terminal() {
            return;
        }
        let events = store.read_events(run_id, None).await.unwrap();
        for event in &events {
            if let durable_workflow::model::EventData::StepStarted { step_id, call_index, .. } = &event.data {
                if store.get_step(step_id).await.unwrap().map(|s| s.status.is_terminal()).unwrap_or(false) {
                    continue;
                }
                match step_fn(step_id, *call_index) {
                    Ok(result) => executor.complete_step(run_id, step_id, result).await.unwrap(),
                    Err(error) => executor.fail_step(run_id, step_id, error).await.unwrap(),
                }
            }
        }
    }
}

// ---- S1: basic three-step run -------------------------------------------

struct OrderWorkflow;

impl Workflow for OrderWorkflow {
    const TYPE: &'static str = "order_wf";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
        ctx.step("validate", Value::Null, StepOptions::default())?;
        ctx.step("charge", Value::Null, StepOptions::default())?;
        ctx.step("notify", Value::Null, StepOptions::default())?;
        Ok(Outcome::Complete(json!({"ok": true})))
    }
}

#[tokio::test]
async fn s1_basic_three_step_run_completes_in_order() {
    let (store, _broker, mut executor) = setup();
    executor.register::<OrderWorkflow>();
    let executor = Arc::new(executor);

    let run = executor
        .start_run("order_wf", json!({"order_id": "A", "amount": 10}), StartOptions::default())
        .await
        .unwrap();

    drive(&executor, &store, run.run_id, |_, _| Ok(json!({"ok": true})), 10).await;

    let run = store.get_run(run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let events = store.read_events(run.run_id, None).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec![
            EventType::WorkflowStarted,
            EventType::StepStarted,
            EventType::StepCompleted,
            EventType::StepStarted,
            EventType::StepCompleted,
            EventType::StepStarted,
            EventType::StepCompleted,
            EventType::WorkflowCompleted,
        ]
    );
}

// ---- S2: retry then succeed ----------------------------------------------

struct FlakyWorkflow;

impl Workflow for FlakyWorkflow {
    const TYPE: &'static str = "flaky_wf";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
        let retry_policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let result = ctx.step("flaky", Value::Null, StepOptions::default().with_retry_policy(retry_policy))?;
        Ok(Outcome::Complete(result))
    }
}

#[tokio::test]
async fn s2_retry_then_succeed() {
    let (store, _broker, mut executor) = setup();
    executor.register::<FlakyWorkflow>();
    let executor = Arc::new(executor);

    let run = executor.start_run("flaky_wf", Value::Null, StartOptions::default()).await.unwrap();

    let attempts = std::sync::atomic::AtomicU32::new(0);
    drive(
        &executor,
        &store,
        run.run_id,
        |_, _| {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 2 {
                Err(StepError::retryable("not yet"))
            } else {
                Ok(json!({"ok": true}))
            }
        },
        20,
    )
    .await;

    let run = store.get_run(run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let events = store.read_events(run.run_id, None).await.unwrap();
    let retrying: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.data, durable_workflow::model::EventData::StepRetrying { .. }))
        .collect();
    assert_eq!(retrying.len(), 2);
    let completed = events
        .iter()
        .filter(|e| matches!(e.data, durable_workflow::model::EventData::StepCompleted { .. }))
        .count();
    assert_eq!(completed, 1);
}

// ---- S3: sleep across crash -----------------------------------------------

struct SleepsThenStepsWorkflow;

impl Workflow for SleepsThenStepsWorkflow {
    const TYPE: &'static str = "sleeps_then_steps";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
        ctx.sleep("pause", Duration::from_secs(30))?;
        ctx.step("after_sleep", Value::Null, StepOptions::default())?;
        Ok(Outcome::Complete(json!({"ok": true})))
    }
}

#[tokio::test]
async fn s3_sleep_survives_a_fresh_executor_instance() {
    let store = Arc::new(InMemoryStore::new());
    let broker = Arc::new(InMemoryBroker::new());

    let run_id = {
        let mut executor = WorkflowExecutor::with_config(store.clone(), broker.clone(), EngineConfig::default());
        executor.register::<SleepsThenStepsWorkflow>();
        let run = executor.start_run("sleeps_then_steps", Value::Null, StartOptions::default()).await.unwrap();
        executor.tick(run.run_id).await.unwrap();
        run.run_id
    };

    // Simulate the worker that started the sleep crashing: a brand new
    // executor (same store) picks the run back up once the wake is due.
    let due_wakes = store.pop_due_wakes(Utc::now() + chrono::Duration::seconds(31)).await.unwrap();
    assert_eq!(due_wakes.len(), 1);
    store
        .append_events(
            run_id,
            store.read_events(run_id, None).await.unwrap().len() as i32 + 1,
            vec![durable_workflow::model::EventData::SleepCompleted {
                sleep_id: due_wakes[0].subject_id.clone().unwrap(),
            }],
        )
        .await
        .unwrap();

    let mut resumed_executor = WorkflowExecutor::with_config(store.clone(), broker.clone(), EngineConfig::default());
    resumed_executor.register::<SleepsThenStepsWorkflow>();
    let resumed_executor = Arc::new(resumed_executor);
    drive(&resumed_executor, &store, run_id, |_, _| Ok(json!({"ok": true})), 10).await;

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let events = store.read_events(run_id, None).await.unwrap();
    let sleep_started = events.iter().filter(|e| matches!(e.data, durable_workflow::model::EventData::SleepStarted { .. })).count();
    let sleep_completed = events.iter().filter(|e| matches!(e.data, durable_workflow::model::EventData::SleepCompleted { .. })).count();
    let after_sleep_starts = events
        .iter()
        .filter(|e| matches!(&e.data, durable_workflow::model::EventData::StepStarted { step_name, .. } if step_name == "after_sleep"))
        .count();
    assert_eq!(sleep_started, 1);
    assert_eq!(sleep_completed, 1);
    assert_eq!(after_sleep_starts, 1);
}

// ---- S4: idempotent start --------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PaymentInput {
    id: String,
}

struct PaymentWorkflow {
    input: PaymentInput,
}

impl Workflow for PaymentWorkflow {
    const TYPE: &'static str = "payment_wf";
    type Input = PaymentInput;
    type Output = Value;

    fn new(input: PaymentInput) -> Self {
        Self { input }
    }

    fn decide(&mut self, _ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
        Ok(Outcome::Complete(json!({"id": self.input.id})))
    }
}

#[tokio::test]
async fn s4_concurrent_idempotent_starts_collapse_to_one_run() {
    let (store, _broker, mut executor) = setup();
    executor.register::<PaymentWorkflow>();
    let executor = Arc::new(executor);

    let options = StartOptions {
        idempotency_key: Some("pay-p1".to_string()),
        ..Default::default()
    };
    let (first, second) = tokio::join!(
        executor.start_run("payment_wf", json!({"id": "p1"}), options.clone()),
        executor.start_run("payment_wf", json!({"id": "p1"}), options),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.run_id, second.run_id);

    let page = store
        .list_runs(
            durable_workflow::persistence::RunFilter {
                workflow_name: Some("payment_wf".to_string()),
                ..Default::default()
            },
            durable_workflow::persistence::Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(page.runs.len(), 1);

    let events = store.read_events(first.run_id, None).await.unwrap();
    let started = events.iter().filter(|e| matches!(e.data, durable_workflow::model::EventData::WorkflowStarted { .. })).count();
    assert_eq!(started, 1);
}

// ---- S5: cancel a run suspended on a hook -----------------------------------

struct WaitsOnHookWorkflow;

impl Workflow for WaitsOnHookWorkflow {
    const TYPE: &'static str = "waits_on_hook";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
        let payload = ctx.hook("approval", None, Some(ctx.now() + chrono::Duration::hours(24)))?;
        Ok(Outcome::Complete(payload))
    }
}

#[tokio::test]
async fn s5_cancel_suspended_on_hook_disposes_hook_without_receiving() {
    let (store, _broker, mut executor) = setup();
    executor.register::<WaitsOnHookWorkflow>();
    let executor = Arc::new(executor);

    let run = executor.start_run("waits_on_hook", Value::Null, StartOptions::default()).await.unwrap();
    executor.tick(run.run_id).await.unwrap();
    let run = store.get_run(run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Suspended);

    executor.request_cancellation(run.run_id, CancellationPolicy::Terminate).await.unwrap();
    executor.tick(run.run_id).await.unwrap();

    let run = store.get_run(run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    let events = store.read_events(run.run_id, None).await.unwrap();
    let cancellation_requested = events.iter().filter(|e| matches!(e.data, durable_workflow::model::EventData::CancellationRequested { .. })).count();
    let workflow_cancelled = events.iter().filter(|e| matches!(e.data, durable_workflow::model::EventData::WorkflowCancelled { .. })).count();
    let hook_received = events.iter().filter(|e| matches!(e.data, durable_workflow::model::EventData::HookReceived { .. })).count();
    assert_eq!(cancellation_requested, 1);
    assert_eq!(workflow_cancelled, 1);
    assert_eq!(hook_received, 0);

    let hook_id = events
        .iter()
        .find_map(|e| match &e.data {
            durable_workflow::model::EventData::HookCreated { hook_id, .. } => Some(hook_id.clone()),
            _ => None,
        })
        .unwrap();
    let hook = store.get_hook(&hook_id).await.unwrap().unwrap();
    assert_eq!(hook.status, HookStatus::Disposed);
}

// ---- S6: parent/child cancel (TERMINATE) ------------------------------------

struct ChildWorkflow;

impl Workflow for ChildWorkflow {
    const TYPE: &'static str = "child_wf";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
        ctx.sleep("forever", Duration::from_secs(3600))?;
        Ok(Outcome::Complete(Value::Null))
    }
}

struct ParentOfTwoWorkflow;

impl Workflow for ParentOfTwoWorkflow {
    const TYPE: &'static str = "parent_of_two";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
        let opts = ChildWorkflowOptions {
            wait: false,
            cancellation_policy: CancellationPolicy::Terminate,
        };
        ctx.start_child_workflow("child_wf", Value::Null, opts.clone())?;
        ctx.start_child_workflow("child_wf", Value::Null, opts)?;
        // Fire-and-forget leaves the parent free to proceed; park it here so
        // both children are still outstanding when the parent is cancelled.
        ctx.sleep("wait_for_children", Duration::from_secs(3600))?;
        Ok(Outcome::Complete(Value::Null))
    }
}

#[tokio::test]
async fn s6_parent_cancel_terminates_both_children() {
    let (store, _broker, mut executor) = setup();
    executor.register::<ParentOfTwoWorkflow>();
    executor.register::<ChildWorkflow>();
    let executor = Arc::new(executor);

    let parent = executor.start_run("parent_of_two", Value::Null, StartOptions::default()).await.unwrap();
    executor.tick(parent.run_id).await.unwrap();

    let children = store.list_outstanding_children(parent.run_id).await.unwrap();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(parent.nesting_depth + 1, child.nesting_depth);
        executor.tick(child.run_id).await.unwrap();
        assert_eq!(store.get_run(child.run_id).await.unwrap().status, RunStatus::Suspended);
    }

    executor.request_cancellation(parent.run_id, CancellationPolicy::Terminate).await.unwrap();
    executor.tick(parent.run_id).await.unwrap();
    assert_eq!(store.get_run(parent.run_id).await.unwrap().status, RunStatus::Cancelled);

    for child in &children {
        let refreshed = store.get_run(child.run_id).await.unwrap();
        assert!(matches!(refreshed.status, RunStatus::Cancelled | RunStatus::Suspended));
        let events = store.read_events(child.run_id, None).await.unwrap();
        assert!(events.iter().any(|e| matches!(e.data, durable_workflow::model::EventData::CancellationRequested { .. })));
        executor.tick(child.run_id).await.unwrap();
        let refreshed = store.get_run(child.run_id).await.unwrap();
        assert_eq!(refreshed.status, RunStatus::Cancelled);
    }
}
