//! `DecisionContext`: the engine-owned scheduler that intercepts a workflow
//! body's operation primitives during replay (§4.3, §9).
//!
//! Every `step`/`sleep`/`hook`/`start_child_workflow` call is correlated
//! with prior events by encounter order: the *n*-th call of a family
//! corresponds to the *n*-th event of that family for the run. The context
//! is rebuilt from the full event log on every tick, so calling the same
//! sequence of operations in the same order always observes the same
//! prior outcomes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{StepError, WorkflowError};
use crate::model::event::{Event, EventData};
use crate::model::hook::derive_hook_id;
use crate::model::step::derive_step_id;
use crate::workflow::action::{ChildWorkflowOptions, StepOptions};
use crate::workflow::definition::Suspend;

#[derive(Debug, Clone)]
enum StepCallState {
    Started,
    Completed(Value),
    Failed(StepError),
}

#[derive(Debug, Clone)]
enum SleepCallState {
    Started { wake_at: DateTime<Utc> },
    Completed,
}

#[derive(Debug, Clone)]
enum HookCallState {
    Created {
        expires_at: Option<DateTime<Utc>>,
    },
    Received(Value),
    Expired,
    Disposed,
}

#[derive(Debug, Clone)]
enum ChildCallState {
    Started(Uuid),
    Completed(Value),
    Failed(WorkflowError),
    Cancelled,
}

/// A step to enqueue because this tick encountered it for the first time.
#[derive(Debug, Clone)]
pub struct NewStepTask {
    pub step_id: String,
    pub step_name: String,
    pub call_index: u32,
    pub input: Value,
    pub options: StepOptions,
}

/// A wall-clock timer to register with the scheduler (§4.4).
#[derive(Debug, Clone)]
pub struct NewSleepTimer {
    pub sleep_id: String,
    pub call_index: u32,
    pub wake_at: DateTime<Utc>,
}

/// A hook slot created on first encounter; expiry (if any) becomes a
/// scheduled wake.
#[derive(Debug, Clone)]
pub struct NewHook {
    pub hook_id: String,
    pub name: String,
    pub call_index: u32,
    pub schema: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A child run to start because this tick encountered its spawn point for
/// the first time.
#[derive(Debug, Clone)]
pub struct NewChildStart {
    pub child_run_id: Uuid,
    pub workflow_name: String,
    pub call_index: u32,
    pub input: Value,
    pub options: ChildWorkflowOptions,
}

/// Everything a tick newly produced: events to append and work to schedule.
#[derive(Debug, Clone, Default)]
pub struct DecisionOutput {
    pub new_events: Vec<EventData>,
    pub step_tasks: Vec<NewStepTask>,
    pub sleep_timers: Vec<NewSleepTimer>,
    pub hooks_created: Vec<NewHook>,
    pub child_starts: Vec<NewChildStart>,
}

impl DecisionOutput {
    pub fn is_empty(&self) -> bool {
        self.new_events.is_empty()
            && self.step_tasks.is_empty()
            && self.sleep_timers.is_empty()
            && self.hooks_created.is_empty()
            && self.child_starts.is_empty()
    }
}

/// Drives one replay tick. Constructed fresh from the run's event log before
/// every call to [`crate::workflow::Workflow::decide`].
pub struct DecisionContext {
    run_id: Uuid,
    now: DateTime<Utc>,
    nesting_depth: u32,
    nesting_limit: u32,
    cancellation_requested: bool,
    shielded: u32,

    step_calls: u32,
    sleep_calls: u32,
    hook_calls: u32,
    child_calls: u32,

    steps: HashMap<u32, StepCallState>,
    sleeps: HashMap<u32, SleepCallState>,
    hooks: HashMap<u32, HookCallState>,
    children: HashMap<u32, ChildCallState>,

    output: DecisionOutput,
}

impl DecisionContext {
    pub fn new(
        run_id: Uuid,
        events: &[Event],
        now: DateTime<Utc>,
        nesting_depth: u32,
        nesting_limit: u32,
    ) -> Self {
        let mut steps = HashMap::new();
        let mut sleeps = HashMap::new();
        let mut hooks = HashMap::new();
        let mut children = HashMap::new();

        let mut step_index: HashMap<String, u32> = HashMap::new();
        let mut sleep_index: HashMap<String, u32> = HashMap::new();
        let mut hook_index: HashMap<String, u32> = HashMap::new();
        let mut child_index: HashMap<Uuid, u32> = HashMap::new();
        let mut cancellation_requested = false;

        for event in events {
            match &event.data {
                EventData::StepStarted {
                    step_id,
                    call_index,
                    ..
                } => {
                    step_index.insert(step_id.clone(), *call_index);
                    steps.insert(*call_index, StepCallState::Started);
                }
                EventData::StepCompleted { step_id, result } => {
                    if let Some(idx) = step_index.get(step_id) {
                        steps.insert(*idx, StepCallState::Completed(result.clone()));
                    }
                }
                EventData::StepFailed { step_id, error } => {
                    if let Some(idx) = step_index.get(step_id) {
                        let step_error: StepError = serde_json::from_value(error.clone())
                            .unwrap_or_else(|_| StepError::fatal("step failed"));
                        steps.insert(*idx, StepCallState::Failed(step_error));
                    }
                }
                EventData::SleepStarted {
                    sleep_id,
                    call_index,
                    wake_at,
                } => {
                    sleep_index.insert(sleep_id.clone(), *call_index);
                    sleeps.insert(*call_index, SleepCallState::Started { wake_at: *wake_at });
                }
                EventData::SleepCompleted { sleep_id } => {
                    if let Some(idx) = sleep_index.get(sleep_id) {
                        sleeps.insert(*idx, SleepCallState::Completed);
                    }
                }
                EventData::HookCreated {
                    hook_id,
                    call_index,
                    expires_at,
                    ..
                } => {
                    hook_index.insert(hook_id.clone(), *call_index);
                    hooks.insert(
                        *call_index,
                        HookCallState::Created {
                            expires_at: *expires_at,
                        },
                    );
                }
                EventData::HookReceived { hook_id, payload } => {
                    if let Some(idx) = hook_index.get(hook_id) {
                        hooks.insert(*idx, HookCallState::Received(payload.clone()));
                    }
                }
                EventData::HookExpired { hook_id } => {
                    if let Some(idx) = hook_index.get(hook_id) {
                        hooks.insert(*idx, HookCallState::Expired);
                    }
                }
                EventData::HookDisposed { hook_id } => {
                    if let Some(idx) = hook_index.get(hook_id) {
                        hooks.insert(*idx, HookCallState::Disposed);
                    }
                }
                EventData::ChildWorkflowStarted {
                    child_run_id,
                    call_index,
                    ..
                } => {
                    child_index.insert(*child_run_id, *call_index);
                    children.insert(*call_index, ChildCallState::Started(*child_run_id));
                }
                EventData::ChildWorkflowCompleted {
                    child_run_id,
                    result,
                } => {
                    if let Some(idx) = child_index.get(child_run_id) {
                        children.insert(*idx, ChildCallState::Completed(result.clone()));
                    }
                }
                EventData::ChildWorkflowFailed {
                    child_run_id,
                    error,
                } => {
                    if let Some(idx) = child_index.get(child_run_id) {
                        let wf_error: WorkflowError = serde_json::from_value(error.clone())
                            .unwrap_or_else(|_| WorkflowError::new("child workflow failed"));
                        children.insert(*idx, ChildCallState::Failed(wf_error));
                    }
                }
                EventData::ChildWorkflowCancelled { child_run_id } => {
                    if let Some(idx) = child_index.get(child_run_id) {
                        children.insert(*idx, ChildCallState::Cancelled);
                    }
                }
                EventData::CancellationRequested { .. } => {
                    cancellation_requested = true;
                }
                _ => {}
            }
        }

        Self {
            run_id,
            now,
            nesting_depth,
            nesting_limit,
            cancellation_requested,
            shielded: 0,
            step_calls: 0,
            sleep_calls: 0,
            hook_calls: 0,
            child_calls: 0,
            steps,
            sleeps,
            hooks,
            children,
            output: DecisionOutput::default(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn cancellation_requested(&self) -> bool {
        self.cancellation_requested
    }

    /// Defer cancellation checkpoints for the duration of `f`, so
    /// compensating actions can run to completion (§4.3 `shield` regions).
    pub fn shield<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.shielded += 1;
        let result = f(self);
        self.shielded -= 1;
        result
    }

    fn checkpoint(&self) -> Result<(), Suspend> {
        if self.cancellation_requested && self.shielded == 0 {
            return Err(Suspend::Cancelled);
        }
        Ok(())
    }

    /// Invoke (or resolve against history) a single step.
    pub fn step(
        &mut self,
        name: &str,
        input: Value,
        options: StepOptions,
    ) -> Result<Value, Suspend> {
        let call_index = self.step_calls;
        self.step_calls += 1;

        match self.steps.get(&call_index) {
            Some(StepCallState::Completed(result)) => Ok(result.clone()),
            Some(StepCallState::Failed(error)) => Err(Suspend::StepFailed(error.clone())),
            Some(StepCallState::Started) => Err(Suspend::Pending),
            None => {
                self.checkpoint()?;
                let step_id = derive_step_id(self.run_id, name, call_index);
                self.output.new_events.push(EventData::StepStarted {
                    step_id: step_id.clone(),
                    step_name: name.to_string(),
                    call_index,
                    input: input.clone(),
                });
                self.output.step_tasks.push(NewStepTask {
                    step_id,
                    step_name: name.to_string(),
                    call_index,
                    input,
                    options,
                });
                Err(Suspend::Pending)
            }
        }
    }

    /// Run a batch of steps concurrently: all new ones are scheduled in this
    /// tick; the call suspends until every one has a terminal event, then
    /// returns results in input order (§4.3 parallel composition).
    pub fn parallel_steps(
        &mut self,
        calls: Vec<(String, Value, StepOptions)>,
    ) -> Result<Vec<Value>, Suspend> {
        let mut results = Vec::with_capacity(calls.len());
        let mut first_failure = None;
        let mut any_pending = false;

        for (name, input, options) in calls {
            match self.step(&name, input, options) {
                Ok(value) => results.push(value),
                Err(Suspend::Pending) => any_pending = true,
                Err(other) => {
                    any_pending = true;
                    first_failure.get_or_insert(other);
                }
            }
        }

        if let Some(failure) = first_failure {
            return Err(failure);
        }
        if any_pending {
            return Err(Suspend::Pending);
        }
        Ok(results)
    }

    /// Wait until wall-clock time `self.now() + duration`.
    pub fn sleep(&mut self, name: &str, duration: std::time::Duration) -> Result<(), Suspend> {
        let call_index = self.sleep_calls;
        self.sleep_calls += 1;

        match self.sleeps.get(&call_index) {
            Some(SleepCallState::Completed) => Ok(()),
            Some(SleepCallState::Started { .. }) => Err(Suspend::Pending),
            None => {
                self.checkpoint()?;
                let sleep_id = format!("{}:{}:{}", self.run_id, name, call_index);
                let wake_at = self.now
                    + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
                self.output.new_events.push(EventData::SleepStarted {
                    sleep_id: sleep_id.clone(),
                    call_index,
                    wake_at,
                });
                self.output.sleep_timers.push(NewSleepTimer {
                    sleep_id,
                    call_index,
                    wake_at,
                });
                Err(Suspend::Pending)
            }
        }
    }

    /// Await a named external signal, optionally with an expiry.
    pub fn hook(
        &mut self,
        name: &str,
        schema: Option<Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Value, Suspend> {
        let call_index = self.hook_calls;
        self.hook_calls += 1;

        match self.hooks.get(&call_index) {
            Some(HookCallState::Received(payload)) => Ok(payload.clone()),
            Some(HookCallState::Expired) => Err(Suspend::HookExpired {
                hook_id: derive_hook_id(self.run_id, name, call_index),
            }),
            Some(HookCallState::Disposed) | Some(HookCallState::Created { .. }) => {
                Err(Suspend::Pending)
            }
            None => {
                self.checkpoint()?;
                let hook_id = derive_hook_id(self.run_id, name, call_index);
                self.output.new_events.push(EventData::HookCreated {
                    hook_id: hook_id.clone(),
                    name: name.to_string(),
                    call_index,
                    schema: schema.clone(),
                    expires_at,
                });
                self.output.hooks_created.push(NewHook {
                    hook_id,
                    name: name.to_string(),
                    call_index,
                    schema,
                    expires_at,
                });
                Err(Suspend::Pending)
            }
        }
    }

    /// Spawn a child workflow. When `options.wait` is true, suspends until
    /// the child reaches a terminal event.
    pub fn start_child_workflow(
        &mut self,
        workflow_name: &str,
        input: Value,
        options: ChildWorkflowOptions,
    ) -> Result<Option<Value>, Suspend> {
        let call_index = self.child_calls;
        self.child_calls += 1;

        match self.children.get(&call_index) {
            Some(ChildCallState::Completed(result)) => Ok(Some(result.clone())),
            Some(ChildCallState::Failed(error)) => Err(Suspend::ChildFailed(error.clone())),
            Some(ChildCallState::Cancelled) => Err(Suspend::ChildCancelled),
            Some(ChildCallState::Started(_)) => {
                if options.wait {
                    Err(Suspend::Pending)
                } else {
                    Ok(None)
                }
            }
            None => {
                self.checkpoint()?;
                if self.nesting_depth >= self.nesting_limit {
                    return Err(Suspend::NestingLimitExceeded(self.nesting_limit));
                }
                let child_run_id = Uuid::now_v7();
                self.output.new_events.push(EventData::ChildWorkflowStarted {
                    child_run_id,
                    workflow_name: workflow_name.to_string(),
                    call_index,
                });
                self.output.child_starts.push(NewChildStart {
                    child_run_id,
                    workflow_name: workflow_name.to_string(),
                    call_index,
                    input,
                    options: options.clone(),
                });
                if options.wait {
                    Err(Suspend::Pending)
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub fn into_output(self) -> DecisionOutput {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::event::Event;

    fn ctx(events: &[Event]) -> DecisionContext {
        DecisionContext::new(Uuid::now_v7(), events, Utc::now(), 0, 3)
    }

    #[test]
    fn first_encounter_schedules_and_suspends() {
        let mut c = ctx(&[]);
        let result = c.step("validate", Value::Null, StepOptions::default());
        assert!(matches!(result, Err(Suspend::Pending)));
        let output = c.into_output();
        assert_eq!(output.step_tasks.len(), 1);
        assert_eq!(output.new_events.len(), 1);
    }

    #[test]
    fn completed_step_returns_recorded_value_without_new_work() {
        let run_id = Uuid::now_v7();
        let step_id = derive_step_id(run_id, "validate", 0);
        let events = vec![
            Event::new(
                run_id,
                1,
                EventData::StepStarted {
                    step_id: step_id.clone(),
                    step_name: "validate".into(),
                    call_index: 0,
                    input: Value::Null,
                },
            ),
            Event::new(
                run_id,
                2,
                EventData::StepCompleted {
                    step_id,
                    result: serde_json::json!({"ok": true}),
                },
            ),
        ];
        let mut c = DecisionContext::new(run_id, &events, Utc::now(), 0, 3);
        let result = c.step("validate", Value::Null, StepOptions::default());
        assert_eq!(result.unwrap(), serde_json::json!({"ok": true}));
        assert!(c.into_output().is_empty());
    }

    #[test]
    fn started_without_terminal_is_still_pending() {
        let run_id = Uuid::now_v7();
        let step_id = derive_step_id(run_id, "validate", 0);
        let events = vec![Event::new(
            run_id,
            1,
            EventData::StepStarted {
                step_id,
                step_name: "validate".into(),
                call_index: 0,
                input: Value::Null,
            },
        )];
        let mut c = DecisionContext::new(run_id, &events, Utc::now(), 0, 3);
        let result = c.step("validate", Value::Null, StepOptions::default());
        assert!(matches!(result, Err(Suspend::Pending)));
        assert!(c.into_output().is_empty());
    }

    #[test]
    fn cancellation_blocks_new_operations_but_not_in_flight_ones() {
        let run_id = Uuid::now_v7();
        let step_id = derive_step_id(run_id, "validate", 0);
        let events = vec![
            Event::new(
                run_id,
                1,
                EventData::StepStarted {
                    step_id: step_id.clone(),
                    step_name: "validate".into(),
                    call_index: 0,
                    input: Value::Null,
                },
            ),
            Event::new(
                run_id,
                2,
                EventData::StepCompleted {
                    step_id,
                    result: Value::Bool(true),
                },
            ),
            Event::new(run_id, 3, EventData::CancellationRequested { reason: None }),
        ];
        let mut c = DecisionContext::new(run_id, &events, Utc::now(), 0, 3);
        // Already-completed step resolves normally.
        assert_eq!(
            c.step("validate", Value::Null, StepOptions::default())
                .unwrap(),
            Value::Bool(true)
        );
        // A brand-new step hits the cancellation checkpoint instead.
        let result = c.step("charge", Value::Null, StepOptions::default());
        assert!(matches!(result, Err(Suspend::Cancelled)));
    }

    #[test]
    fn shield_defers_cancellation_checkpoint() {
        let run_id = Uuid::now_v7();
        let events = vec![Event::new(
            run_id,
            1,
            EventData::CancellationRequested { reason: None },
        )];
        let mut c = DecisionContext::new(run_id, &events, Utc::now(), 0, 3);
        let result = c.shield(|ctx| ctx.step("refund", Value::Null, StepOptions::default()));
        assert!(matches!(result, Err(Suspend::Pending)));
    }

    #[test]
    fn parallel_steps_schedules_all_new_ones_before_suspending() {
        let mut c = ctx(&[]);
        let calls = vec![
            ("a".to_string(), Value::Null, StepOptions::default()),
            ("b".to_string(), Value::Null, StepOptions::default()),
        ];
        let result = c.parallel_steps(calls);
        assert!(matches!(result, Err(Suspend::Pending)));
        let output = c.into_output();
        assert_eq!(output.step_tasks.len(), 2);
    }

    #[test]
    fn nesting_limit_is_enforced_on_first_encounter() {
        let mut c = DecisionContext::new(Uuid::now_v7(), &[], Utc::now(), 3, 3);
        let result = c.start_child_workflow("child_wf", Value::Null, ChildWorkflowOptions::default());
        assert!(matches!(result, Err(Suspend::NestingLimitExceeded(3))));
    }
}
