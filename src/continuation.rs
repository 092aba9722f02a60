//! Schedules (§4.8, second half of C10): cron or interval trigger specs
//! that periodically call [`Api::start`] with a schedule-derived idempotency
//! key, so duplicate fires collapse to one run. The workflow-internal half
//! of C10 — `continue_as_new` — lives on [`crate::workflow::definition::Outcome`]
//! and [`crate::engine::WorkflowExecutor`] instead; a schedule only ever
//! starts fresh runs.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::api::{Api, StartRequest};
use crate::scheduler::Broker;
use crate::persistence::StorageContract;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("schedule not found: {0}")]
    NotFound(Uuid),
}

/// How a schedule's firings are spaced.
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(CronSchedule),
    Interval(StdDuration),
}

impl Trigger {
    pub fn cron(expr: &str) -> Result<Self, ScheduleError> {
        CronSchedule::from_str(expr)
            .map(Trigger::Cron)
            .map_err(|e| ScheduleError::InvalidCron(e.to_string()))
    }

    pub fn interval(period: StdDuration) -> Self {
        Trigger::Interval(period)
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(schedule) => schedule.after(&after).next(),
            Trigger::Interval(period) => {
                chrono::Duration::from_std(*period).ok().map(|d| after + d)
            }
        }
    }
}

/// A persisted trigger spec (§6.4 "schedule_wakes"): fires `workflow_name`
/// with `args` at each `trigger` occurrence.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub schedule_id: Uuid,
    pub workflow_name: String,
    pub args: Value,
    pub trigger: Trigger,
    pub enabled: bool,
    pub next_fire_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(workflow_name: impl Into<String>, args: Value, trigger: Trigger) -> Self {
        let now = Utc::now();
        let next_fire_at = trigger.next_after(now).unwrap_or(now);
        Self {
            schedule_id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            args,
            trigger,
            enabled: true,
            next_fire_at,
        }
    }

    /// The idempotency key one firing collapses duplicate fires onto —
    /// stable for the same `(schedule_id, next_fire_at)` pair, so an
    /// at-least-once ticker can re-evaluate a due schedule without starting
    /// two runs for the same occurrence.
    fn firing_idempotency_key(&self, fire_time: DateTime<Utc>) -> String {
        format!("schedule:{}:{}", self.schedule_id, fire_time.timestamp())
    }
}

/// Registers and drives [`Schedule`]s against an [`Api`]. The registry
/// itself is in-memory; a worker process that restarts re-derives due
/// firings from wall-clock time rather than replaying a schedule log, since
/// a schedule is a trigger spec, not a run (§3 "what's the unit of
/// execution" — schedules start runs, they aren't one).
pub struct ScheduleTicker<S: StorageContract, B: Broker> {
    api: Arc<Api<S, B>>,
    schedules: Arc<DashMap<Uuid, Schedule>>,
    tick_interval: StdDuration,
}

impl<S: StorageContract + 'static, B: Broker + 'static> ScheduleTicker<S, B> {
    pub fn new(api: Arc<Api<S, B>>) -> Self {
        Self {
            api,
            schedules: Arc::new(DashMap::new()),
            tick_interval: StdDuration::from_secs(5),
        }
    }

    pub fn with_tick_interval(mut self, interval: StdDuration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn register(&self, schedule: Schedule) -> Uuid {
        let id = schedule.schedule_id;
        self.schedules.insert(id, schedule);
        id
    }

    pub fn unregister(&self, schedule_id: Uuid) -> Result<(), ScheduleError> {
        self.schedules.remove(&schedule_id).ok_or(ScheduleError::NotFound(schedule_id)).map(|_| ())
    }

    pub fn set_enabled(&self, schedule_id: Uuid, enabled: bool) -> Result<(), ScheduleError> {
        self.schedules
            .get_mut(&schedule_id)
            .ok_or(ScheduleError::NotFound(schedule_id))
            .map(|mut entry| entry.enabled = enabled)
    }

    pub fn list(&self) -> Vec<Schedule> {
        self.schedules.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Runs until `shutdown_rx` fires, checking for due schedules every
    /// `tick_interval`.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("schedule ticker shutting down");
                        break;
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn tick_once(&self) {
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .schedules
            .iter()
            .filter(|entry| entry.enabled && entry.next_fire_at <= now)
            .map(|entry| *entry.key())
            .collect();

        for schedule_id in due {
            self.fire_one(schedule_id, now).await;
        }
    }

    async fn fire_one(&self, schedule_id: Uuid, now: DateTime<Utc>) {
        let Some(mut entry) = self.schedules.get_mut(&schedule_id) else {
            return;
        };
        let fire_time = entry.next_fire_at;
        let idempotency_key = entry.firing_idempotency_key(fire_time);
        let request = StartRequest {
            idempotency_key: Some(idempotency_key),
            tags: vec!["scheduled".to_string()],
            ..Default::default()
        };
        let workflow_name = entry.workflow_name.clone();
        let args = entry.args.clone();

        match self.api.start(&workflow_name, args, request).await {
            Ok(run_id) => debug!(%run_id, %schedule_id, "schedule fired"),
            Err(e) => error!(%schedule_id, error = %e, "failed to start scheduled run"),
        }

        entry.next_fire_at = entry.trigger.next_after(now).unwrap_or(now);
    }
}

/// Snapshot of registered schedules keyed by id, for inspection/testing.
pub fn schedules_by_id<S: StorageContract + 'static, B: Broker + 'static>(
    ticker: &ScheduleTicker<S, B>,
) -> HashMap<Uuid, Schedule> {
    ticker.schedules.iter().map(|entry| (*entry.key(), entry.value().clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, WorkflowExecutor};
    use crate::persistence::InMemoryStore;
    use crate::scheduler::InMemoryBroker;
    use crate::workflow::definition::{Outcome, Suspend, Workflow};
    use crate::workflow::DecisionContext;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TickInput {
        label: String,
    }

    struct Ticked;

    impl Workflow for Ticked {
        const TYPE: &'static str = "ticked";
        type Input = TickInput;
        type Output = Value;

        fn new(_input: TickInput) -> Self {
            Self
        }

        fn decide(&mut self, _ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
            Ok(Outcome::Complete(Value::Null))
        }
    }

    fn setup() -> Arc<Api<InMemoryStore, InMemoryBroker>> {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let mut executor = WorkflowExecutor::with_config(store.clone(), broker.clone(), EngineConfig::default());
        executor.register::<Ticked>();
        Arc::new(Api::new(store, broker, Arc::new(executor)))
    }

    #[tokio::test]
    async fn interval_schedule_fires_and_reschedules() {
        let api = setup();
        let ticker = ScheduleTicker::new(api.clone());
        let schedule = Schedule::new(
            "ticked",
            serde_json::json!({"label": "hi"}),
            Trigger::interval(StdDuration::from_millis(1)),
        );
        let schedule_id = schedule.schedule_id;
        let first_fire = schedule.next_fire_at;
        ticker.register(schedule);

        tokio::time::sleep(StdDuration::from_millis(5)).await;
        ticker.tick_once().await;

        let updated = schedules_by_id(&ticker).remove(&schedule_id).unwrap();
        assert!(updated.next_fire_at > first_fire);

        let page = api
            .list_runs(crate::persistence::RunFilter::default(), crate::persistence::Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.runs.len(), 1);
        assert_eq!(page.runs[0].workflow_name, "ticked");
    }

    #[tokio::test]
    async fn duplicate_fire_of_same_occurrence_collapses() {
        let api = setup();
        let ticker = ScheduleTicker::new(api.clone());
        let due_at = Utc::now() - chrono::Duration::seconds(1);
        let mut schedule = Schedule::new("ticked", Value::Null, Trigger::interval(StdDuration::from_secs(3600)));
        schedule.next_fire_at = due_at;
        let schedule_id = schedule.schedule_id;
        ticker.register(schedule);

        // Simulate two workers racing the same due occurrence: both build
        // the request from the same (schedule_id, fire_time) pair before
        // either advances next_fire_at.
        ticker.tick_once().await;
        if let Some(mut entry) = ticker.schedules.get_mut(&schedule_id) {
            entry.next_fire_at = due_at;
        }
        ticker.tick_once().await;

        let page = api
            .list_runs(crate::persistence::RunFilter::default(), crate::persistence::Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.runs.len(), 1, "idempotency key should collapse duplicate fires");
    }

    #[test]
    fn invalid_cron_rejected() {
        let err = Trigger::cron("not a cron expression").unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron(_)));
    }
}
