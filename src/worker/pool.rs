//! Ties the broker, the replay engine and step execution into running
//! background loops (§5): one loop drains `workflow.tick` messages straight
//! into [`WorkflowExecutor::tick`], the other drains `step.task` messages,
//! looks up the step's name and input from the run's event log, executes it
//! through a [`StepRegistry`], and reports the outcome back to the executor.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{StepRegistry, WorkflowExecutor};
use crate::error::StepError;
use crate::model::event::EventData;
use crate::persistence::StorageContract;
use crate::scheduler::{Broker, QueueKind};
use crate::worker::backpressure::{BackpressureConfig, BackpressureState};
use crate::worker::poller::{PollerConfig, QueuePoller};

/// Tunables for one worker process (§5, §6.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub max_step_concurrency: usize,
    pub backpressure: BackpressureConfig,
    pub tick_poller: PollerConfig,
    pub step_poller: PollerConfig,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_step_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            tick_poller: PollerConfig::default(),
            step_poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_max_step_concurrency(mut self, n: usize) -> Self {
        self.max_step_concurrency = n.max(1);
        self
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureConfig) -> Self {
        self.backpressure = backpressure;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Stopped,
    Running,
    Draining,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Runs the tick loop and the step loop for one process.
///
/// `S`/`B` mirror [`WorkflowExecutor`]'s bounds; the pool only ever touches
/// the executor and the registry, never the storage/broker directly, except
/// to look a step's name and input up from the event log before running it.
pub struct WorkerPool<S: StorageContract + 'static, B: Broker + 'static> {
    executor: Arc<WorkflowExecutor<S, B>>,
    steps: Arc<StepRegistry>,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: std::sync::RwLock<WorkerPoolStatus>,
    tick_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    step_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: StorageContract + 'static, B: Broker + 'static> WorkerPool<S, B> {
    pub fn new(executor: Arc<WorkflowExecutor<S, B>>, steps: Arc<StepRegistry>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_step_concurrency,
        ));
        Self {
            executor,
            steps,
            config,
            backpressure,
            shutdown_tx,
            shutdown_rx,
            status: std::sync::RwLock::new(WorkerPoolStatus::Stopped),
            tick_handle: std::sync::Mutex::new(None),
            step_handle: std::sync::Mutex::new(None),
        }
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write().unwrap();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(worker_id = %self.config.worker_id, "starting worker pool");

        let tick_poller = QueuePoller::new(
            self.executor.broker().clone(),
            QueueKind::WorkflowTick,
            self.config.tick_poller.clone(),
            self.shutdown_rx.clone(),
        );
        let step_poller = QueuePoller::new(
            self.executor.broker().clone(),
            QueueKind::StepTask,
            self.config.step_poller.clone(),
            self.shutdown_rx.clone(),
        );

        let tick_executor = self.executor.clone();
        *self.tick_handle.lock().unwrap() = Some(tokio::spawn(run_tick_loop(tick_executor, tick_poller)));

        let step_executor = self.executor.clone();
        let step_registry = self.steps.clone();
        let backpressure = self.backpressure.clone();
        *self.step_handle.lock().unwrap() = Some(tokio::spawn(run_step_loop(
            step_executor,
            step_registry,
            step_poller,
            backpressure,
        )));

        Ok(())
    }

    /// Signals shutdown and waits (up to `shutdown_timeout`) for both loops
    /// to drain their current work and exit.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write().unwrap();
            if *status != WorkerPoolStatus::Running {
                return Err(WorkerPoolError::NotRunning);
            }
            *status = WorkerPoolStatus::Draining;
        }
        let _ = self.shutdown_tx.send(true);

        let tick_handle = self.tick_handle.lock().unwrap().take();
        let step_handle = self.step_handle.lock().unwrap().take();

        let joined = tokio::time::timeout(self.config.shutdown_timeout, async {
            if let Some(h) = tick_handle {
                let _ = h.await;
            }
            if let Some(h) = step_handle {
                let _ = h.await;
            }
        })
        .await;

        *self.status.write().unwrap() = WorkerPoolStatus::Stopped;
        joined.map_err(|_| WorkerPoolError::ShutdownTimeout)
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read().unwrap()
    }
}

async fn run_tick_loop<S: StorageContract + 'static, B: Broker + 'static>(
    executor: Arc<WorkflowExecutor<S, B>>,
    mut poller: QueuePoller<B>,
) {
    loop {
        match poller.poll().await {
            Ok(deliveries) => {
                for delivery in deliveries {
                    let run_id = delivery.message.run_id;
                    match executor.tick(run_id).await {
                        Ok(outcome) => debug!(%run_id, ?outcome, "workflow tick processed"),
                        Err(e) => warn!(%run_id, error = %e, "workflow tick failed"),
                    }
                    if let Err(e) = executor.broker().ack(delivery.delivery_token).await {
                        warn!(%run_id, error = %e, "failed to ack tick delivery");
                    }
                }
            }
            Err(e) => error!(error = %e, "tick poller error"),
        }
        if poller.wait().await && poller.is_shutdown() {
            break;
        }
        if poller.is_shutdown() {
            break;
        }
    }
}

async fn run_step_loop<S: StorageContract + 'static, B: Broker + 'static>(
    executor: Arc<WorkflowExecutor<S, B>>,
    steps: Arc<StepRegistry>,
    mut poller: QueuePoller<B>,
    backpressure: Arc<BackpressureState>,
) {
    loop {
        if backpressure.should_accept() {
            match poller.poll().await {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        let executor = executor.clone();
                        let steps = steps.clone();
                        let backpressure = backpressure.clone();
                        backpressure.task_started();
                        tokio::spawn(async move {
                            run_one_step(&executor, &steps, delivery).await;
                            backpressure.task_completed();
                        });
                    }
                }
                Err(e) => error!(error = %e, "step poller error"),
            }
        }
        if poller.wait().await && poller.is_shutdown() {
            break;
        }
        if poller.is_shutdown() {
            break;
        }
    }
}

#[instrument(skip(executor, steps, delivery), fields(run_id = %delivery.message.run_id))]
async fn run_one_step<S: StorageContract + 'static, B: Broker + 'static>(
    executor: &WorkflowExecutor<S, B>,
    steps: &StepRegistry,
    delivery: crate::scheduler::Delivery,
) {
    let run_id = delivery.message.run_id;
    let Some(step_id) = delivery.message.step_id.clone() else {
        warn!("step task delivery missing step_id");
        let _ = executor.broker().ack(delivery.delivery_token).await;
        return;
    };

    let outcome = execute_step(executor, steps, run_id, &step_id).await;
    match outcome {
        Ok(()) => debug!(step_id, "step executed"),
        Err(e) => warn!(step_id, error = %e, "step execution bookkeeping failed"),
    }
    if let Err(e) = executor.broker().ack(delivery.delivery_token).await {
        warn!(step_id, error = %e, "failed to ack step delivery");
    }
}

async fn execute_step<S: StorageContract + 'static, B: Broker + 'static>(
    executor: &WorkflowExecutor<S, B>,
    steps: &StepRegistry,
    run_id: Uuid,
    step_id: &str,
) -> Result<(), crate::error::EngineError> {
    let events = executor.store().read_events(run_id, None).await?;
    let started = events.iter().find_map(|e| match &e.data {
        EventData::StepStarted {
            step_id: sid,
            step_name,
            input,
            ..
        } if sid == step_id => Some((step_name.clone(), input.clone())),
        _ => None,
    });

    let Some((step_name, input)) = started else {
        warn!(step_id, "no step.started event found for step, skipping");
        return Ok(());
    };

    if !steps.contains(&step_name) {
        let error = StepError::fatal(format!("no handler registered for step: {step_name}"));
        executor.fail_step(run_id, step_id, error).await?;
        return Ok(());
    }

    match steps.execute(&step_name, input).await {
        Ok(result) => executor.complete_step(run_id, step_id, result).await,
        Err(error) => executor.fail_step(run_id, step_id, error).await,
    }
}
