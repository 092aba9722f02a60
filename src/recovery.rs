//! Recovery sweeper (C7, §4.7): the thing that notices a worker died mid-tick
//! and gets the run moving again, or gives up on it after too many tries.
//!
//! Two independent jobs share one sweep loop because they both start from
//! "read a little state periodically and write events": reclaiming runs
//! whose claim lease expired without reaching a terminal status, and
//! popping due [`ScheduledWake`]s (sleep timers, hook expiries, max-duration
//! timeouts) and turning them into the events that let a stalled `decide()`
//! move forward.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::WorkflowExecutor;
use crate::hooks::HookBus;
use crate::model::event::EventData;
use crate::model::run::RunStatus;
use crate::persistence::{StorageContract, StoreError, WakeKind};
use crate::scheduler::{Broker, BrokerMessage};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub sweep_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(String),
}

/// One pass's tally, returned so callers (tests, the CLI's `--once` mode)
/// can observe what happened without scraping logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claims_reclaimed: u32,
    pub runs_interrupted: u32,
    pub wakes_processed: u32,
}

/// Periodically reclaims stale claims and drains due wakes.
pub struct RecoverySweeper<S: StorageContract, B: Broker> {
    store: Arc<S>,
    executor: Arc<WorkflowExecutor<S, B>>,
    hooks: HookBus<S, B>,
    config: RecoveryConfig,
}

impl<S: StorageContract, B: Broker> RecoverySweeper<S, B> {
    pub fn new(store: Arc<S>, broker: Arc<B>, executor: Arc<WorkflowExecutor<S, B>>, config: RecoveryConfig) -> Self {
        let hooks = HookBus::new(store.clone(), broker);
        Self {
            store,
            executor,
            hooks,
            config,
        }
    }

    /// Runs until `shutdown_rx` fires, sweeping every `sweep_interval`.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            match self.sweep_once().await {
                Ok(report) if report != SweepReport::default() => {
                    info!(?report, "recovery sweep completed");
                }
                Ok(_) => debug!("recovery sweep found nothing due"),
                Err(e) => warn!(error = %e, "recovery sweep failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport, RecoveryError> {
        let mut report = SweepReport::default();
        self.reclaim_expired_claims(&mut report).await?;
        self.drain_due_wakes(&mut report).await?;
        Ok(report)
    }

    async fn reclaim_expired_claims(&self, report: &mut SweepReport) -> Result<(), RecoveryError> {
        let now = Utc::now();
        let expired = self.store.list_expired_claims(now).await?;
        for run_id in expired {
            if let Err(e) = self.reclaim_one(run_id, report).await {
                warn!(%run_id, error = %e, "failed to reclaim stale claim");
            }
        }
        Ok(())
    }

    async fn reclaim_one(&self, run_id: Uuid, report: &mut SweepReport) -> Result<(), RecoveryError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        let attempts = self.store.increment_recovery_attempts(run_id).await?;
        if attempts > run.max_recovery_attempts {
            warn!(%run_id, attempts, max = run.max_recovery_attempts, "run exceeded recovery attempts, interrupting");
            self.interrupt(run_id, run.status).await?;
            report.runs_interrupted += 1;
            return Ok(());
        }

        // The claim already expired, so the next `claim_run` (whoever polls
        // this tick first) succeeds regardless of who held it before; we
        // only need to put a tick back on the queue.
        self.executor
            .broker()
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .map_err(|e| RecoveryError::Broker(e.to_string()))?;
        report.claims_reclaimed += 1;
        Ok(())
    }

    async fn interrupt(&self, run_id: Uuid, from_status: RunStatus) -> Result<(), RecoveryError> {
        let events = self.store.read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;
        self.store
            .append_events(
                run_id,
                next_sequence,
                vec![EventData::WorkflowFailed {
                    error: serde_json::json!({"message": "recovery attempts exhausted"}),
                }],
            )
            .await?;
        self.store
            .update_run_status(run_id, from_status, RunStatus::Interrupted)
            .await?;
        self.store.cancel_wakes_for_run(run_id).await?;
        self.executor
            .broker()
            .cancel(run_id, crate::scheduler::QueueKind::WorkflowTick)
            .await
            .map_err(|e| RecoveryError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn drain_due_wakes(&self, report: &mut SweepReport) -> Result<(), RecoveryError> {
        let now = Utc::now();
        let due = self.store.pop_due_wakes(now).await?;
        for wake in due {
            let handled = match wake.kind {
                WakeKind::HookExpiry => match wake.subject_id {
                    Some(hook_id) => self.hooks.expire_hook(wake.run_id, &hook_id).await.unwrap_or_else(|e| {
                        warn!(run_id = %wake.run_id, error = %e, "failed to expire hook");
                        false
                    }),
                    None => false,
                },
                WakeKind::SleepElapsed => match wake.subject_id {
                    Some(sleep_id) => self
                        .complete_sleep(wake.run_id, &sleep_id)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(run_id = %wake.run_id, error = %e, "failed to complete sleep");
                            false
                        }),
                    None => false,
                },
                WakeKind::MaxDuration => self.request_max_duration_cancel(wake.run_id).await.unwrap_or_else(|e| {
                    warn!(run_id = %wake.run_id, error = %e, "failed to cancel on max duration");
                    false
                }),
            };
            if handled {
                report.wakes_processed += 1;
            }
        }
        Ok(())
    }

    async fn complete_sleep(&self, run_id: Uuid, sleep_id: &str) -> Result<bool, RecoveryError> {
        let events = self.store.read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;
        self.store
            .append_events(
                run_id,
                next_sequence,
                vec![EventData::SleepCompleted { sleep_id: sleep_id.to_string() }],
            )
            .await?;
        self.executor
            .broker()
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .map_err(|e| RecoveryError::Broker(e.to_string()))?;
        Ok(true)
    }

    async fn request_max_duration_cancel(&self, run_id: Uuid) -> Result<bool, RecoveryError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        let events = self.store.read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;
        self.store
            .append_events(
                run_id,
                next_sequence,
                vec![EventData::CancellationRequested {
                    reason: Some("max_duration_ms elapsed".into()),
                }],
            )
            .await?;
        self.executor
            .broker()
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .map_err(|e| RecoveryError::Broker(e.to_string()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StartOptions;
    use crate::persistence::InMemoryStore;
    use crate::scheduler::InMemoryBroker;
    use crate::workflow::definition::{Outcome, Workflow};
    use crate::workflow::DecisionContext;
    use serde_json::{json, Value};

    struct Parks;
    impl Workflow for Parks {
        const TYPE: &'static str = "parks";
        type Input = Value;
        type Output = Value;

        fn new(_input: Value) -> Self {
            Self
        }

        fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, crate::workflow::definition::Suspend> {
            ctx.sleep("parked", std::time::Duration::from_secs(3600))?;
            Ok(Outcome::Complete(json!("done")))
        }
    }

    #[tokio::test]
    async fn stale_claim_gets_reclaimed_and_retried() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let mut executor = WorkflowExecutor::new(store.clone(), broker.clone());
        executor.register::<Parks>();
        let executor = Arc::new(executor);

        let run = executor
            .start_run("parks", Value::Null, StartOptions::default())
            .await
            .unwrap();

        store
            .claim_run(run.run_id, Uuid::now_v7(), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweeper = RecoverySweeper::new(store.clone(), broker.clone(), executor.clone(), RecoveryConfig::default());
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.claims_reclaimed, 1);
    }

    #[tokio::test]
    async fn exhausted_recovery_attempts_interrupts_run() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let mut executor = WorkflowExecutor::new(store.clone(), broker.clone());
        executor.register::<Parks>();
        let executor = Arc::new(executor);

        let run = executor
            .start_run(
                "parks",
                Value::Null,
                StartOptions {
                    max_recovery_attempts: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let sweeper = RecoverySweeper::new(store.clone(), broker.clone(), executor.clone(), RecoveryConfig::default());
        for _ in 0..2 {
            store
                .claim_run(run.run_id, Uuid::now_v7(), Duration::from_millis(1))
                .await
                .ok();
            tokio::time::sleep(Duration::from_millis(5)).await;
            sweeper.sweep_once().await.unwrap();
        }

        let refreshed = store.get_run(run.run_id).await.unwrap();
        assert_eq!(refreshed.status, RunStatus::Interrupted);
    }
}
