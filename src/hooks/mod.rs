//! Hook & cancellation bus (C6, §4.6): the external-facing half of hooks.
//!
//! [`crate::workflow::context::DecisionContext`] owns the *replay-time* view
//! of a hook (did this call index ever receive a payload). This module owns
//! the *outside-in* view: an operator or another system calling
//! `signal_hook(run_id, name, payload)` by name, hook expiry turned from a
//! scheduled wake into a `hook.expired` event, and cancellation propagated
//! to outstanding children per [`CancellationPolicy`].

use std::sync::Arc;

use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::model::event::EventData;
use crate::model::hook::HookStatus;
use crate::model::run::CancellationPolicy;
use crate::persistence::{StorageContract, StoreError};
use crate::scheduler::{Broker, BrokerMessage};

#[derive(Debug, thiserror::Error)]
pub enum HookBusError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("no pending hook named {0:?} on run {1}")]
    NoPendingHook(String, Uuid),
}

/// Resolves hooks by name, expires overdue ones, and fans cancellation out
/// to children. Holds the same `(store, broker)` pair as the executor it
/// wakes, but never touches replay state directly.
pub struct HookBus<S: StorageContract, B: Broker> {
    store: Arc<S>,
    broker: Arc<B>,
}

impl<S: StorageContract, B: Broker> HookBus<S, B> {
    pub fn new(store: Arc<S>, broker: Arc<B>) -> Self {
        Self { store, broker }
    }

    /// Delivers `payload` to the most recent pending hook named `name` on
    /// `run_id`. Hook names are typically awaited once per run, but a
    /// workflow may loop and re-declare the same name; the highest
    /// `call_index` still pending is the one currently awaited (§4.3
    /// encounter-order correlation applies the same way from outside).
    #[instrument(skip(self, payload), fields(%run_id, name))]
    pub async fn signal_hook(&self, run_id: Uuid, name: &str, payload: Value) -> Result<(), HookBusError> {
        let events = self.store.read_events(run_id, None).await?;
        let mut candidate: Option<String> = None;
        for event in &events {
            if let EventData::HookCreated { hook_id, name: hook_name, .. } = &event.data {
                if hook_name == name {
                    candidate = Some(hook_id.clone());
                }
            }
        }
        let hook_id = candidate.ok_or_else(|| HookBusError::NoPendingHook(name.to_string(), run_id))?;

        let resolved = self.store.resolve_hook(&hook_id, payload.clone()).await?;
        if !resolved {
            return Err(HookBusError::NoPendingHook(name.to_string(), run_id));
        }

        let events = self.store.read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;
        self.store
            .append_events(run_id, next_sequence, vec![EventData::HookReceived { hook_id, payload }])
            .await?;
        self.wake(run_id).await
    }

    /// Turns one overdue `HookExpiry` wake into a `hook.expired` event, if
    /// the hook is still pending (it may already have been signalled in the
    /// race between the wake firing and this sweep running). Called by
    /// [`crate::recovery::RecoverySweeper`], which owns `pop_due_wakes` so
    /// every wake kind is popped from one place.
    #[instrument(skip(self), fields(%run_id, hook_id))]
    pub async fn expire_hook(&self, run_id: Uuid, hook_id: &str) -> Result<bool, HookBusError> {
        let Some(hook) = self.store.get_hook(hook_id).await? else {
            return Ok(false);
        };
        if hook.status != HookStatus::Pending {
            return Ok(false);
        }

        let events = self.store.read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;
        self.store
            .append_events(
                run_id,
                next_sequence,
                vec![EventData::HookExpired { hook_id: hook_id.to_string() }],
            )
            .await?;
        self.wake(run_id).await?;
        Ok(true)
    }

    /// Applies `policy` to every outstanding child of `run_id` (§4.6).
    /// `Abandon` is a no-op by construction; `Wait` requires no executor
    /// action here, since the parent's own `decide` body already blocks on
    /// the child via `start_child_workflow`'s `Pending` outcome.
    #[instrument(skip(self), fields(%run_id, ?policy))]
    pub async fn propagate_cancellation(&self, run_id: Uuid, policy: CancellationPolicy) -> Result<(), HookBusError> {
        if policy != CancellationPolicy::Terminate {
            return Ok(());
        }
        let children = self.store.list_outstanding_children(run_id).await?;
        for child in children {
            if let Err(e) = self.request_cancellation(child.run_id).await {
                warn!(child_run_id = %child.run_id, error = %e, "failed to propagate cancellation to child");
            }
        }
        Ok(())
    }

    async fn request_cancellation(&self, run_id: Uuid) -> Result<(), HookBusError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let events = self.store.read_events(run_id, None).await?;
        let next_sequence = events.len() as i32 + 1;
        self.store
            .append_events(
                run_id,
                next_sequence,
                vec![EventData::CancellationRequested { reason: None }],
            )
            .await?;
        self.wake(run_id).await
    }

    async fn wake(&self, run_id: Uuid) -> Result<(), HookBusError> {
        self.broker
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .map_err(|e| HookBusError::Broker(e.to_string()))
    }
}
