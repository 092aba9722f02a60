//! Scheduler/broker adapter (C5, §4.4): moves dispatch decisions onto a
//! queue so workers don't poll the storage contract directly. Kept as a
//! separate trait from [`crate::persistence::StorageContract`] (§9 "storage
//! backends -> one interface" is about durable state, not transport) so a
//! deployment can swap Redis/SQS/etc in without touching persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which logical queue a message belongs to. Workflow ticks and step tasks
/// are scheduled independently so a worker pool can size each separately
/// (§5 concurrency model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    WorkflowTick,
    StepTask,
}

/// A unit of dispatch: either "replay this run" or "execute this step".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub message_id: Uuid,
    pub queue: QueueKind,
    pub run_id: Uuid,
    /// Present only for `QueueKind::StepTask`.
    pub step_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
    pub delivery_attempt: u32,
}

impl BrokerMessage {
    pub fn workflow_tick(run_id: Uuid) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            queue: QueueKind::WorkflowTick,
            run_id,
            step_id: None,
            enqueued_at: Utc::now(),
            not_before: None,
            delivery_attempt: 0,
        }
    }

    pub fn step_task(run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            queue: QueueKind::StepTask,
            run_id,
            step_id: Some(step_id.into()),
            enqueued_at: Utc::now(),
            not_before: None,
            delivery_attempt: 0,
        }
    }

    pub fn with_delay(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }
}

/// A delivered message together with the token needed to ack/nack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: BrokerMessage,
    pub delivery_token: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("delivery token not found or already acknowledged: {0}")]
    UnknownDelivery(Uuid),
}

/// The scheduler/broker contract (C5, §4.4). Implementations provide
/// at-least-once delivery: a message is redelivered if not acked within a
/// visibility window, which is why the executor must treat every tick and
/// step task as idempotent (replay, and the terminal-event check on step
/// tasks).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, message: BrokerMessage) -> Result<(), BrokerError>;

    /// Best-effort: a message already in flight to a worker may still be
    /// delivered once more (§9, at-least-once is the contract, not exactly-once).
    async fn cancel(&self, run_id: Uuid, queue: QueueKind) -> Result<(), BrokerError>;

    /// Pull up to `max` deliverable messages (respecting `not_before`) from
    /// `queue`, making them invisible to other pollers until acked/nacked.
    async fn poll(&self, queue: QueueKind, max: u32) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, delivery_token: Uuid) -> Result<(), BrokerError>;

    /// Release visibility immediately so the message is eligible for
    /// redelivery, optionally with a new delay.
    async fn nack(&self, delivery_token: Uuid, retry_after: Option<DateTime<Utc>>) -> Result<(), BrokerError>;
}
