//! # Durable Workflow Engine
//!
//! An event-sourced workflow execution engine: runs survive process
//! crashes, worker restarts, and indefinite suspensions because every state
//! change is an append-only event, and the workflow body is a deterministic
//! function replayed against that log rather than live state kept in memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Api (C8)                              │
//! │   start / cancel / signal_hook / resume                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowExecutor (C3 + C4)                  │
//! │   replay engine + dispatcher: decide() -> events/tasks        │
//! └───────────────┬─────────────────────────────┬───────────────┘
//!                 ▼                             ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │  StorageContract (C2)     │   │     Broker (C5)            │
//! │  in-memory / PostgreSQL   │   │  in-memory / pluggable      │
//! └───────────────────────────┘   └───────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool (§5)                         │
//! │   tick loop + step loop, backpressure-gated                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `HookBus` (C6) and `RecoverySweeper` (C7) run alongside the worker pool,
//! turning external hook signals and expired claims/timers into events on
//! the runs they concern.
//!
//! ## Example
//!
//! ```ignore
//! use durable_workflow::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use serde_json::{json, Value};
//!
//! #[derive(Debug, Serialize, Deserialize, Clone)]
//! struct Input {
//!     order_id: String,
//! }
//!
//! struct ChargeOrder {
//!     input: Input,
//! }
//!
//! impl Workflow for ChargeOrder {
//!     const TYPE: &'static str = "charge_order";
//!     type Input = Input;
//!     type Output = Value;
//!
//!     fn new(input: Input) -> Self {
//!         Self { input }
//!     }
//!
//!     fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
//!         let result = ctx.step("charge", json!({"order_id": self.input.order_id}), StepOptions::default())?;
//!         Ok(Outcome::Complete(result))
//!     }
//! }
//! ```

pub mod api;
pub mod config;
pub mod continuation;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod model;
pub mod observability;
pub mod persistence;
pub mod recovery;
pub mod reliability;
pub mod rest;
pub mod scheduler;
pub mod worker;
pub mod workflow;

/// Common imports for embedding applications.
pub mod prelude {
    pub use crate::api::{Api, StartRequest};
    pub use crate::engine::{DispatchOutcome, EngineConfig, StartOptions, WorkflowExecutor, WorkflowRegistry};
    pub use crate::error::{ApiError, EngineError, StepError, WorkflowError};
    pub use crate::hooks::HookBus;
    pub use crate::model::{Event, EventData, Hook, Run, RunStatus, Step};
    pub use crate::persistence::{InMemoryStore, PostgresStore, StorageContract, StoreError};
    pub use crate::recovery::{RecoveryConfig, RecoverySweeper};
    pub use crate::reliability::RetryPolicy;
    pub use crate::scheduler::{Broker, InMemoryBroker, QueueKind};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig};
    pub use crate::workflow::action::StepOptions;
    pub use crate::workflow::definition::{Outcome, Suspend, Workflow};
    pub use crate::workflow::DecisionContext;
}

pub use api::Api;
pub use engine::{DispatchOutcome, EngineConfig, WorkflowExecutor};
pub use error::{ApiError, EngineError, StepError, WorkflowError};
pub use model::{Event, Hook, Run, RunStatus, Step};
pub use persistence::{InMemoryStore, PostgresStore, StorageContract, StoreError};
pub use scheduler::{Broker, InMemoryBroker};
pub use worker::WorkerPool;
pub use workflow::definition::{Outcome, Suspend, Workflow};
