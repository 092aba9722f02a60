//! Error kinds (§7), mapped onto idiomatic Rust error types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An error raised inside a step. Carries whether the engine should retry it.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    pub error_type: Option<String>,
    pub retryable: bool,
    pub details: Option<Value>,
}

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An error a workflow body surfaces as its final outcome, or that the engine
/// raises into the body (fatal step failure, nesting-limit violation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct WorkflowError {
    pub message: String,
    pub code: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn from_step_error(err: &StepError) -> Self {
        let mut wf_err = Self::new(err.message.clone());
        if let Some(code) = &err.error_type {
            wf_err = wf_err.with_code(code.clone());
        }
        wf_err
    }

    pub fn nesting_limit_exceeded(limit: u32) -> Self {
        Self::new(format!("child workflow exceeds nesting limit ({limit})"))
            .with_code("nesting_limit")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Errors surfaced to callers of the public API (§4.1).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("run not found: {0}")]
    RunNotFound(uuid::Uuid),

    #[error("hook not found: {run_id}/{hook_name}")]
    HookNotFound { run_id: uuid::Uuid, hook_name: String },

    #[error("idempotency conflict for ({workflow_name}, {key})")]
    IdempotencyConflict { workflow_name: String, key: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown workflow type: {0}")]
    UnknownWorkflow(String),

    #[error("storage error: {0}")]
    Storage(#[from] crate::persistence::StoreError),
}

/// Top-level errors raised by the replay engine and dispatcher (C3/C4).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Store(#[from] crate::persistence::StoreError),

    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("workflow already terminal")]
    AlreadyTerminal,

    #[error("replay produced a non-deterministic divergence: {0}")]
    ReplayDivergence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("nesting limit exceeded: {0}")]
    NestingLimitExceeded(u32),

    #[error("broker error: {0}")]
    Broker(String),
}

impl From<crate::engine::RegistryError> for EngineError {
    fn from(err: crate::engine::RegistryError) -> Self {
        match err {
            crate::engine::RegistryError::UnknownWorkflowType(name) => EngineError::UnknownWorkflowType(name),
            crate::engine::RegistryError::Deserialization(e) => EngineError::Serialization(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_builders() {
        let err = StepError::fatal("bad input").with_type("validation");
        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("validation"));
    }

    #[test]
    fn workflow_error_from_step_error() {
        let step_err = StepError::fatal("boom").with_type("boom_type");
        let wf_err = WorkflowError::from_step_error(&step_err);
        assert_eq!(wf_err.message, "boom");
        assert_eq!(wf_err.code.as_deref(), Some("boom_type"));
    }
}
