//! Step function registry: maps the step names a workflow body declares onto
//! the actual async functions a worker executes. Kept separate from
//! [`super::registry::WorkflowRegistry`] because workflow bodies only ever
//! *describe* a step (name + input); the function that runs it is supplied
//! by the embedding application, not the workflow definition itself.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::StepError;

pub type StepFuture = Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send>>;
pub type StepFn = Arc<dyn Fn(Value) -> StepFuture + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum StepRegistryError {
    #[error("unknown step: {0}")]
    UnknownStep(String),
}

/// Holds one async function per step name.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, StepFn>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step function. `f` must be a pure function of its input
    /// plus whatever external effects it performs (§4.2: nondeterminism
    /// belongs inside steps, never inside `Workflow::decide`).
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        let name = name.into();
        let boxed: StepFn = Arc::new(move |input| Box::pin(f(input)));
        self.steps.insert(name, boxed);
    }

    pub async fn execute(&self, name: &str, input: Value) -> Result<Value, StepError> {
        let f = self
            .steps
            .get(name)
            .ok_or_else(|| StepError::fatal(format!("unknown step: {name}")).with_type("unknown_step"))?;
        f(input).await
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registered_step_executes() {
        let mut registry = StepRegistry::new();
        registry.register("double", |input: Value| async move {
            let n = input.as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        });
        let result = registry.execute("double", json!(21)).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn unknown_step_errors() {
        let registry = StepRegistry::new();
        let err = registry.execute("missing", Value::Null).await.unwrap_err();
        assert_eq!(err.error_type.as_deref(), Some("unknown_step"));
    }
}
