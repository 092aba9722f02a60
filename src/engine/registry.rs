//! Type-erased workflow registry so the dispatcher can hold many workflow
//! types behind one interface (§9 "global registries -> explicit context":
//! the registry itself becomes a plain value owned by `WorkflowExecutor`
//! instead of a process-wide singleton).

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::workflow::definition::{Outcome, Suspend, Workflow};
use crate::workflow::DecisionContext;

/// Object-safe facade over a concrete [`Workflow`] with input/output erased
/// to JSON so the dispatcher can drive any registered type uniformly.
pub trait AnyWorkflow: Send {
    fn workflow_type(&self) -> &'static str;
    fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend>;
}

struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn decide(&mut self, ctx: &mut DecisionContext) -> Result<Outcome<Value>, Suspend> {
        match self.inner.decide(ctx) {
            Ok(Outcome::Complete(output)) => {
                let value = serde_json::to_value(output).map_err(|e| {
                    Suspend::StepFailed(crate::error::StepError::fatal(format!(
                        "failed to serialize workflow output: {e}"
                    )))
                })?;
                Ok(Outcome::Complete(value))
            }
            Ok(Outcome::Failed(err)) => Ok(Outcome::Failed(err)),
            Ok(Outcome::Cancelled) => Ok(Outcome::Cancelled),
            Ok(Outcome::ContinueAsNew(new_input)) => Ok(Outcome::ContinueAsNew(new_input)),
            Err(suspend) => Err(suspend),
        }
    }
}

type WorkflowFactory = Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[from] serde_json::Error),
}

/// Holds one factory per registered workflow type. Threaded explicitly
/// through `WorkflowExecutor` rather than kept as a global.
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            let workflow = W::new(typed_input);
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow>)
        });
        self.factories.insert(W::TYPE.to_string(), factory);
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;
        Ok(factory(input)?)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Input {
        n: u32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Output {
        n: u32,
    }

    struct TestWorkflow {
        n: u32,
    }

    impl Workflow for TestWorkflow {
        const TYPE: &'static str = "test_workflow";
        type Input = Input;
        type Output = Output;

        fn new(input: Self::Input) -> Self {
            Self { n: input.n }
        }

        fn decide(&mut self, _ctx: &mut DecisionContext) -> Result<Outcome<Self::Output>, Suspend> {
            Ok(Outcome::Complete(Output { n: self.n }))
        }
    }

    #[test]
    fn register_and_create() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<TestWorkflow>();
        assert!(registry.contains("test_workflow"));
        assert_eq!(registry.len(), 1);

        let mut instance = registry
            .create("test_workflow", serde_json::json!({"n": 5}))
            .unwrap();
        let run_id = uuid::Uuid::now_v7();
        let mut ctx = DecisionContext::new(run_id, &[], chrono::Utc::now(), 0, 3);
        let outcome = instance.decide(&mut ctx).unwrap();
        match outcome {
            Outcome::Complete(v) => assert_eq!(v, serde_json::json!({"n": 5})),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn unknown_workflow_type_errors() {
        let registry = WorkflowRegistry::new();
        let err = registry.create("missing", Value::Null).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownWorkflowType(_)));
    }

    #[test]
    fn invalid_input_errors() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<TestWorkflow>();
        let err = registry
            .create("test_workflow", serde_json::json!({"wrong": true}))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Deserialization(_)));
    }

    #[test]
    fn workflow_types_iterator() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<TestWorkflow>();
        let types: Vec<_> = registry.workflow_types().collect();
        assert_eq!(types, vec!["test_workflow"]);
    }

    #[test]
    fn debug_impl_lists_types() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<TestWorkflow>();
        let debug_str = format!("{registry:?}");
        assert!(debug_str.contains("test_workflow"));
    }
}
