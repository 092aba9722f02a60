//! The replay engine (C3) and runtime dispatcher (C4).

pub mod executor;
pub mod registry;
pub mod step_registry;

pub use executor::{DispatchOutcome, EngineConfig, StartOptions, WorkflowExecutor};
pub use registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
pub use step_registry::{StepFn, StepRegistry, StepRegistryError};
