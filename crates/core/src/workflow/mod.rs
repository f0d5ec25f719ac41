pub mod builder;
pub mod definition;
pub mod engine;
pub mod policy;

pub use builder::{create_workflow, WorkflowBuilder, WorkflowDraft};
pub use definition::{
    Backoff, ExecutionContext, StepDefinition, StepHandler, StepOptions, WorkflowDefinition,
};
pub use engine::Engine;
pub use policy::{StepError, StepOutcome};
