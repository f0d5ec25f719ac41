use super::definition::{ExecutionContext, StepDefinition, StepHandler, StepOptions, WorkflowDefinition};
use crate::error::{FluxError, FluxResult};
use crate::types::StepData;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Start describing a workflow
///
/// ```
/// use flux_core::workflow::{create_workflow, StepOptions};
/// use flux_core::StepData;
///
/// # fn main() -> flux_core::FluxResult<()> {
/// let workflow = create_workflow("greet")
///     .input::<String>()
///     .step("hello", |ctx| async move {
///         Ok(StepData::new().with("greeting", format!("hello {}", ctx.input())))
///     })?
///     .step_with("shout", StepOptions::new().retries(1), |ctx| async move {
///         let greeting: String = ctx.require("greeting")?;
///         anyhow::Ok(StepData::new().with("greeting", greeting.to_uppercase()))
///     })?
///     .build();
/// assert_eq!(workflow.step_names(), vec!["hello", "shout"]);
/// # Ok(())
/// # }
/// ```
pub fn create_workflow(name: impl Into<String>) -> WorkflowDraft {
    WorkflowDraft { name: name.into() }
}

/// A workflow with a name and nothing else yet
///
/// Call [`input`](Self::input) to fix the input type; adding steps directly
/// uses untyped JSON input.
#[derive(Debug, Clone)]
pub struct WorkflowDraft {
    name: String,
}

impl WorkflowDraft {
    /// Fix the type handlers receive as input. Compile-time only.
    pub fn input<T>(self) -> WorkflowBuilder<T> {
        WorkflowBuilder {
            name: self.name,
            steps: Vec::new(),
            committed: false,
            _input: PhantomData,
        }
    }

    pub fn step<F, Fut>(self, name: impl Into<String>, handler: F) -> FluxResult<WorkflowBuilder<Value>>
    where
        F: Fn(ExecutionContext<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepData>> + Send + 'static,
    {
        self.input::<Value>().step(name, handler)
    }

    pub fn step_with<F, Fut>(
        self,
        name: impl Into<String>,
        options: StepOptions,
        handler: F,
    ) -> FluxResult<WorkflowBuilder<Value>>
    where
        F: Fn(ExecutionContext<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepData>> + Send + 'static,
    {
        self.input::<Value>().step_with(name, options, handler)
    }

    pub fn commit<F, Fut>(self, name: impl Into<String>, handler: F) -> FluxResult<WorkflowBuilder<Value>>
    where
        F: Fn(ExecutionContext<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepData>> + Send + 'static,
    {
        self.input::<Value>().commit(name, handler)
    }
}

/// Accumulates steps in order
pub struct WorkflowBuilder<I> {
    name: String,
    steps: Vec<StepDefinition<I>>,
    committed: bool,
    _input: PhantomData<fn() -> I>,
}

impl<I> WorkflowBuilder<I>
where
    I: Send + Sync + 'static,
{
    /// Append a step with default options
    pub fn step<F, Fut>(self, name: impl Into<String>, handler: F) -> FluxResult<Self>
    where
        F: Fn(ExecutionContext<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepData>> + Send + 'static,
    {
        self.step_with(name, StepOptions::default(), handler)
    }

    /// Append a step with explicit retry/timeout options
    pub fn step_with<F, Fut>(mut self, name: impl Into<String>, options: StepOptions, handler: F) -> FluxResult<Self>
    where
        F: Fn(ExecutionContext<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepData>> + Send + 'static,
    {
        let name = name.into();
        if self.committed {
            return Err(FluxError::InvalidCommitPlacement {
                workflow: self.name,
                reason: format!("step {} added after the commit step", name),
            });
        }
        self.push(name, options, erase(handler), false)?;
        Ok(self)
    }

    /// Append the terminal commit step
    pub fn commit<F, Fut>(self, name: impl Into<String>, handler: F) -> FluxResult<Self>
    where
        F: Fn(ExecutionContext<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepData>> + Send + 'static,
    {
        self.commit_with(name, StepOptions::default(), handler)
    }

    /// Append the terminal commit step with explicit options
    pub fn commit_with<F, Fut>(mut self, name: impl Into<String>, options: StepOptions, handler: F) -> FluxResult<Self>
    where
        F: Fn(ExecutionContext<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepData>> + Send + 'static,
    {
        let name = name.into();
        if self.committed {
            return Err(FluxError::InvalidCommitPlacement {
                workflow: self.name,
                reason: format!("commit step {} added after an existing commit step", name),
            });
        }
        self.push(name, options, erase(handler), true)?;
        self.committed = true;
        Ok(self)
    }

    pub fn build(self) -> WorkflowDefinition<I> {
        WorkflowDefinition {
            name: self.name,
            steps: self.steps.into(),
        }
    }

    fn push(&mut self, name: String, options: StepOptions, handler: StepHandler<I>, is_commit: bool) -> FluxResult<()> {
        if self.steps.iter().any(|s| s.name == name) {
            return Err(FluxError::DuplicateStepName(name));
        }
        self.steps.push(StepDefinition {
            name,
            handler,
            options,
            is_commit,
        });
        Ok(())
    }
}

impl<I> std::fmt::Debug for WorkflowBuilder<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowBuilder")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("committed", &self.committed)
            .finish()
    }
}

fn erase<I, F, Fut>(handler: F) -> StepHandler<I>
where
    I: 'static,
    F: Fn(ExecutionContext<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StepData>> + Send + 'static,
{
    Arc::new(move |ctx: ExecutionContext<I>| handler(ctx).boxed())
}
