//! Error types for the Flux engine.

use crate::types::{RunId, RunStatus};

/// Result type for engine and builder operations.
pub type FluxResult<T> = Result<T, FluxError>;

/// Errors surfaced to callers of the builder and the engine.
///
/// Step failures are not errors: they are recorded on the run and returned
/// as a record with status `failed`.
#[derive(Debug, thiserror::Error)]
pub enum FluxError {
    /// A step name was used twice in one workflow.
    #[error("Duplicate step name: {0}")]
    DuplicateStepName(String),

    /// A commit step was added twice, or a step was added after the commit.
    #[error("Invalid commit placement in workflow {workflow}: {reason}")]
    InvalidCommitPlacement { workflow: String, reason: String },

    /// The run is not in a state that permits the requested operation.
    #[error("Run {run_id} is {status}; only failed runs can be retried")]
    InvalidState { run_id: RunId, status: RunStatus },

    /// A retry named a step other than the one the run failed at.
    #[error("Run {run_id} failed at step {failed}, not {requested}")]
    StepMismatch {
        run_id: RunId,
        requested: String,
        failed: String,
    },

    /// The run was produced by a different workflow than the one supplied.
    #[error("Run {run_id} belongs to workflow {recorded}, not {supplied}")]
    WorkflowMismatch {
        run_id: RunId,
        recorded: String,
        supplied: String,
    },

    /// The step is not part of the supplied workflow.
    #[error("Step {step} is not defined in workflow {workflow}")]
    UnknownStep { workflow: String, step: String },

    /// Workflow input could not be converted to or from its persisted form.
    #[error("Invalid workflow input: {0}")]
    Input(#[from] serde_json::Error),

    /// The storage backend failed. Not retried.
    #[error("Storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl FluxError {
    /// True for errors caused by misuse of the API rather than I/O.
    pub fn is_usage_error(&self) -> bool {
        !matches!(self, FluxError::Storage(_))
    }
}
