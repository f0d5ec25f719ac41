//! Durable step execution for ordered workflows.
//!
//! A [`WorkflowDefinition`] is an immutable list of named steps built with
//! [`create_workflow`]. The [`Engine`] runs it against an input, persisting a
//! [`RunRecord`] through a [`StorageBackend`] after every step attempt. A run
//! that failed can be resumed at the failing step with
//! [`Engine::retry_step`]; steps that already completed are not run again.

pub mod error;
pub mod logger;
pub mod storage;
pub mod types;
pub mod workflow;

pub use error::{FluxError, FluxResult};
pub use logger::{LogEntry, LogLevel, Logger, MemoryLogger, NoopLogger, TracingLogger};
pub use storage::{FilesystemStorage, InMemoryStorage, RedbStorage, StorageBackend};
pub use types::*;
pub use workflow::{
    create_workflow, Backoff, Engine, ExecutionContext, StepOptions, WorkflowDefinition,
};
