use super::definition::{ExecutionContext, StepDefinition, StepOptions};
use crate::types::{StepData, StepFailure};
use std::time::Duration;
use tokio::time::timeout;

/// Why a single attempt did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// The handler returned an error
    #[error("{0}")]
    Handler(String),

    /// The handler did not finish in time and was left running in the background
    #[error("Step timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// The handler panicked
    #[error("Step panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StepError::Timeout(_))
    }
}

/// Final result of running a step under its policy
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded { data: StepData, attempts: u32 },
    Failed(StepFailure),
}

/// Whether another attempt follows the given failed attempt (1-based)
pub fn should_retry(options: &StepOptions, attempt: u32) -> bool {
    attempt < options.max_attempts()
}

/// Delay before the attempt following `attempt`, if any
pub fn retry_delay(options: &StepOptions, attempt: u32) -> Option<Duration> {
    options.backoff.delay_after(attempt).filter(|d| !d.is_zero())
}

/// Run one attempt of a step
///
/// The handler runs as its own task and is raced against the step timeout.
/// When the timer wins the task is detached, not aborted: whatever it does
/// afterwards still happens, but its result is ignored.
pub async fn run_attempt<I>(step: &StepDefinition<I>, ctx: ExecutionContext<I>) -> Result<StepData, StepError>
where
    I: Send + Sync + 'static,
{
    // Handler runs on its own task
    let handle = tokio::spawn((step.handler)(ctx));

    // Race the handler against the step timeout, if any
    let joined = match step.options.timeout {
        Some(limit) => match timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => return Err(StepError::Timeout(limit)),
        },
        None => handle.await,
    };

    // Map the join result onto a step error
    match joined {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => Err(StepError::Handler(format!("{:#}", e))),
        Err(join_error) if join_error.is_panic() => {
            Err(StepError::Panicked(panic_message(join_error.into_panic())))
        }
        Err(join_error) => Err(StepError::Panicked(join_error.to_string())),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
