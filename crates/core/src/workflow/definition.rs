use crate::types::{RunId, StepData};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Type-erased step handler
pub type StepHandler<I> =
    Arc<dyn Fn(ExecutionContext<I>) -> BoxFuture<'static, anyhow::Result<StepData>> + Send + Sync>;

/// What a step handler sees
///
/// `data` is a snapshot of everything earlier steps contributed. Changes the
/// step wants to keep go into the returned [`StepData`].
#[derive(Debug, Clone)]
pub struct ExecutionContext<I> {
    pub run_id: RunId,
    pub step: String,
    /// 1-based attempt number of this invocation
    pub attempt: u32,
    pub input: Arc<I>,
    pub data: Map<String, Value>,
}

impl<I> ExecutionContext<I> {
    pub fn input(&self) -> &I {
        &self.input
    }

    /// Deserialize a value an earlier step stored under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.data.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but fails when the key is missing
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        self.get(key)?
            .ok_or_else(|| anyhow::anyhow!("Missing `{}` in workflow data", key))
    }
}

/// Delay between failed attempts of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry immediately
    #[default]
    None,
    /// Same delay before every retry
    Fixed(Duration),
    /// `base * 2^(attempt - 1)` before the retry following `attempt`
    Exponential { base: Duration },
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Backoff::None => None,
            Backoff::Fixed(delay) => Some(delay),
            Backoff::Exponential { base } => {
                let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
                Some(base.saturating_mul(factor))
            }
        }
    }
}

/// Retry and timeout settings for a single step
///
/// Defaults: no retries, no timeout, no backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepOptions {
    /// Additional attempts after the first
    pub retries: u32,
    /// Upper bound for a single attempt; `None` waits forever
    pub timeout: Option<Duration>,
    pub backoff: Backoff,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, millis: u64) -> Self {
        self.timeout(Duration::from_millis(millis))
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// A named step inside a workflow
pub struct StepDefinition<I> {
    pub(crate) name: String,
    pub(crate) handler: StepHandler<I>,
    pub(crate) options: StepOptions,
    pub(crate) is_commit: bool,
}

impl<I> StepDefinition<I> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &StepOptions {
        &self.options
    }

    pub fn is_commit(&self) -> bool {
        self.is_commit
    }
}

impl<I> std::fmt::Debug for StepDefinition<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("is_commit", &self.is_commit)
            .finish_non_exhaustive()
    }
}

/// Immutable, ordered list of steps
///
/// Produced by [`create_workflow`](super::create_workflow). Step names are
/// unique and a commit step, if present, is last.
pub struct WorkflowDefinition<I = Value> {
    pub(crate) name: String,
    pub(crate) steps: Arc<[StepDefinition<I>]>,
}

impl<I> WorkflowDefinition<I> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDefinition<I>] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition<I>> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn commit_step(&self) -> Option<&StepDefinition<I>> {
        self.steps.last().filter(|s| s.is_commit)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

impl<I> Clone for WorkflowDefinition<I> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            steps: self.steps.clone(),
        }
    }
}

impl<I> std::fmt::Debug for WorkflowDefinition<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_options_defaults() {
        let options = StepOptions::default();
        assert_eq!(options.retries, 0);
        assert_eq!(options.timeout, None);
        assert_eq!(options.backoff, Backoff::None);
        assert_eq!(options.max_attempts(), 1);

        let options = StepOptions::new().retries(2).timeout_ms(2000);
        assert_eq!(options.max_attempts(), 3);
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_backoff_delays() {
        assert_eq!(Backoff::None.delay_after(3), None);
        assert_eq!(
            Backoff::Fixed(Duration::from_millis(10)).delay_after(4),
            Some(Duration::from_millis(10))
        );

        let exp = Backoff::Exponential {
            base: Duration::from_millis(100),
        };
        assert_eq!(exp.delay_after(1), Some(Duration::from_millis(100)));
        assert_eq!(exp.delay_after(2), Some(Duration::from_millis(200)));
        assert_eq!(exp.delay_after(4), Some(Duration::from_millis(800)));
    }

    #[test]
    fn test_context_typed_access() {
        let mut data = Map::new();
        data.insert("count".to_string(), json!(3));
        let ctx = ExecutionContext {
            run_id: RunId::new(),
            step: "s".to_string(),
            attempt: 1,
            input: Arc::new(json!({})),
            data,
        };

        assert_eq!(ctx.get::<u32>("count").unwrap(), Some(3));
        assert_eq!(ctx.get::<u32>("missing").unwrap(), None);
        assert!(ctx.get::<String>("count").is_err());
        assert!(ctx.require::<u32>("missing").is_err());
    }
}
