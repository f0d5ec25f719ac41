use super::definition::{ExecutionContext, StepDefinition, WorkflowDefinition};
use super::policy::{self, StepOutcome};
use crate::error::{FluxError, FluxResult};
use crate::logger::{Logger, TracingLogger};
use crate::storage::StorageBackend;
use crate::types::{CompletedStep, RunId, RunRecord, RunStatus, StepFailure, StepProgress};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Runs workflow definitions and persists their progress
///
/// Steps of one run execute strictly in order. Separate runs may be driven
/// concurrently through the same engine.
#[derive(Clone)]
pub struct Engine {
    storage: Arc<dyn StorageBackend>,
    logger: Arc<dyn Logger>,
    // Runs currently driven by this engine, so one id never has two
    // operations in flight
    active_runs: Arc<Mutex<HashSet<RunId>>>,
}

impl Engine {
    pub fn new(storage: Arc<dyn StorageBackend>, logger: Arc<dyn Logger>) -> Self {
        Self {
            storage,
            logger,
            active_runs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Engine that reports progress through `tracing`
    pub fn with_tracing(storage: Arc<dyn StorageBackend>) -> Self {
        Self::new(storage, Arc::new(TracingLogger))
    }

    /// Run a workflow from its first step
    ///
    /// Step failures do not produce an `Err`; they come back as a record with
    /// status `failed`. Only storage and input serialization errors are
    /// returned as errors.
    pub async fn execute<I>(&self, definition: &WorkflowDefinition<I>, input: I) -> FluxResult<RunRecord>
    where
        I: Serialize + Send + Sync + 'static,
    {
        let run_id = RunId::new();
        let snapshot = serde_json::to_value(&input)?;
        let _guard = self.claim(run_id).ok_or(FluxError::InvalidState {
            run_id,
            status: RunStatus::Running,
        })?;

        let mut record = RunRecord::new(run_id, definition.name(), snapshot);
        self.logger.info(&format!(
            "Starting workflow execution: workflow={}, run_id={}",
            definition.name(),
            run_id
        ));
        self.persist(&record).await?;

        self.drive(definition, &mut record, Arc::new(input), 0).await?;
        Ok(record)
    }

    /// Resume a failed run at the step it failed on
    ///
    /// Steps completed before the failure are not run again; the retried step
    /// sees the data they produced. Returns `Ok(None)` when no run has the
    /// given id.
    pub async fn retry_step<I>(
        &self,
        definition: &WorkflowDefinition<I>,
        run_id: RunId,
        step_name: &str,
    ) -> FluxResult<Option<RunRecord>>
    where
        I: DeserializeOwned + Send + Sync + 'static,
    {
        let _guard = self.claim(run_id).ok_or(FluxError::InvalidState {
            run_id,
            status: RunStatus::Running,
        })?;

        let Some(mut record) = self.load(&run_id).await? else {
            self.logger.warn(&format!("Retry requested for unknown run {}", run_id));
            return Ok(None);
        };

        // Only a failed run can be reopened, and only at its failed step
        let failed_step = match (&record.status, &record.failure) {
            (RunStatus::Failed, Some(failure)) => failure.step.clone(),
            (status, _) => {
                return Err(FluxError::InvalidState {
                    run_id,
                    status: *status,
                })
            }
        };

        if record.workflow_name != definition.name() {
            return Err(FluxError::WorkflowMismatch {
                run_id,
                recorded: record.workflow_name,
                supplied: definition.name().to_string(),
            });
        }

        if failed_step != step_name {
            return Err(FluxError::StepMismatch {
                run_id,
                requested: step_name.to_string(),
                failed: failed_step,
            });
        }

        let position = definition
            .position(step_name)
            .ok_or_else(|| FluxError::UnknownStep {
                workflow: definition.name().to_string(),
                step: step_name.to_string(),
            })?;

        let input: I = serde_json::from_value(record.input.clone())?;

        // Reopen the run before replaying anything
        record.status = RunStatus::Running;
        record.failure = None;
        record.current_step = None;
        record.touch();
        self.persist(&record).await?;

        self.logger.info(&format!(
            "Retrying workflow execution from step {}: workflow={}, run_id={}",
            step_name,
            definition.name(),
            run_id
        ));

        self.drive(definition, &mut record, Arc::new(input), position).await?;
        Ok(Some(record))
    }

    /// Current stored state of a run
    pub async fn get_run(&self, run_id: RunId) -> FluxResult<Option<RunRecord>> {
        self.load(&run_id).await
    }

    /// All stored runs, most recent first
    pub async fn list_runs(&self) -> FluxResult<Vec<RunRecord>> {
        self.storage.list().await.map_err(FluxError::Storage)
    }

    /// Execute `definition.steps()[from..]` against `record`, persisting after
    /// every transition, and leave the record in a settled state
    async fn drive<I>(
        &self,
        definition: &WorkflowDefinition<I>,
        record: &mut RunRecord,
        input: Arc<I>,
        from: usize,
    ) -> FluxResult<()>
    where
        I: Send + Sync + 'static,
    {
        for step in &definition.steps()[from..] {
            match self.run_step(step, record, &input).await? {
                StepOutcome::Succeeded { data, attempts } => {
                    // Merge step output and record completion
                    data.merge_into(&mut record.data);
                    record.completed_steps.push(CompletedStep {
                        name: step.name().to_string(),
                        completed_at: chrono::Utc::now(),
                    });
                    record.current_step = None;
                    record.touch();
                    self.persist(record).await?;

                    self.logger.info(&format!(
                        "Step {} completed after {} attempt(s): run_id={}",
                        step.name(),
                        attempts,
                        record.id
                    ));
                }
                StepOutcome::Failed(failure) => {
                    // Later steps never run
                    self.logger.error(&format!(
                        "Workflow execution failed: run_id={}, step={}, attempts={}, error={}",
                        record.id, failure.step, failure.attempts, failure.error
                    ));

                    record.status = RunStatus::Failed;
                    record.current_step = None;
                    record.failure = Some(failure);
                    record.touch();
                    self.persist(record).await?;
                    return Ok(());
                }
            }
        }

        // All steps done
        record.status = RunStatus::Succeeded;
        record.touch();
        self.persist(record).await?;

        self.logger.info(&format!(
            "Workflow execution completed: workflow={}, run_id={}",
            definition.name(),
            record.id
        ));
        Ok(())
    }

    /// Attempt a step until it succeeds or its attempts run out
    async fn run_step<I>(
        &self,
        step: &StepDefinition<I>,
        record: &mut RunRecord,
        input: &Arc<I>,
    ) -> FluxResult<StepOutcome>
    where
        I: Send + Sync + 'static,
    {
        let options = step.options();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.logger.info(&format!(
                "Executing step {} (attempt {}/{}) for run {}",
                step.name(),
                attempt,
                options.max_attempts(),
                record.id
            ));

            // Each attempt sees the data as of the last completed step
            let ctx = ExecutionContext {
                run_id: record.id,
                step: step.name().to_string(),
                attempt,
                input: input.clone(),
                data: record.data.clone(),
            };

            let error = match policy::run_attempt(step, ctx).await {
                Ok(data) => return Ok(StepOutcome::Succeeded { data, attempts: attempt }),
                Err(error) => error,
            };

            let message = error.to_string();
            if !policy::should_retry(options, attempt) {
                return Ok(StepOutcome::Failed(StepFailure {
                    step: step.name().to_string(),
                    error: message,
                    attempts: attempt,
                }));
            }

            self.logger.warn(&format!(
                "Step {} failed (attempt {}), will retry: {}",
                step.name(),
                attempt,
                message
            ));

            // Persist progress before waiting for the next attempt
            record.current_step = Some(StepProgress {
                step: step.name().to_string(),
                attempts: attempt,
                last_error: Some(message),
            });
            record.touch();
            self.persist(record).await?;

            if let Some(delay) = policy::retry_delay(options, attempt) {
                self.logger.info(&format!(
                    "Retrying step {} after {:?} (attempt {})",
                    step.name(),
                    delay,
                    attempt + 1
                ));
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn persist(&self, record: &RunRecord) -> FluxResult<()> {
        self.storage.save(record).await.map_err(FluxError::Storage)
    }

    async fn load(&self, run_id: &RunId) -> FluxResult<Option<RunRecord>> {
        self.storage.load(run_id).await.map_err(FluxError::Storage)
    }

    fn claim(&self, run_id: RunId) -> Option<RunGuard> {
        let mut active = self.active_runs.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(run_id) {
            return None;
        }
        Some(RunGuard {
            run_id,
            active_runs: self.active_runs.clone(),
        })
    }
}

/// Releases a claimed run id on drop
struct RunGuard {
    run_id: RunId,
    active_runs: Arc<Mutex<HashSet<RunId>>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{LogLevel, MemoryLogger, NoopLogger};
    use crate::storage::InMemoryStorage;
    use crate::types::StepData;
    use crate::workflow::{create_workflow, Backoff, StepOptions};
    use anyhow::anyhow;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn engine() -> (Engine, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        (Engine::new(storage.clone(), Arc::new(NoopLogger)), storage)
    }

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    /// step-1 sets `step1`, step-2 calls a flaky API, step-3 commits the API
    /// result
    fn api_workflow(api_down: Arc<AtomicBool>, step1_runs: Arc<AtomicU32>) -> WorkflowDefinition {
        create_workflow("api-sync")
            .step("step-1", move |_ctx| {
                let runs = step1_runs.clone();
                async move {
                    let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(StepData::new().with("step1", "Done").with("step1Run", n))
                }
            })
            .unwrap()
            .step_with(
                "step-2",
                StepOptions::new().retries(2).timeout_ms(2000),
                move |_ctx| {
                    let api_down = api_down.clone();
                    async move {
                        if api_down.load(Ordering::SeqCst) {
                            return Err(anyhow!("503 Service Unavailable"));
                        }
                        Ok(StepData::new().with("apiResult", "Success from API"))
                    }
                },
            )
            .unwrap()
            .commit("step-3", |ctx| async move {
                let result: String = ctx.require("apiResult")?;
                anyhow::Ok(StepData::new().with("committed", result))
            })
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let (engine, storage) = engine();
        let workflow = create_workflow("math")
            .input::<i64>()
            .step("double", |ctx| async move { Ok(StepData::new().with("doubled", *ctx.input() * 2)) })
            .unwrap()
            .step("add", |ctx| async move {
                let doubled: i64 = ctx.require("doubled")?;
                anyhow::Ok(StepData::new().with("sum", doubled + 1))
            })
            .unwrap()
            .commit("done", |_ctx| async move { Ok(StepData::new().with("done", true)) })
            .unwrap()
            .build();

        let record = engine.execute(&workflow, 20).await.unwrap();

        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.input, json!(20));
        assert_eq!(record.data["doubled"], json!(40));
        assert_eq!(record.data["sum"], json!(41));
        assert_eq!(record.data["done"], json!(true));
        let names: Vec<&str> = record.completed_steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["double", "add", "done"]);
        assert!(record.failure.is_none());
        assert!(record.error().is_none());

        let stored = storage.load(&record.id).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_retries_are_exhausted_exactly() {
        let (engine, storage) = engine();
        let attempts = counter();
        let later = counter();
        let (a, l) = (attempts.clone(), later.clone());

        let workflow = create_workflow("flaky")
            .step_with("always-fails", StepOptions::new().retries(3), move |_ctx| {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err::<StepData, _>(anyhow!("nope"))
                }
            })
            .unwrap()
            .commit("never", move |_ctx| {
                let l = l.clone();
                async move {
                    l.fetch_add(1, Ordering::SeqCst);
                    Ok(StepData::new())
                }
            })
            .unwrap()
            .build();

        let record = engine.execute(&workflow, json!({})).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(record.status, RunStatus::Failed);
        let failure = record.failure.clone().unwrap();
        assert_eq!(failure.step, "always-fails");
        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.error, "nope");
        assert!(record.current_step.is_none());
        assert!(record.completed_steps.is_empty());
        assert_eq!(storage.load(&record.id).await.unwrap().unwrap(), record);
    }

    #[tokio::test]
    async fn test_failed_step_then_successful_retry() {
        let (engine, storage) = engine();
        let api_down = Arc::new(AtomicBool::new(true));
        let step1_runs = counter();
        let workflow = api_workflow(api_down.clone(), step1_runs.clone());

        let failed = engine.execute(&workflow, json!({"order": 42})).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        let failure = failed.failure.clone().unwrap();
        assert_eq!(failure.step, "step-2");
        assert_eq!(failure.attempts, 3);
        assert!(failed.error().unwrap().contains("503 Service Unavailable"));
        assert_eq!(failed.data["step1"], json!("Done"));
        assert!(failed.data.get("apiResult").is_none());

        api_down.store(false, Ordering::SeqCst);
        let retried = engine
            .retry_step(&workflow, failed.id, "step-2")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(retried.id, failed.id);
        assert_eq!(retried.status, RunStatus::Succeeded);
        assert_eq!(retried.data["apiResult"], json!("Success from API"));
        assert_eq!(retried.data["committed"], json!("Success from API"));
        assert_eq!(retried.data["step1"], failed.data["step1"]);
        assert_eq!(retried.data["step1Run"], json!(1));
        assert_eq!(step1_runs.load(Ordering::SeqCst), 1);
        assert!(retried.failure.is_none());

        let names: Vec<&str> = retried.completed_steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["step-1", "step-2", "step-3"]);
        assert_eq!(retried.completed_steps[0], failed.completed_steps[0]);
        assert_eq!(storage.load(&failed.id).await.unwrap().unwrap(), retried);
    }

    #[tokio::test]
    async fn test_retry_that_fails_again_stays_failed() {
        let (engine, _storage) = engine();
        let workflow = api_workflow(Arc::new(AtomicBool::new(true)), counter());

        let failed = engine.execute(&workflow, json!(null)).await.unwrap();
        let again = engine
            .retry_step(&workflow, failed.id, "step-2")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(again.status, RunStatus::Failed);
        assert_eq!(again.failure.as_ref().unwrap().step, "step-2");
        assert_eq!(again.failure.as_ref().unwrap().attempts, 3);
        assert!(again.updated_at >= failed.updated_at);

        // Still retryable
        assert!(engine.retry_step(&workflow, failed.id, "step-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_of_succeeded_run_is_rejected() {
        let (engine, storage) = engine();
        let workflow = api_workflow(Arc::new(AtomicBool::new(false)), counter());

        let record = engine.execute(&workflow, json!({})).await.unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);

        let err = engine.retry_step(&workflow, record.id, "step-2").await.unwrap_err();
        assert!(matches!(
            err,
            FluxError::InvalidState { status: RunStatus::Succeeded, .. }
        ));
        assert_eq!(storage.load(&record.id).await.unwrap().unwrap(), record);
    }

    #[tokio::test]
    async fn test_retry_of_unknown_run_returns_none() {
        let (engine, storage) = engine();
        let workflow = api_workflow(Arc::new(AtomicBool::new(false)), counter());

        let result = engine.retry_step(&workflow, RunId::new(), "step-2").await.unwrap();
        assert!(result.is_none());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_retry_rejects_wrong_step_or_workflow() {
        let (engine, storage) = engine();
        let workflow = api_workflow(Arc::new(AtomicBool::new(true)), counter());
        let failed = engine.execute(&workflow, json!({})).await.unwrap();

        let err = engine.retry_step(&workflow, failed.id, "step-1").await.unwrap_err();
        assert!(matches!(err, FluxError::StepMismatch { ref failed, .. } if failed == "step-2"));

        let other = create_workflow("other")
            .step("step-2", |_ctx| async move { Ok(StepData::new()) })
            .unwrap()
            .build();
        let err = engine.retry_step(&other, failed.id, "step-2").await.unwrap_err();
        assert!(matches!(err, FluxError::WorkflowMismatch { .. }));

        let renamed = create_workflow("api-sync")
            .step("step-1", |_ctx| async move { Ok(StepData::new()) })
            .unwrap()
            .build();
        let err = engine.retry_step(&renamed, failed.id, "step-2").await.unwrap_err();
        assert!(matches!(err, FluxError::UnknownStep { .. }));

        // None of the rejected retries touched the record
        assert_eq!(storage.load(&failed.id).await.unwrap().unwrap(), failed);
    }

    #[tokio::test]
    async fn test_runs_do_not_share_state() {
        let (engine, storage) = engine();
        let workflow = create_workflow("echo")
            .step("echo", |ctx| async move { Ok(StepData::new().with("echo", ctx.input().clone())) })
            .unwrap()
            .build();

        let (a, b) = tokio::join!(
            engine.execute(&workflow, json!("a")),
            engine.execute(&workflow, json!("b"))
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.id, b.id);
        assert_eq!(storage.len().await, 2);
        assert_eq!(storage.load(&a.id).await.unwrap().unwrap().data["echo"], json!("a"));
        assert_eq!(storage.load(&b.id).await.unwrap().unwrap().data["echo"], json!("b"));
        assert_eq!(engine.list_runs().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_the_step() {
        let (engine, _storage) = engine();
        let workflow = create_workflow("slow")
            .step_with("wait", StepOptions::new().retries(1).timeout_ms(100), |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(StepData::new().with("late", true))
            })
            .unwrap()
            .build();

        let record = engine.execute(&workflow, json!({})).await.unwrap();

        assert_eq!(record.status, RunStatus::Failed);
        let failure = record.failure.unwrap();
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.error, "Step timed out after 100 ms");
        assert!(record.data.get("late").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let (engine, _storage) = engine();
        let workflow = create_workflow("backoff")
            .step_with(
                "fails",
                StepOptions::new()
                    .retries(2)
                    .backoff(Backoff::Fixed(Duration::from_secs(1))),
                |_ctx| async move { Err::<StepData, _>(anyhow!("down")) },
            )
            .unwrap()
            .build();

        let started = tokio::time::Instant::now();
        let record = engine.execute(&workflow, json!({})).await.unwrap();

        assert_eq!(record.failure.unwrap().attempts, 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_panicking_step_is_recorded() {
        let (engine, _storage) = engine();
        let workflow = create_workflow("panics")
            .step("boom", |_ctx| async move {
                if true {
                    panic!("index out of range");
                }
                Ok(StepData::new())
            })
            .unwrap()
            .build();

        let record = engine.execute(&workflow, json!({})).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error(), Some("Step panicked: index out of range"));
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Order {
        id: u64,
        sku: String,
    }

    #[tokio::test]
    async fn test_typed_input_survives_retry() {
        let (engine, _storage) = engine();
        let ready = Arc::new(AtomicBool::new(false));
        let gate = ready.clone();

        let workflow = create_workflow("typed")
            .input::<Order>()
            .step("reserve", move |ctx| {
                let gate = gate.clone();
                async move {
                    if !gate.load(Ordering::SeqCst) {
                        return Err(anyhow!("warehouse offline"));
                    }
                    Ok(StepData::new().with("reserved", ctx.input().sku.clone()))
                }
            })
            .unwrap()
            .build();

        let order = Order {
            id: 9,
            sku: "SKU-1".to_string(),
        };
        let failed = engine.execute(&workflow, order).await.unwrap();
        assert_eq!(failed.input, json!({"id": 9, "sku": "SKU-1"}));

        ready.store(true, Ordering::SeqCst);
        let done = engine
            .retry_step(&workflow, failed.id, "reserve")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.data["reserved"], json!("SKU-1"));
    }

    /// Keeps a copy of every record handed to `save`
    #[derive(Default)]
    struct RecordingStorage {
        inner: InMemoryStorage,
        saves: Mutex<Vec<RunRecord>>,
    }

    #[async_trait::async_trait]
    impl StorageBackend for RecordingStorage {
        async fn save(&self, record: &RunRecord) -> anyhow::Result<()> {
            self.saves.lock().unwrap().push(record.clone());
            self.inner.save(record).await
        }

        async fn load(&self, id: &RunId) -> anyhow::Result<Option<RunRecord>> {
            self.inner.load(id).await
        }

        async fn list(&self) -> anyhow::Result<Vec<RunRecord>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_progress_is_persisted_after_every_attempt() {
        let storage = Arc::new(RecordingStorage::default());
        let engine = Engine::new(storage.clone(), Arc::new(NoopLogger));
        let workflow = api_workflow(Arc::new(AtomicBool::new(true)), counter());

        engine.execute(&workflow, json!({})).await.unwrap();

        let saves = storage.saves.lock().unwrap().clone();
        let statuses: Vec<RunStatus> = saves.iter().map(|r| r.status).collect();
        // created, step-1 done, step-2 attempt 1, step-2 attempt 2, failed
        assert_eq!(
            statuses,
            vec![
                RunStatus::Running,
                RunStatus::Running,
                RunStatus::Running,
                RunStatus::Running,
                RunStatus::Failed
            ]
        );
        assert_eq!(saves[2].current_step.as_ref().unwrap().attempts, 1);
        assert_eq!(saves[3].current_step.as_ref().unwrap().attempts, 2);
        assert_eq!(
            saves[3].current_step.as_ref().unwrap().last_error.as_deref(),
            Some("503 Service Unavailable")
        );
    }

    struct BrokenStorage;

    #[async_trait::async_trait]
    impl StorageBackend for BrokenStorage {
        async fn save(&self, _record: &RunRecord) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }

        async fn load(&self, _id: &RunId) -> anyhow::Result<Option<RunRecord>> {
            Err(anyhow!("disk unreadable"))
        }

        async fn list(&self) -> anyhow::Result<Vec<RunRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() {
        let engine = Engine::new(Arc::new(BrokenStorage), Arc::new(NoopLogger));
        let workflow = api_workflow(Arc::new(AtomicBool::new(false)), counter());

        let err = engine.execute(&workflow, json!({})).await.unwrap_err();
        assert!(matches!(err, FluxError::Storage(_)));
        assert_eq!(err.to_string(), "Storage error: disk full");
        assert!(!err.is_usage_error());

        let err = engine.retry_step(&workflow, RunId::new(), "step-2").await.unwrap_err();
        assert!(matches!(err, FluxError::Storage(_)));
    }

    #[tokio::test]
    async fn test_concurrent_retries_of_one_run() {
        let (engine, storage) = engine();
        let ready = Arc::new(AtomicBool::new(false));
        let runs = counter();
        let (gate, r) = (ready.clone(), runs.clone());

        let workflow = create_workflow("single")
            .step("s", move |_ctx| {
                let (gate, r) = (gate.clone(), r.clone());
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    if !gate.load(Ordering::SeqCst) {
                        return Err(anyhow!("not yet"));
                    }
                    Ok(StepData::new().with("done", true))
                }
            })
            .unwrap()
            .build();

        let failed = engine.execute(&workflow, json!({})).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        ready.store(true, Ordering::SeqCst);

        let (a, b) = tokio::join!(
            engine.retry_step(&workflow, failed.id, "s"),
            engine.retry_step(&workflow, failed.id, "s")
        );

        let a = a.unwrap().unwrap();
        assert_eq!(a.status, RunStatus::Succeeded);
        assert!(matches!(
            b.unwrap_err(),
            FluxError::InvalidState { status: RunStatus::Running, .. }
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let stored = storage.load(&failed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.completed_steps.len(), 1);

        // The claim is released once the retry returns
        let err = engine.retry_step(&workflow, failed.id, "s").await.unwrap_err();
        assert!(matches!(
            err,
            FluxError::InvalidState { status: RunStatus::Succeeded, .. }
        ));
    }

    #[test]
    fn test_run_claims_are_exclusive() {
        let (engine, _storage) = engine();
        let id = RunId::new();

        let guard = engine.claim(id).unwrap();
        assert!(engine.claim(id).is_none());
        drop(guard);
        assert!(engine.claim(id).is_some());
    }

    #[tokio::test]
    async fn test_progress_is_logged() {
        let storage = Arc::new(InMemoryStorage::new());
        let logger = Arc::new(MemoryLogger::new());
        let engine = Engine::new(storage, logger.clone());
        let workflow = api_workflow(Arc::new(AtomicBool::new(true)), counter());

        let record = engine.execute(&workflow, Value::Null).await.unwrap();

        let info = logger.messages(LogLevel::Info);
        assert!(info[0].starts_with("Starting workflow execution: workflow=api-sync"));
        assert_eq!(logger.messages(LogLevel::Warn).len(), 2);
        let errors = logger.messages(LogLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains(&record.id.to_string()));
    }
}
