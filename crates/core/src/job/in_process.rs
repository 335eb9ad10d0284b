use super::{JobError, JobHandle, JobManager, JobSpec};
use crate::models::ArtifactResultMetadata;
use crate::storage::{self, Storage, StorageError};
use crate::types::{ErrorDetails, ExecutionState, FailureType, Logs};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// How an operator body ended
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded {
        logs: Option<Logs>,
    },
    Failed {
        failure_type: FailureType,
        error: ErrorDetails,
        logs: Option<Logs>,
    },
    Canceled,
}

impl JobOutcome {
    pub fn succeeded() -> Self {
        Self::Succeeded { logs: None }
    }

    pub fn failed(failure_type: FailureType, context: impl Into<String>) -> Self {
        Self::Failed {
            failure_type,
            error: ErrorDetails::new(context, ""),
            logs: None,
        }
    }
}

/// What an in-process body sees of its job
pub struct JobContext {
    pub spec: JobSpec,
    pub storage: Arc<dyn Storage>,
}

impl JobContext {
    pub async fn read_input(&self, idx: usize) -> Result<Bytes, StorageError> {
        let key = self
            .spec
            .input_content_paths
            .get(idx)
            .ok_or_else(|| StorageError::InvalidKey(format!("input {}", idx)))?;
        self.storage.get(key).await
    }

    pub async fn write_output(
        &self,
        idx: usize,
        content: impl Into<Bytes>,
        metadata: &ArtifactResultMetadata,
    ) -> Result<(), StorageError> {
        let (Some(content_path), Some(metadata_path)) = (
            self.spec.output_content_paths.get(idx),
            self.spec.output_metadata_paths.get(idx),
        ) else {
            return Err(StorageError::InvalidKey(format!("output {}", idx)));
        };
        self.storage.put(content_path, content.into()).await?;
        let metadata = serde_json::to_vec(metadata)
            .map_err(|e| StorageError::Config(format!("unserializable metadata: {}", e)))?;
        self.storage.put(metadata_path, Bytes::from(metadata)).await
    }
}

/// An operator body run on the local tokio runtime
#[async_trait::async_trait]
pub trait JobBody: Send + Sync {
    async fn run(&self, ctx: JobContext) -> JobOutcome;
}

struct RunningJob {
    state: Arc<Mutex<ExecutionState>>,
    /// Aborts the body, which the supervising task records as canceled
    body: tokio::task::AbortHandle,
}

/// Runs registered bodies on tokio tasks, keyed by operator name
#[derive(Default)]
pub struct InProcessJobManager {
    bodies: RwLock<HashMap<String, Arc<dyn JobBody>>>,
    jobs: Mutex<HashMap<String, RunningJob>>,
}

impl InProcessJobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Body run for every operator named `operator_name`
    pub fn register(&self, operator_name: impl Into<String>, body: Arc<dyn JobBody>) {
        self.bodies.write().insert(operator_name.into(), body);
    }

    fn body(&self, operator_name: &str) -> Option<Arc<dyn JobBody>> {
        self.bodies.read().get(operator_name).cloned()
    }
}

fn finish_state(state: &mut ExecutionState, outcome: JobOutcome) {
    let now = Utc::now();
    match outcome {
        JobOutcome::Succeeded { logs } => {
            state.user_logs = logs;
            state.succeed(now);
        }
        JobOutcome::Failed {
            failure_type,
            error,
            logs,
        } => {
            state.user_logs = logs;
            state.fail(failure_type, error, now);
        }
        JobOutcome::Canceled => state.cancel(now),
    }
}

#[async_trait::async_trait]
impl JobManager for InProcessJobManager {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn launch(&self, spec: &JobSpec) -> Result<JobHandle, JobError> {
        let body = self.body(&spec.operator_name).ok_or_else(|| {
            JobError::launch(
                &spec.name,
                format!("no body registered for operator {}", spec.operator_name),
            )
        })?;
        let storage = storage::open(&spec.storage_config).map_err(|e| JobError::launch(&spec.name, e))?;

        let now = Utc::now();
        let mut running = ExecutionState::registered(now);
        running.start(now);
        let state = Arc::new(Mutex::new(running));

        let ctx = JobContext {
            spec: spec.clone(),
            storage,
        };
        let slot = state.clone();
        let name = spec.name.clone();
        // A separate body task isolates panics and can be aborted alone.
        let run = tokio::spawn(async move { body.run(ctx).await });
        let abort = run.abort_handle();
        tokio::spawn(async move {
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => JobOutcome::Canceled,
                Err(e) => {
                    tracing::error!("Job {} panicked: {}", name, e);
                    JobOutcome::Failed {
                        failure_type: FailureType::System,
                        error: ErrorDetails::internal(format!("Job {} panicked", name)),
                        logs: None,
                    }
                }
            };
            finish_state(&mut slot.lock(), outcome);
        });

        self.jobs
            .lock()
            .insert(spec.name.clone(), RunningJob { state, body: abort });
        tracing::debug!("Launched in-process job {}", spec.name);
        Ok(JobHandle(spec.name.clone()))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<ExecutionState, JobError> {
        let jobs = self.jobs.lock();
        let job = jobs
            .get(&handle.0)
            .ok_or_else(|| JobError::NotFound(handle.0.clone()))?;
        let state = job.state.lock().clone();
        Ok(state)
    }

    async fn finish(&self, handle: &JobHandle) -> Result<(), JobError> {
        let job = self
            .jobs
            .lock()
            .remove(&handle.0)
            .ok_or_else(|| JobError::NotFound(handle.0.clone()))?;
        if !job.state.lock().is_terminal() {
            tracing::info!("Job {} is still running, leaving it to finish", handle);
        }
        Ok(())
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), JobError> {
        let jobs = self.jobs.lock();
        let job = jobs
            .get(&handle.0)
            .ok_or_else(|| JobError::NotFound(handle.0.clone()))?;
        if !job.state.lock().is_terminal() {
            job.body.abort();
            tracing::info!("Canceled job {}", handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineConfig, FunctionSpec, OperatorSpec};
    use crate::storage::StorageConfig;
    use crate::types::ExecutionStatus;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Echo;

    #[async_trait::async_trait]
    impl JobBody for Echo {
        async fn run(&self, ctx: JobContext) -> JobOutcome {
            match ctx.write_output(0, "42", &ArtifactResultMetadata::default()).await {
                Ok(()) => JobOutcome::succeeded(),
                Err(e) => JobOutcome::failed(FailureType::System, e.to_string()),
            }
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl JobBody for Panics {
        async fn run(&self, _ctx: JobContext) -> JobOutcome {
            panic!("boom")
        }
    }

    /// Sleeps, then records that it got to the end.
    #[derive(Default)]
    struct Slow(std::sync::atomic::AtomicBool);

    #[async_trait::async_trait]
    impl JobBody for Slow {
        async fn run(&self, _ctx: JobContext) -> JobOutcome {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            JobOutcome::succeeded()
        }
    }

    fn spec(dir: &TempDir, operator_name: &str) -> JobSpec {
        JobSpec {
            name: format!("job-{}", Uuid::new_v4()),
            operator_id: Uuid::new_v4(),
            operator_name: operator_name.to_string(),
            spec: OperatorSpec::Function {
                function: FunctionSpec::file("code.zip"),
            },
            storage_config: StorageConfig::file(dir.path()),
            input_content_paths: vec![],
            input_metadata_paths: vec![],
            output_content_paths: vec!["out".to_string()],
            output_metadata_paths: vec!["out-meta".to_string()],
            exec_state_path: "state".to_string(),
            engine: EngineConfig::default(),
            resources: None,
        }
    }

    async fn wait_terminal(manager: &InProcessJobManager, handle: &JobHandle) -> ExecutionState {
        for _ in 0..200 {
            let state = manager.poll(handle).await.unwrap();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never finished", handle);
    }

    #[tokio::test]
    async fn test_body_writes_outputs_and_succeeds() {
        let dir = TempDir::new().unwrap();
        let manager = InProcessJobManager::new();
        manager.register("echo", Arc::new(Echo));

        let handle = manager.launch(&spec(&dir, "echo")).await.unwrap();
        let state = wait_terminal(&manager, &handle).await;
        assert_eq!(state.status, ExecutionStatus::Succeeded);
        assert!(state.timestamps.running_at.is_some());
        assert!(state.is_consistent());
        assert_eq!(std::fs::read(dir.path().join("out")).unwrap(), b"42");

        manager.finish(&handle).await.unwrap();
        assert!(matches!(manager.poll(&handle).await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unregistered_body_fails_launch() {
        let dir = TempDir::new().unwrap();
        let manager = InProcessJobManager::new();
        let err = manager.launch(&spec(&dir, "missing")).await.unwrap_err();
        assert!(matches!(err, JobError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_panicking_body_is_a_system_failure() {
        let dir = TempDir::new().unwrap();
        let manager = InProcessJobManager::new();
        manager.register("panics", Arc::new(Panics));

        let handle = manager.launch(&spec(&dir, "panics")).await.unwrap();
        let state = wait_terminal(&manager, &handle).await;
        assert_eq!(state.failure_type, Some(FailureType::System));
    }

    #[tokio::test]
    async fn test_finish_leaves_running_body_alive() {
        let dir = TempDir::new().unwrap();
        let manager = InProcessJobManager::new();
        let body = Arc::new(Slow::default());
        manager.register("slow", body.clone());

        let handle = manager.launch(&spec(&dir, "slow")).await.unwrap();
        manager.finish(&handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(body.0.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_aborts_body() {
        let dir = TempDir::new().unwrap();
        let manager = InProcessJobManager::new();
        let body = Arc::new(Slow::default());
        manager.register("slow", body.clone());

        let handle = manager.launch(&spec(&dir, "slow")).await.unwrap();
        manager.cancel(&handle).await.unwrap();
        let state = wait_terminal(&manager, &handle).await;
        assert_eq!(state.status, ExecutionStatus::Canceled);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!body.0.load(std::sync::atomic::Ordering::SeqCst));
    }
}
