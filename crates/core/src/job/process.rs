use super::{JobError, JobHandle, JobManager, JobSpec};
use crate::storage::{self, Storage};
use crate::types::{ErrorDetails, ExecutionState, FailureType};
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::process::{Child, Command};

struct ProcessJob {
    child: Child,
    started_at: DateTime<Utc>,
    storage: Arc<dyn Storage>,
    exec_state_path: String,
    /// Final state once read back after exit
    finished: Option<ExecutionState>,
    canceled: bool,
}

/// Runs each job as a local subprocess.
///
/// The program is invoked as `<program> <args..> --spec <base64(JSON(JobSpec))>`
/// and must write its final `ExecutionState` as JSON to the spec's
/// `exec_state_path` in storage before exiting.
pub struct ProcessJobManager {
    program: PathBuf,
    args: Vec<String>,
    jobs: Mutex<HashMap<String, ProcessJob>>,
}

impl ProcessJobManager {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn encode_spec(spec: &JobSpec) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(spec)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Inverse of [`encode_spec`](Self::encode_spec), for job programs.
    pub fn decode_spec(encoded: &str) -> anyhow::Result<JobSpec> {
        let json = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// State of a job whose process exited, read from where the job left it.
async fn read_final_state(
    storage: &dyn Storage,
    path: &str,
    status: ExitStatus,
) -> Result<ExecutionState, JobError> {
    match storage.get(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|e| JobError::poll(path, format!("unreadable execution state: {}", e))),
        Err(e) if e.is_not_found() => Ok(ExecutionState::failed(
            FailureType::System,
            ErrorDetails::internal(format!(
                "Job process exited with {} without reporting a state",
                status
            )),
            Utc::now(),
        )),
        Err(e) => Err(JobError::poll(path, e)),
    }
}

#[async_trait::async_trait]
impl JobManager for ProcessJobManager {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &JobSpec) -> Result<JobHandle, JobError> {
        let encoded = Self::encode_spec(spec).map_err(|e| JobError::launch(&spec.name, e))?;
        let storage = storage::open(&spec.storage_config).map_err(|e| JobError::launch(&spec.name, e))?;
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--spec")
            .arg(encoded)
            .spawn()
            .map_err(|e| JobError::launch(&spec.name, format!("{}: {}", self.program.display(), e)))?;

        tracing::info!(
            "Launched job {} as process {}",
            spec.name,
            child.id().unwrap_or_default()
        );
        self.jobs.lock().insert(
            spec.name.clone(),
            ProcessJob {
                child,
                started_at: Utc::now(),
                storage,
                exec_state_path: spec.exec_state_path.clone(),
                finished: None,
                canceled: false,
            },
        );
        Ok(JobHandle(spec.name.clone()))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<ExecutionState, JobError> {
        let (exit, storage, path) = {
            let mut jobs = self.jobs.lock();
            let job = jobs
                .get_mut(&handle.0)
                .ok_or_else(|| JobError::NotFound(handle.0.clone()))?;
            if let Some(state) = &job.finished {
                return Ok(state.clone());
            }
            match job.child.try_wait() {
                Ok(None) => {
                    let mut state = ExecutionState::registered(job.started_at);
                    state.start(job.started_at);
                    return Ok(state);
                }
                Ok(Some(_)) if job.canceled => {
                    let mut state = ExecutionState::registered(job.started_at);
                    state.cancel(Utc::now());
                    job.finished = Some(state.clone());
                    return Ok(state);
                }
                Ok(Some(exit)) => (exit, job.storage.clone(), job.exec_state_path.clone()),
                Err(e) => return Err(JobError::poll(&handle.0, e)),
            }
        };

        let state = read_final_state(storage.as_ref(), &path, exit).await?;
        if let Some(job) = self.jobs.lock().get_mut(&handle.0) {
            job.finished = Some(state.clone());
        }
        Ok(state)
    }

    async fn finish(&self, handle: &JobHandle) -> Result<(), JobError> {
        let mut job = self
            .jobs
            .lock()
            .remove(&handle.0)
            .ok_or_else(|| JobError::NotFound(handle.0.clone()))?;
        if job.finished.is_some() || !matches!(job.child.try_wait(), Ok(None)) {
            return Ok(());
        }
        // Still running: reap it in the background once it exits.
        tracing::info!("Job {} is still running, leaving it to finish", handle);
        let name = handle.0.clone();
        tokio::spawn(async move {
            match job.child.wait().await {
                Ok(status) => tracing::debug!("Detached job {} exited with {}", name, status),
                Err(e) => tracing::warn!("Failed to wait for detached job {}: {}", name, e),
            }
        });
        Ok(())
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&handle.0)
            .ok_or_else(|| JobError::NotFound(handle.0.clone()))?;
        if job.finished.is_some() {
            return Ok(());
        }
        job.canceled = true;
        if let Err(e) = job.child.start_kill() {
            tracing::debug!("Job {} already gone: {}", handle, e);
        }
        tracing::info!("Canceled job {}", handle);
        Ok(())
    }
}
