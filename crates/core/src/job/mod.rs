//! Launching operator bodies as opaque jobs.
//!
//! A [`JobManager`] runs one operator body per [`JobSpec`] and reports its
//! [`ExecutionState`]. The executor only ever sees this trait; which backend
//! serves an operator is decided by [`JobManagers::select`] from the
//! operator's engine config.

mod in_process;
mod process;

pub use in_process::{InProcessJobManager, JobBody, JobContext, JobOutcome};
pub use process::ProcessJobManager;

use crate::models::{EngineConfig, EngineType, OperatorSpec, ResourceConfig};
use crate::storage::StorageConfig;
use crate::types::ExecutionState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Failed to launch job {name}: {reason}")]
    Launch { name: String, reason: String },

    #[error("Failed to poll job {name}: {reason}")]
    Poll { name: String, reason: String },

    #[error("Engine {0} is not supported by this deployment")]
    UnsupportedEngine(EngineType),
}

impl JobError {
    pub fn launch(name: &str, reason: impl fmt::Display) -> Self {
        Self::Launch {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn poll(name: &str, reason: impl fmt::Display) -> Self {
        Self::Poll {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Everything a backend needs to run one operator body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique per operator per run
    pub name: String,
    pub operator_id: Uuid,
    pub operator_name: String,
    pub spec: OperatorSpec,
    pub storage_config: StorageConfig,
    /// Content and metadata paths of the input artifacts, in input order
    pub input_content_paths: Vec<String>,
    pub input_metadata_paths: Vec<String>,
    /// Paths the job writes its outputs to, in output order
    pub output_content_paths: Vec<String>,
    pub output_metadata_paths: Vec<String>,
    /// Where backends that cannot report in memory leave the final state
    pub exec_state_path: String,
    pub engine: EngineConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceConfig>,
}

/// Identifies a launched job to the manager that launched it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One execution backend
#[async_trait::async_trait]
pub trait JobManager: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Dispatch the job. Returns once the job is handed to the backend.
    async fn launch(&self, spec: &JobSpec) -> Result<JobHandle, JobError>;

    /// Current state of a launched job.
    async fn poll(&self, handle: &JobHandle) -> Result<ExecutionState, JobError>;

    /// Release whatever the backend keeps for the job. A job still running
    /// is left to run to completion.
    async fn finish(&self, handle: &JobHandle) -> Result<(), JobError>;

    /// Stop a job that is still running. Terminal jobs are unaffected.
    async fn cancel(&self, handle: &JobHandle) -> Result<(), JobError>;
}

/// Routes operators to a backend by engine
#[derive(Clone)]
pub struct JobManagers {
    local: Arc<dyn JobManager>,
}

impl JobManagers {
    /// `local` serves the `aqueduct` engine. Cluster engines have no backend
    /// in this build.
    pub fn new(local: Arc<dyn JobManager>) -> Self {
        Self { local }
    }

    pub fn select(&self, engine: &EngineConfig) -> Result<Arc<dyn JobManager>, JobError> {
        match engine {
            EngineConfig::Aqueduct { .. } => Ok(self.local.clone()),
            other => Err(JobError::UnsupportedEngine(other.engine_type())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FunctionSpec, IntegrationEngineConfig};

    #[test]
    fn test_cluster_engines_unsupported() {
        let managers = JobManagers::new(Arc::new(InProcessJobManager::new()));
        assert_eq!(managers.select(&EngineConfig::default()).unwrap().name(), "in_process");

        let lambda = EngineConfig::Lambda {
            lambda_config: IntegrationEngineConfig {
                integration_id: Uuid::new_v4(),
            },
        };
        match managers.select(&lambda) {
            Err(JobError::UnsupportedEngine(EngineType::Lambda)) => {}
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("lambda should be unsupported"),
        }
    }

    #[test]
    fn test_job_spec_wire_shape() {
        let spec = JobSpec {
            name: "op-1".to_string(),
            operator_id: Uuid::new_v4(),
            operator_name: "extract".to_string(),
            spec: OperatorSpec::Function {
                function: FunctionSpec::file("code/op.zip"),
            },
            storage_config: StorageConfig::file("/tmp/aq"),
            input_content_paths: vec![],
            input_metadata_paths: vec![],
            output_content_paths: vec!["out".to_string()],
            output_metadata_paths: vec!["out-meta".to_string()],
            exec_state_path: "state".to_string(),
            engine: EngineConfig::default(),
            resources: None,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["spec"]["type"], "function");
        assert_eq!(value["engine"]["type"], "aqueduct");
        assert!(value.get("resources").is_none());
    }
}
