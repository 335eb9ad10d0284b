use super::artifact::RunArtifact;
use crate::catalog::OperatorResultRepository;
use crate::database::Database;
use crate::job::{JobHandle, JobManager, JobManagers, JobSpec};
use crate::models::{
    ArtifactResult, ArtifactResultMetadata, Dag, EngineConfig, OperatorNode, OperatorResult,
    OperatorSpec, ParamSpec,
};
use crate::storage::{Storage, StorageError};
use crate::types::{
    ArtifactType, CheckLevel, ErrorDetails, ExecutionState, ExecutionStatus, FailureType,
    SerializationType,
};
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What an operator needs from its run
pub(crate) struct RunContext<'a> {
    pub dag: &'a Dag,
    pub dag_result_id: Uuid,
    pub storage: &'a dyn Storage,
    pub jobs: &'a JobManagers,
    pub artifacts: &'a HashMap<Uuid, RunArtifact>,
    pub parameters: &'a HashMap<String, String>,
}

/// Why persisting a terminal operator failed
#[derive(Debug, thiserror::Error)]
pub(crate) enum PersistError {
    #[error(transparent)]
    Catalog(#[from] crate::database::DbError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Unknown artifact {0}")]
    UnknownArtifact(Uuid),
}

/// An operator within one run, driving its own state machine
pub(crate) struct RunOperator {
    pub node: OperatorNode,
    pub state: ExecutionState,
    engine: EngineConfig,
    job: Option<(Arc<dyn JobManager>, JobHandle)>,
    launched: bool,
    /// The job itself reported a terminal state
    job_done: bool,
    exec_state_path: String,
    pub persisted: bool,
}

impl RunOperator {
    pub fn new(node: OperatorNode, dag_engine: &EngineConfig) -> Self {
        let engine = node
            .operator
            .engine_config
            .clone()
            .unwrap_or_else(|| dag_engine.clone());
        Self {
            node,
            state: ExecutionState::registered(Utc::now()),
            engine,
            job: None,
            launched: false,
            job_done: false,
            exec_state_path: format!("exec-state-{}", Uuid::new_v4()),
            persisted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.node.operator.name
    }

    /// Advance by one poll: launch when never dispatched, otherwise observe
    /// the job.
    pub async fn refresh(&mut self, ctx: &RunContext<'_>) -> ExecutionStatus {
        if self.state.is_terminal() {
            return self.state.status;
        }
        if !self.launched {
            self.launched = true;
            self.launch(ctx).await;
        } else {
            self.observe(ctx).await;
        }
        self.state.status
    }

    /// Poll an already launched job without ever launching one.
    pub async fn observe(&mut self, ctx: &RunContext<'_>) -> ExecutionStatus {
        if self.state.is_terminal() {
            return self.state.status;
        }
        let Some((manager, handle)) = self.job.clone() else {
            return self.state.status;
        };
        match manager.poll(&handle).await {
            Ok(mut state) => {
                if !state.is_consistent() {
                    tracing::warn!(
                        "Job of operator {} reported an inconsistent {} state",
                        self.name(),
                        state.status
                    );
                    state.repair(Utc::now());
                }
                if state.is_terminal() {
                    self.job_done = true;
                    self.state = self.evaluate_check(ctx, state).await;
                } else {
                    self.state = state;
                }
            }
            Err(e) => self.fail_system(format!("Failed to poll operator {}: {}", self.name(), e)),
        }
        self.state.status
    }

    fn fail_system(&mut self, context: String) {
        tracing::error!("{}", context);
        self.state
            .fail(FailureType::System, ErrorDetails::internal(context), Utc::now());
    }

    async fn launch(&mut self, ctx: &RunContext<'_>) {
        tracing::info!("Launching operator {} ({})", self.name(), self.node.operator.spec.operator_type());
        match self.node.operator.spec.clone() {
            OperatorSpec::Param { param } => self.evaluate_param(ctx, &param).await,
            OperatorSpec::SystemMetric { system_metric } => {
                self.evaluate_system_metric(ctx, &system_metric.metric_name).await
            }
            _ => {
                let manager = match ctx.jobs.select(&self.engine) {
                    Ok(manager) => manager,
                    Err(e) => return self.fail_system(format!("Cannot run operator {}: {}", self.name(), e)),
                };
                let spec = match self.job_spec(ctx) {
                    Some(spec) => spec,
                    None => {
                        return self.fail_system(format!(
                            "Operator {} references an artifact outside its DAG",
                            self.name()
                        ))
                    }
                };
                match manager.launch(&spec).await {
                    Ok(handle) => {
                        self.state.timestamps.pending_at = Some(Utc::now());
                        self.job = Some((manager, handle));
                    }
                    Err(e) => self.fail_system(format!("Failed to launch operator {}: {}", self.name(), e)),
                }
            }
        }
    }

    fn paths(
        ctx: &RunContext<'_>,
        ids: &[Uuid],
    ) -> Option<(Vec<String>, Vec<String>)> {
        let mut content = Vec::with_capacity(ids.len());
        let mut metadata = Vec::with_capacity(ids.len());
        for id in ids {
            let artifact = ctx.artifacts.get(id)?;
            content.push(artifact.content_path.clone());
            metadata.push(artifact.metadata_path.clone());
        }
        Some((content, metadata))
    }

    fn job_spec(&self, ctx: &RunContext<'_>) -> Option<JobSpec> {
        let (input_content_paths, input_metadata_paths) = Self::paths(ctx, &self.node.inputs)?;
        let (output_content_paths, output_metadata_paths) = Self::paths(ctx, &self.node.outputs)?;
        Some(JobSpec {
            name: format!("{}-{}", ctx.dag_result_id, self.node.operator.id),
            operator_id: self.node.operator.id,
            operator_name: self.node.operator.name.clone(),
            spec: self.node.operator.spec.clone(),
            storage_config: ctx.dag.storage_config.clone(),
            input_content_paths,
            input_metadata_paths,
            output_content_paths,
            output_metadata_paths,
            exec_state_path: self.exec_state_path.clone(),
            engine: self.engine.clone(),
            resources: self.node.operator.resources.clone(),
        })
    }

    async fn write_outputs(
        &self,
        ctx: &RunContext<'_>,
        content: Bytes,
        metadata: &ArtifactResultMetadata,
    ) -> Result<(), String> {
        let metadata = serde_json::to_vec(metadata).map_err(|e| e.to_string())?;
        for id in &self.node.outputs {
            let artifact = ctx
                .artifacts
                .get(id)
                .ok_or_else(|| format!("unknown output artifact {}", id))?;
            ctx.storage
                .put(&artifact.content_path, content.clone())
                .await
                .map_err(|e| e.to_string())?;
            ctx.storage
                .put(&artifact.metadata_path, Bytes::from(metadata.clone()))
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Parameters are written straight to their outputs. A binding passed to
    /// the run overrides the registered default.
    async fn evaluate_param(&mut self, ctx: &RunContext<'_>, param: &ParamSpec) {
        let now = Utc::now();
        self.state.start(now);
        let raw = ctx
            .parameters
            .get(self.name())
            .cloned()
            .unwrap_or_else(|| param.val.clone());
        let content = match param.serialization_type {
            Some(kind) if kind.is_binary() => {
                match base64::engine::general_purpose::STANDARD.decode(raw.as_bytes()) {
                    Ok(decoded) => Bytes::from(decoded),
                    Err(e) => {
                        let error = ErrorDetails::new(
                            format!("Parameter {} is not valid base64: {}", self.name(), e),
                            "Binary parameter values must be base64-encoded.",
                        );
                        return self.state.fail(FailureType::UserFatal, error, Utc::now());
                    }
                }
            }
            _ => Bytes::from(raw),
        };
        let metadata = ArtifactResultMetadata {
            serialization_type: Some(param.serialization_type.unwrap_or(SerializationType::Json)),
            ..Default::default()
        };
        match self.write_outputs(ctx, content, &metadata).await {
            Ok(()) => self.state.succeed(Utc::now()),
            Err(e) => self.fail_system(format!("Failed to write parameter {}: {}", self.name(), e)),
        }
    }

    /// System metrics read a value the upstream job reported in its
    /// artifact's system metadata.
    async fn evaluate_system_metric(&mut self, ctx: &RunContext<'_>, metric_name: &str) {
        self.state.start(Utc::now());
        let upstream = match self.node.inputs.first().and_then(|id| ctx.artifacts.get(id)) {
            Some(artifact) => artifact,
            None => {
                return self.fail_system(format!("System metric {} has no input", self.name()));
            }
        };
        let value = match upstream.metadata(ctx.storage).await {
            Ok(Some(metadata)) => metadata.system_metadata.get(metric_name).cloned(),
            Ok(None) => None,
            Err(e) => {
                return self.fail_system(format!("Failed to read system metadata: {}", e));
            }
        };
        let Some(value) = value else {
            return self.fail_system(format!(
                "Upstream of {} did not report system metric {}",
                self.name(),
                metric_name
            ));
        };
        let metadata = ArtifactResultMetadata {
            serialization_type: Some(SerializationType::Json),
            artifact_type: Some(ArtifactType::Numeric),
            ..Default::default()
        };
        match self.write_outputs(ctx, Bytes::from(value), &metadata).await {
            Ok(()) => self.state.succeed(Utc::now()),
            Err(e) => self.fail_system(format!("Failed to write system metric {}: {}", self.name(), e)),
        }
    }

    /// A check job succeeds whenever it ran; whether the check passed is the
    /// boolean it wrote. Failed checks fail the operator at the check's level.
    async fn evaluate_check(&self, ctx: &RunContext<'_>, mut state: ExecutionState) -> ExecutionState {
        let Some(level) = self.node.operator.spec.check_level() else {
            return state;
        };
        if state.status != ExecutionStatus::Succeeded {
            return state;
        }
        let Some(output) = self.node.outputs.first().and_then(|id| ctx.artifacts.get(id)) else {
            return state;
        };
        let passed = match ctx.storage.get(&output.content_path).await {
            Ok(raw) => serde_json::from_slice::<bool>(&raw).ok(),
            Err(_) => None,
        };
        let now = state.timestamps.finished_at.unwrap_or_else(Utc::now);
        match passed {
            Some(true) => {}
            Some(false) => {
                let failure_type = match level {
                    CheckLevel::Warning => FailureType::UserNonFatal,
                    CheckLevel::Error => FailureType::UserFatal,
                };
                state.fail(
                    failure_type,
                    ErrorDetails::new(
                        format!("Check {} did not pass", self.name()),
                        "Inspect the check's input to see which rows failed.",
                    ),
                    now,
                );
            }
            None => state.fail(
                FailureType::System,
                ErrorDetails::internal(format!("Check {} did not write a boolean", self.name())),
                now,
            ),
        }
        state
    }

    /// The `(failure_type, error)` of a failure that must stop the run.
    pub fn blocking_failure(&self) -> Option<(FailureType, ErrorDetails)> {
        if self.state.status != ExecutionStatus::Failed {
            return None;
        }
        let kind = self.state.failure_type.unwrap_or(FailureType::System);
        kind.stops_run()
            .then(|| (kind, self.state.error.clone().unwrap_or_default()))
    }

    /// Write the operator's result and one result per output artifact.
    /// `db` is `None` in preview, where results are only returned.
    pub async fn persist(
        &mut self,
        ctx: &RunContext<'_>,
        db: Option<&dyn Database>,
    ) -> Result<(OperatorResult, Vec<ArtifactResult>), PersistError> {
        let registered_at = self.state.timestamps.registered_at.unwrap_or_else(Utc::now);
        let finished_at = self.state.timestamps.finished_at.unwrap_or_else(Utc::now);

        let mut outputs = Vec::with_capacity(self.node.outputs.len());
        for id in &self.node.outputs {
            let artifact = ctx.artifacts.get(id).ok_or(PersistError::UnknownArtifact(*id))?;
            let state = artifact
                .produced_state(ctx.storage, registered_at, finished_at)
                .await?;
            let metadata = artifact.metadata(ctx.storage).await?;
            outputs.push((artifact, state, metadata));
        }

        let results = match db {
            Some(db) => {
                let txn = db.begin_transaction()?;
                let operator_result = OperatorResultRepository::create(
                    &txn,
                    ctx.dag_result_id,
                    self.node.operator.id,
                    Some(&self.state),
                )?;
                let mut artifact_results = Vec::with_capacity(outputs.len());
                for (artifact, state, metadata) in &outputs {
                    artifact_results.push(artifact.persist(
                        &txn,
                        ctx.dag_result_id,
                        state,
                        metadata.as_ref(),
                    )?);
                }
                txn.commit()?;
                (operator_result, artifact_results)
            }
            None => (
                OperatorResult {
                    id: Uuid::new_v4(),
                    dag_result_id: ctx.dag_result_id,
                    operator_id: self.node.operator.id,
                    exec_state: Some(self.state.clone()),
                },
                outputs
                    .iter()
                    .map(|(artifact, state, metadata)| {
                        artifact.preview(ctx.dag_result_id, state, metadata.as_ref())
                    })
                    .collect(),
            ),
        };
        self.persisted = true;
        tracing::debug!("Persisted result of operator {} ({})", self.name(), self.state.status);
        Ok(results)
    }

    /// Release the job and remove per-run scratch objects. Best effort.
    /// A job still running is stopped only when `stop_job` is set.
    pub async fn finish(&mut self, ctx: &RunContext<'_>, stop_job: bool) {
        if let Some((manager, handle)) = self.job.take() {
            if stop_job && !self.job_done {
                if let Err(e) = manager.cancel(&handle).await {
                    tracing::warn!("Failed to cancel job of operator {}: {}", self.name(), e);
                }
            }
            if let Err(e) = manager.finish(&handle).await {
                tracing::warn!("Failed to finish job of operator {}: {}", self.name(), e);
            }
        }
        let mut scratch = vec![self.exec_state_path.clone()];
        scratch.extend(
            self.node
                .outputs
                .iter()
                .filter_map(|id| ctx.artifacts.get(id))
                .map(|a| a.metadata_path.clone()),
        );
        for key in scratch {
            match ctx.storage.delete(&key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!("Failed to remove {} for operator {}: {}", key, self.name(), e),
            }
        }
    }
}
