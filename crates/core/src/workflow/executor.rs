use super::artifact::RunArtifact;
use super::dag::{DagGraph, DagValidationError};
use super::operator::{PersistError, RunContext, RunOperator};
use crate::catalog::{
    ArtifactRepository, DagRepository, DagResultRepository, EdgeRepository, OperatorRepository,
};
use crate::database::{Database, DbError};
use crate::job::{JobError, JobManagers};
use crate::models::{
    Artifact, ArtifactResult, DagResult, EngineConfig, Operator, OperatorNode, OperatorResult,
    OperatorSpec,
};
use crate::storage::{self, StorageError};
use crate::types::{ErrorDetails, ExecutionState, ExecutionStatus, FailureType, TIP_TIMEOUT};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Timing knobs of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AqueductTimeConfig {
    pub operator_poll_interval: Duration,
    /// Bounds the whole run
    pub exec_timeout: Duration,
    /// Bounds the drain of in-flight operators after the run stops
    pub cleanup_timeout: Duration,
}

impl Default for AqueductTimeConfig {
    fn default() -> Self {
        Self {
            operator_poll_interval: Duration::from_millis(500),
            exec_timeout: Duration::from_secs(24 * 60 * 60),
            cleanup_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("No initial operators to run")]
    NoInitialOperators,

    #[error("Run exceeded its execution timeout of {0:?}")]
    Timeout(Duration),

    #[error("Operator {operator} failed with a system error: {}", .error.context)]
    OpExecSystemFailure { operator: String, error: ErrorDetails },

    #[error("Operator {operator} failed: {}", .error.context)]
    OpExecBlockingUserFailure { operator: String, error: ErrorDetails },

    #[error("Run was canceled")]
    Canceled,

    #[error("Internal executor error: {0}")]
    Internal(String),

    #[error("Invalid DAG: {0}")]
    Validation(#[from] DagValidationError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl ExecError {
    /// How this error is recorded on the run's execution state.
    pub fn failure(&self) -> (FailureType, ErrorDetails) {
        match self {
            Self::OpExecSystemFailure { error, .. } => (FailureType::System, error.clone()),
            Self::OpExecBlockingUserFailure { error, .. } => (FailureType::UserFatal, error.clone()),
            Self::Timeout(_) => (FailureType::System, ErrorDetails::new(self.to_string(), TIP_TIMEOUT)),
            other => (FailureType::System, ErrorDetails::internal(other.to_string())),
        }
    }
}

impl From<PersistError> for ExecError {
    fn from(e: PersistError) -> Self {
        match e {
            PersistError::Catalog(e) => Self::Catalog(e),
            PersistError::Storage(e) => Self::Storage(e),
            PersistError::UnknownArtifact(id) => Self::Internal(format!("unknown artifact {}", id)),
        }
    }
}

/// Everything one run produced. In preview none of it is in the catalog.
#[derive(Debug)]
pub struct RunOutcome {
    pub dag_result: DagResult,
    /// In the order operators reached a terminal state
    pub operator_results: Vec<OperatorResult>,
    pub artifact_results: Vec<ArtifactResult>,
    /// Why the run did not succeed
    pub error: Option<ExecError>,
}

impl RunOutcome {
    pub fn status(&self) -> ExecutionStatus {
        self.dag_result.exec_state.status
    }

    pub fn operator_result(&self, operator_id: Uuid) -> Option<&OperatorResult> {
        self.operator_results.iter().find(|r| r.operator_id == operator_id)
    }
}

/// Per-run scheduler state. Owned by one run and never shared.
struct Scheduler {
    operators: HashMap<Uuid, RunOperator>,
    /// Registration order, for stable iteration
    order: Vec<Uuid>,
    dep_count: HashMap<Uuid, usize>,
    ready: Vec<Uuid>,
    in_progress: BTreeSet<Uuid>,
    completed: HashSet<Uuid>,
    operator_results: Vec<OperatorResult>,
    artifact_results: Vec<ArtifactResult>,
}

impl Scheduler {
    fn new(nodes: Vec<OperatorNode>, engine: &EngineConfig) -> Self {
        let mut operators = HashMap::new();
        let mut order = Vec::with_capacity(nodes.len());
        let mut dep_count = HashMap::new();
        let mut ready = Vec::new();
        for node in nodes {
            let id = node.operator.id;
            if node.inputs.is_empty() {
                ready.push(id);
            }
            dep_count.insert(id, node.inputs.len());
            order.push(id);
            operators.insert(id, RunOperator::new(node, engine));
        }
        Self {
            operators,
            order,
            dep_count,
            ready,
            in_progress: BTreeSet::new(),
            completed: HashSet::new(),
            operator_results: Vec::new(),
            artifact_results: Vec::new(),
        }
    }

    fn operator(&mut self, id: Uuid) -> Result<&mut RunOperator, ExecError> {
        self.operators
            .get_mut(&id)
            .ok_or_else(|| ExecError::Internal(format!("unknown operator {}", id)))
    }

    async fn persist(
        &mut self,
        id: Uuid,
        ctx: &RunContext<'_>,
        db: Option<&dyn Database>,
    ) -> Result<(), ExecError> {
        let (operator_result, artifact_results) = self.operator(id)?.persist(ctx, db).await?;
        self.operator_results.push(operator_result);
        self.artifact_results.extend(artifact_results);
        Ok(())
    }

    /// Mark `id` completed and release its dependents.
    fn complete(&mut self, id: Uuid, ctx: &RunContext<'_>) -> Result<(), ExecError> {
        if !self.completed.insert(id) {
            return Err(ExecError::Internal(format!("operator {} completed twice", id)));
        }
        let outputs = self.operator(id)?.node.outputs.clone();
        for artifact_id in outputs {
            let artifact = ctx
                .artifacts
                .get(&artifact_id)
                .ok_or_else(|| ExecError::Internal(format!("unknown artifact {}", artifact_id)))?;
            for consumer in &artifact.node.outputs {
                let count = self
                    .dep_count
                    .get_mut(consumer)
                    .ok_or_else(|| ExecError::Internal(format!("unknown operator {}", consumer)))?;
                if *count == 0 {
                    return Err(ExecError::Internal(format!(
                        "dependency count of operator {} would go negative",
                        consumer
                    )));
                }
                *count -= 1;
                if *count == 0 {
                    self.ready.push(*consumer);
                }
            }
        }
        Ok(())
    }

    /// The poll loop. Returns once every operator completed or the run stops.
    async fn drive(
        &mut self,
        ctx: &RunContext<'_>,
        db: Option<&dyn Database>,
        time_config: &AqueductTimeConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        if self.ready.is_empty() {
            return Err(ExecError::NoInitialOperators);
        }
        let deadline = Instant::now() + time_config.exec_timeout;

        loop {
            self.in_progress.extend(self.ready.drain(..));

            let polled: Vec<Uuid> = self.in_progress.iter().copied().collect();
            for id in polled {
                let status = self.operator(id)?.refresh(ctx).await;
                if !status.is_terminal() {
                    continue;
                }
                self.in_progress.remove(&id);
                self.persist(id, ctx, db).await?;

                let op = self.operator(id)?;
                let name = op.name().to_string();
                tracing::info!("Operator {} finished: {}", name, status);
                if status == ExecutionStatus::Canceled {
                    return Err(ExecError::Canceled);
                }
                if let Some((failure_type, error)) = op.blocking_failure() {
                    return Err(match failure_type {
                        FailureType::System => ExecError::OpExecSystemFailure { operator: name, error },
                        _ => ExecError::OpExecBlockingUserFailure { operator: name, error },
                    });
                }
                if status == ExecutionStatus::Failed {
                    tracing::warn!(
                        "Operator {} failed without stopping the run: {}",
                        name,
                        op.state.error.as_ref().map(|e| e.context.as_str()).unwrap_or_default()
                    );
                }
                self.complete(id, ctx)?;
            }

            if self.in_progress.is_empty() && self.ready.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ExecError::Timeout(time_config.exec_timeout));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecError::Canceled),
                _ = tokio::time::sleep(time_config.operator_poll_interval) => {}
            }
        }

        if self.completed.len() != self.operators.len() {
            return Err(ExecError::Internal(format!(
                "{} of {} operators completed",
                self.completed.len(),
                self.operators.len()
            )));
        }
        if let Some((id, count)) = self.dep_count.iter().find(|(_, count)| **count != 0) {
            return Err(ExecError::Internal(format!(
                "operator {} still waits on {} inputs",
                id, count
            )));
        }
        Ok(())
    }

    /// Observe in-flight operators until none is running or the cleanup
    /// timeout elapses. Nothing is launched or canceled here.
    async fn cleanup(
        &mut self,
        ctx: &RunContext<'_>,
        db: Option<&dyn Database>,
        time_config: &AqueductTimeConfig,
        canceled: bool,
    ) {
        if self.in_progress.is_empty() {
            return;
        }
        let deadline = Instant::now() + time_config.cleanup_timeout;
        loop {
            let mut running = 0;
            let polled: Vec<Uuid> = self.in_progress.iter().copied().collect();
            for id in polled {
                let Some(op) = self.operators.get_mut(&id) else {
                    continue;
                };
                let status = op.observe(ctx).await;
                if status.is_terminal() {
                    self.in_progress.remove(&id);
                    if let Err(e) = self.persist(id, ctx, db).await {
                        tracing::error!("Failed to persist operator {} during cleanup: {}", id, e);
                    }
                } else if status == ExecutionStatus::Running {
                    running += 1;
                }
            }
            if running == 0 || canceled || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(time_config.operator_poll_interval).await;
        }
    }

    /// Give every operator without a result a terminal one. Operators the
    /// run never got to, or left in flight, are recorded as canceled.
    async fn persist_remaining(
        &mut self,
        ctx: &RunContext<'_>,
        db: Option<&dyn Database>,
    ) -> Result<(), ExecError> {
        let mut first_error = None;
        for id in self.order.clone() {
            let Some(op) = self.operators.get_mut(&id) else {
                continue;
            };
            if op.persisted {
                continue;
            }
            if !op.state.is_terminal() {
                op.state.cancel(Utc::now());
            }
            if let Err(e) = self.persist(id, ctx, db).await {
                tracing::error!("Failed to persist operator {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Release every job. Jobs still running are left to finish unless the
    /// run was canceled.
    async fn finish(&mut self, ctx: &RunContext<'_>, canceled: bool) {
        for op in self.operators.values_mut() {
            op.finish(ctx, canceled).await;
        }
    }
}

/// Drives DAG revisions to a terminal result
pub struct Executor {
    db: Arc<dyn Database>,
    jobs: JobManagers,
    shutdown: CancellationToken,
    // Track active runs for cancellation
    active_runs: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl Executor {
    pub fn new(db: Arc<dyn Database>, jobs: JobManagers) -> Self {
        Self {
            db,
            jobs,
            shutdown: CancellationToken::new(),
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Result ids of the runs in flight.
    pub async fn active_runs(&self) -> Vec<Uuid> {
        self.active_runs.read().await.keys().copied().collect()
    }

    /// Cancel one run. Returns false when it is not running.
    pub async fn cancel(&self, dag_result_id: Uuid) -> bool {
        match self.active_runs.read().await.get(&dag_result_id) {
            Some(token) => {
                tracing::info!("Canceling dag execution: result_id={}", dag_result_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every run in flight and any started later.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run one DAG revision. `parameters` maps param operator names to
    /// serialized values overriding their defaults. With `preview` no result
    /// row is written.
    ///
    /// Failures of the run itself are reported in the returned outcome; an
    /// `Err` means the run could not start, or its results could not be
    /// recorded.
    pub async fn run(
        &self,
        dag_id: Uuid,
        parameters: HashMap<String, String>,
        time_config: &AqueductTimeConfig,
        preview: bool,
    ) -> Result<RunOutcome, ExecError> {
        let db = self.db.as_ref();
        let dag = DagRepository::get(db, dag_id)?;
        let operator_nodes = OperatorRepository::list_nodes_by_dag(db, dag_id)?;
        let artifact_nodes = ArtifactRepository::list_nodes_by_dag(db, dag_id)?;
        let edges = EdgeRepository::list_by_dag(db, dag_id)?;

        let operators: Vec<Operator> = operator_nodes.iter().map(|n| n.operator.clone()).collect();
        let artifact_defs: Vec<Artifact> = artifact_nodes.iter().map(|n| n.artifact.clone()).collect();
        let graph = DagGraph::build(&operators, &artifact_defs, &edges)?;
        for name in parameters.keys() {
            let known = operators
                .iter()
                .any(|op| op.name == *name && matches!(op.spec, OperatorSpec::Param { .. }));
            if !known {
                return Err(DagValidationError::UnknownParameter(name.clone()).into());
            }
        }
        let storage = storage::open(&dag.storage_config)?;

        let now = Utc::now();
        let mut exec_state = ExecutionState::registered(now);
        exec_state.start(now);
        let mut dag_result = if preview {
            DagResult {
                id: Uuid::new_v4(),
                dag_id,
                exec_state,
                created_at: now,
            }
        } else {
            DagResultRepository::create(db, dag_id, &exec_state, now)?
        };

        tracing::info!(
            "Starting dag execution: dag_id={}, result_id={}, preview={}",
            dag_id,
            dag_result.id,
            preview
        );
        tracing::debug!("Execution plan: {:?}", graph.topological_order());

        let cancel = self.shutdown.child_token();
        self.active_runs
            .write()
            .await
            .insert(dag_result.id, cancel.clone());

        let artifacts: HashMap<Uuid, RunArtifact> = artifact_nodes
            .into_iter()
            .map(|node| (node.artifact.id, RunArtifact::new(node)))
            .collect();
        let ctx = RunContext {
            dag: &dag,
            dag_result_id: dag_result.id,
            storage: storage.as_ref(),
            jobs: &self.jobs,
            artifacts: &artifacts,
            parameters: &parameters,
        };
        let persist_to = if preview { None } else { Some(db) };

        let mut scheduler = Scheduler::new(operator_nodes, &dag.engine_config);
        let mut error = scheduler.drive(&ctx, persist_to, time_config, &cancel).await.err();
        if let Some(e) = &error {
            tracing::warn!("Dag execution {} stopped: {}", dag_result.id, e);
        }
        let canceled = cancel.is_cancelled();
        scheduler.cleanup(&ctx, persist_to, time_config, canceled).await;
        if let Err(e) = scheduler.persist_remaining(&ctx, persist_to).await {
            error.get_or_insert(e);
        }
        scheduler.finish(&ctx, canceled).await;
        self.active_runs.write().await.remove(&dag_result.id);

        let finished_at = Utc::now();
        match &error {
            None => dag_result.exec_state.succeed(finished_at),
            Some(ExecError::Canceled) => dag_result.exec_state.cancel(finished_at),
            Some(e) => {
                let (failure_type, details) = e.failure();
                dag_result.exec_state.fail(failure_type, details, finished_at);
            }
        }
        if !preview {
            DagResultRepository::update_exec_state(db, dag_result.id, &dag_result.exec_state)?;
        }
        tracing::info!(
            "Finished dag execution: result_id={}, status={}",
            dag_result.id,
            dag_result.exec_state.status
        );

        Ok(RunOutcome {
            dag_result,
            operator_results: scheduler.operator_results,
            artifact_results: scheduler.artifact_results,
            error,
        })
    }
}
