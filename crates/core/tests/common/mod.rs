#![allow(dead_code)]

use aqueduct_core::catalog::UserRepository;
use aqueduct_core::database::{Database, SqliteDatabase};
use aqueduct_core::job::{InProcessJobManager, JobBody, JobContext, JobManager, JobManagers, JobOutcome};
use aqueduct_core::migrator::{Migrator, Registry};
use aqueduct_core::models::{
    Artifact, ArtifactResultMetadata, CheckSpec, Dag, EdgeType, FunctionSpec, Operator,
    OperatorSpec, ParamSpec,
};
use aqueduct_core::storage::{FileStorage, StorageConfig};
use aqueduct_core::workflow::{register_dag, AqueductTimeConfig, DagDefinition, EdgeDefinition, Executor};
use aqueduct_core::{ArtifactType, CheckLevel, FailureType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub struct Harness {
    _catalog_dir: TempDir,
    pub store_dir: TempDir,
    pub db: Arc<dyn Database>,
    pub jobs: Arc<InProcessJobManager>,
    pub user_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        let catalog_dir = TempDir::new().unwrap();
        let db: Arc<dyn Database> =
            Arc::new(SqliteDatabase::open(&catalog_dir.path().join("catalog.db")).unwrap());
        Migrator::new(db.clone(), Registry::builtin()).up().unwrap();
        let user = UserRepository::create(db.as_ref(), "ops@example.com", "org", "").unwrap();
        Self {
            _catalog_dir: catalog_dir,
            store_dir: TempDir::new().unwrap(),
            db,
            jobs: Arc::new(InProcessJobManager::new()),
            user_id: user.id,
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::file(self.store_dir.path())
    }

    pub fn storage(&self) -> FileStorage {
        FileStorage::new(self.store_dir.path().to_path_buf())
    }

    pub fn executor(&self) -> Executor {
        self.executor_with(self.jobs.clone())
    }

    pub fn executor_with(&self, local: Arc<dyn JobManager>) -> Executor {
        Executor::new(self.db.clone(), JobManagers::new(local))
    }

    pub fn register(
        &self,
        operators: Vec<Operator>,
        artifacts: Vec<Artifact>,
        edges: Vec<EdgeDefinition>,
    ) -> Dag {
        let definition = DagDefinition {
            workflow_name: "churn".to_string(),
            description: String::new(),
            schedule: Default::default(),
            retention_policy: Default::default(),
            notification_settings: Default::default(),
            storage_config: self.storage_config(),
            engine_config: Default::default(),
            operators,
            artifacts,
            edges,
        };
        register_dag(self.db.as_ref(), self.user_id, definition)
            .unwrap()
            .dag
    }
}

pub fn fast() -> AqueductTimeConfig {
    AqueductTimeConfig {
        operator_poll_interval: Duration::from_millis(10),
        exec_timeout: Duration::from_secs(10),
        cleanup_timeout: Duration::from_secs(1),
    }
}

fn operator(name: &str, spec: OperatorSpec) -> Operator {
    Operator {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: String::new(),
        spec,
        engine_config: None,
        resources: None,
        execution_environment_id: None,
    }
}

pub fn function(name: &str) -> Operator {
    operator(
        name,
        OperatorSpec::Function {
            function: FunctionSpec::file(format!("code/{}.zip", name)),
        },
    )
}

pub fn check(name: &str, level: CheckLevel) -> Operator {
    operator(
        name,
        OperatorSpec::Check {
            check: CheckSpec {
                level,
                function: FunctionSpec::file(format!("code/{}.zip", name)),
            },
        },
    )
}

pub fn param(name: &str, default: &str) -> Operator {
    operator(
        name,
        OperatorSpec::Param {
            param: ParamSpec {
                val: default.to_string(),
                serialization_type: None,
            },
        },
    )
}

pub fn artifact(name: &str) -> Artifact {
    Artifact {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: String::new(),
        artifact_type: ArtifactType::Table,
    }
}

pub fn produces(op: &Operator, artifact: &Artifact, idx: i64) -> EdgeDefinition {
    EdgeDefinition {
        edge_type: EdgeType::OperatorToArtifact,
        from_id: op.id,
        to_id: artifact.id,
        idx,
    }
}

pub fn consumes(artifact: &Artifact, op: &Operator, idx: i64) -> EdgeDefinition {
    EdgeDefinition {
        edge_type: EdgeType::ArtifactToOperator,
        from_id: artifact.id,
        to_id: op.id,
        idx,
    }
}

fn table_metadata() -> ArtifactResultMetadata {
    ArtifactResultMetadata {
        artifact_type: Some(ArtifactType::Table),
        ..Default::default()
    }
}

/// Writes the same payload to every output.
pub struct Emit(pub &'static [u8]);

#[async_trait::async_trait]
impl JobBody for Emit {
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        for idx in 0..ctx.spec.output_content_paths.len() {
            if let Err(e) = ctx.write_output(idx, self.0, &table_metadata()).await {
                return JobOutcome::failed(FailureType::System, e.to_string());
            }
        }
        JobOutcome::succeeded()
    }
}

/// Copies its first input to its first output.
pub struct Echo;

#[async_trait::async_trait]
impl JobBody for Echo {
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        let content = match ctx.read_input(0).await {
            Ok(content) => content,
            Err(e) => return JobOutcome::failed(FailureType::UserFatal, e.to_string()),
        };
        match ctx.write_output(0, content, &table_metadata()).await {
            Ok(()) => JobOutcome::succeeded(),
            Err(e) => JobOutcome::failed(FailureType::System, e.to_string()),
        }
    }
}

pub struct Fail(pub FailureType);

#[async_trait::async_trait]
impl JobBody for Fail {
    async fn run(&self, _ctx: JobContext) -> JobOutcome {
        JobOutcome::failed(self.0, "boom")
    }
}

/// Records that it ran, then succeeds without output.
#[derive(Default)]
pub struct Flag(pub AtomicBool);

impl Flag {
    pub fn ran(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl JobBody for Flag {
    async fn run(&self, _ctx: JobContext) -> JobOutcome {
        self.0.store(true, Ordering::SeqCst);
        JobOutcome::succeeded()
    }
}

/// Sleeps, writes its outputs, then records that it finished.
pub struct Slow {
    delay: Duration,
    done: AtomicBool,
}

impl Slow {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            done: AtomicBool::new(false),
        }
    }

    pub fn finished(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl JobBody for Slow {
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        tokio::time::sleep(self.delay).await;
        for idx in 0..ctx.spec.output_content_paths.len() {
            if let Err(e) = ctx.write_output(idx, "late", &table_metadata()).await {
                return JobOutcome::failed(FailureType::System, e.to_string());
            }
        }
        self.done.store(true, Ordering::SeqCst);
        JobOutcome::succeeded()
    }
}

/// Never finishes on its own.
pub struct Hang;

#[async_trait::async_trait]
impl JobBody for Hang {
    async fn run(&self, _ctx: JobContext) -> JobOutcome {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        JobOutcome::succeeded()
    }
}
