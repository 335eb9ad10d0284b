use super::id_list;
use crate::database::{Database, DbError, FromRow, Json, QueryExt, Row};
use crate::models::{ArtifactResult, ArtifactResultMetadata, DagResult, OperatorResult};
use crate::sql_args;
use crate::types::ExecutionState;
use chrono::{DateTime, Utc};
use uuid::Uuid;

const DAG_RESULT_COLUMNS: &str = "id, workflow_dag_id, execution_state, created_at";
const OPERATOR_RESULT_COLUMNS: &str = "id, workflow_dag_result_id, operator_id, execution_state";
const ARTIFACT_RESULT_COLUMNS: &str =
    "id, workflow_dag_result_id, artifact_id, content_path, execution_state, metadata";

impl FromRow for DagResult {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.get("id")?,
            dag_id: row.get("workflow_dag_id")?,
            exec_state: row.get::<Json<ExecutionState>>("execution_state")?.0,
            created_at: row.get("created_at")?,
        })
    }
}

impl FromRow for OperatorResult {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        let exec_state: Option<Json<ExecutionState>> = row.get("execution_state")?;
        Ok(Self {
            id: row.get("id")?,
            dag_result_id: row.get("workflow_dag_result_id")?,
            operator_id: row.get("operator_id")?,
            exec_state: exec_state.map(Json::into_inner),
        })
    }
}

impl FromRow for ArtifactResult {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        let exec_state: Option<Json<ExecutionState>> = row.get("execution_state")?;
        let metadata: Option<Json<ArtifactResultMetadata>> = row.get("metadata")?;
        Ok(Self {
            id: row.get("id")?,
            dag_result_id: row.get("workflow_dag_result_id")?,
            artifact_id: row.get("artifact_id")?,
            content_path: row.get("content_path")?,
            exec_state: exec_state.map(Json::into_inner),
            metadata: metadata.map(Json::into_inner),
        })
    }
}

fn found(changed: u64, what: &str, id: Uuid) -> Result<(), DbError> {
    if changed == 0 {
        Err(DbError::not_found(what, id))
    } else {
        Ok(())
    }
}

pub struct DagResultRepository;

impl DagResultRepository {
    pub fn create(
        db: &dyn Database,
        dag_id: Uuid,
        exec_state: &ExecutionState,
        created_at: DateTime<Utc>,
    ) -> Result<DagResult, DbError> {
        let result = DagResult {
            id: Uuid::new_v4(),
            dag_id,
            exec_state: exec_state.clone(),
            created_at,
        };
        db.execute(
            &format!("INSERT INTO workflow_dag_result ({DAG_RESULT_COLUMNS}) VALUES ($1, $2, $3, $4)"),
            &sql_args![result.id, result.dag_id, Json(&result.exec_state), result.created_at],
        )?;
        Ok(result)
    }

    pub fn get(db: &dyn Database, id: Uuid) -> Result<DagResult, DbError> {
        db.query_optional(
            &format!("SELECT {DAG_RESULT_COLUMNS} FROM workflow_dag_result WHERE id = $1"),
            &sql_args![id],
        )?
        .ok_or_else(|| DbError::not_found("dag result", id))
    }

    pub fn list_by_dag(db: &dyn Database, dag_id: Uuid) -> Result<Vec<DagResult>, DbError> {
        db.query_as(
            &format!(
                "SELECT {DAG_RESULT_COLUMNS} FROM workflow_dag_result \
                 WHERE workflow_dag_id = $1 ORDER BY created_at, id"
            ),
            &sql_args![dag_id],
        )
    }

    /// Runs across all revisions of a workflow, newest first.
    pub fn list_by_workflow(db: &dyn Database, workflow_id: Uuid) -> Result<Vec<DagResult>, DbError> {
        db.query_as(
            "SELECT r.id, r.workflow_dag_id, r.execution_state, r.created_at \
             FROM workflow_dag_result r JOIN workflow_dag d ON d.id = r.workflow_dag_id \
             WHERE d.workflow_id = $1 ORDER BY r.created_at DESC, r.id DESC",
            &sql_args![workflow_id],
        )
    }

    pub fn update_exec_state(
        db: &dyn Database,
        id: Uuid,
        exec_state: &ExecutionState,
    ) -> Result<(), DbError> {
        let changed = db.execute(
            "UPDATE workflow_dag_result SET execution_state = $1 WHERE id = $2",
            &sql_args![Json(exec_state), id],
        )?;
        found(changed, "dag result", id)
    }

    /// Delete runs together with their operator and artifact results.
    pub fn delete(db: &dyn Database, ids: &[Uuid]) -> Result<(), DbError> {
        if ids.is_empty() {
            return Ok(());
        }
        let (placeholders, args) = id_list(ids, 1);
        let txn = db.begin_transaction()?;
        txn.execute(
            &format!("DELETE FROM artifact_result WHERE workflow_dag_result_id IN ({placeholders})"),
            &args,
        )?;
        txn.execute(
            &format!("DELETE FROM operator_result WHERE workflow_dag_result_id IN ({placeholders})"),
            &args,
        )?;
        txn.execute(
            &format!("DELETE FROM workflow_dag_result WHERE id IN ({placeholders})"),
            &args,
        )?;
        txn.commit()
    }
}

pub struct OperatorResultRepository;

impl OperatorResultRepository {
    pub fn create(
        db: &dyn Database,
        dag_result_id: Uuid,
        operator_id: Uuid,
        exec_state: Option<&ExecutionState>,
    ) -> Result<OperatorResult, DbError> {
        let result = OperatorResult {
            id: Uuid::new_v4(),
            dag_result_id,
            operator_id,
            exec_state: exec_state.cloned(),
        };
        db.execute(
            &format!(
                "INSERT INTO operator_result ({OPERATOR_RESULT_COLUMNS}) VALUES ($1, $2, $3, $4)"
            ),
            &sql_args![
                result.id,
                result.dag_result_id,
                result.operator_id,
                result.exec_state.as_ref().map(Json)
            ],
        )?;
        Ok(result)
    }

    pub fn get(db: &dyn Database, id: Uuid) -> Result<OperatorResult, DbError> {
        db.query_optional(
            &format!("SELECT {OPERATOR_RESULT_COLUMNS} FROM operator_result WHERE id = $1"),
            &sql_args![id],
        )?
        .ok_or_else(|| DbError::not_found("operator result", id))
    }

    pub fn list_by_dag_result(
        db: &dyn Database,
        dag_result_id: Uuid,
    ) -> Result<Vec<OperatorResult>, DbError> {
        db.query_as(
            &format!(
                "SELECT {OPERATOR_RESULT_COLUMNS} FROM operator_result \
                 WHERE workflow_dag_result_id = $1"
            ),
            &sql_args![dag_result_id],
        )
    }

    pub fn update_exec_state(
        db: &dyn Database,
        id: Uuid,
        exec_state: &ExecutionState,
    ) -> Result<(), DbError> {
        let changed = db.execute(
            "UPDATE operator_result SET execution_state = $1 WHERE id = $2",
            &sql_args![Json(exec_state), id],
        )?;
        found(changed, "operator result", id)
    }
}

pub struct ArtifactResultRepository;

impl ArtifactResultRepository {
    pub fn create(
        db: &dyn Database,
        dag_result_id: Uuid,
        artifact_id: Uuid,
        content_path: &str,
        exec_state: Option<&ExecutionState>,
    ) -> Result<ArtifactResult, DbError> {
        let result = ArtifactResult {
            id: Uuid::new_v4(),
            dag_result_id,
            artifact_id,
            content_path: content_path.to_string(),
            exec_state: exec_state.cloned(),
            metadata: None,
        };
        db.execute(
            &format!(
                "INSERT INTO artifact_result ({ARTIFACT_RESULT_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6)"
            ),
            &sql_args![
                result.id,
                result.dag_result_id,
                result.artifact_id,
                result.content_path,
                result.exec_state.as_ref().map(Json),
                Option::<Json<ArtifactResultMetadata>>::None
            ],
        )?;
        Ok(result)
    }

    pub fn get(db: &dyn Database, id: Uuid) -> Result<ArtifactResult, DbError> {
        db.query_optional(
            &format!("SELECT {ARTIFACT_RESULT_COLUMNS} FROM artifact_result WHERE id = $1"),
            &sql_args![id],
        )?
        .ok_or_else(|| DbError::not_found("artifact result", id))
    }

    pub fn list_by_dag_result(
        db: &dyn Database,
        dag_result_id: Uuid,
    ) -> Result<Vec<ArtifactResult>, DbError> {
        db.query_as(
            &format!(
                "SELECT {ARTIFACT_RESULT_COLUMNS} FROM artifact_result \
                 WHERE workflow_dag_result_id = $1"
            ),
            &sql_args![dag_result_id],
        )
    }

    /// Results of one artifact across every run.
    pub fn list_by_artifact(
        db: &dyn Database,
        artifact_id: Uuid,
    ) -> Result<Vec<ArtifactResult>, DbError> {
        db.query_as(
            &format!(
                "SELECT {ARTIFACT_RESULT_COLUMNS} FROM artifact_result WHERE artifact_id = $1"
            ),
            &sql_args![artifact_id],
        )
    }

    pub fn update(
        db: &dyn Database,
        id: Uuid,
        exec_state: &ExecutionState,
        metadata: Option<&ArtifactResultMetadata>,
    ) -> Result<(), DbError> {
        let changed = db.execute(
            "UPDATE artifact_result SET execution_state = $1, metadata = $2 WHERE id = $3",
            &sql_args![Json(exec_state), metadata.map(Json), id],
        )?;
        found(changed, "artifact result", id)
    }
}
