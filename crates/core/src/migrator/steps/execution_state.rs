//! Structured execution states on result rows.

use crate::database::{Dialect, Json, QueryExt};
use crate::migrator::StepContext;
use crate::sql_args;
use crate::types::{ErrorDetails, ExecutionState, ExecutionStatus, FailureType, Logs};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

/// Untyped operator metadata written before execution states existed.
#[derive(Debug, Default, Deserialize)]
struct LegacyMetadata {
    #[serde(default)]
    logs: Option<Logs>,
    #[serde(default)]
    error: Option<LegacyError>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyError {
    Details(ErrorDetails),
    Text(String),
}

impl From<LegacyError> for ErrorDetails {
    fn from(error: LegacyError) -> Self {
        match error {
            LegacyError::Details(details) => details,
            LegacyError::Text(context) => ErrorDetails::new(context, ""),
        }
    }
}

fn json_type(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => "JSONB",
        Dialect::Sqlite => "BLOB",
    }
}

/// Rows only carried a status; the owning run's creation time stands in for
/// every transition.
fn legacy_state(status: &str, metadata: LegacyMetadata, at: DateTime<Utc>) -> ExecutionState {
    let mut state = ExecutionState::registered(at);
    match status.parse().unwrap_or(ExecutionStatus::Unknown) {
        ExecutionStatus::Pending => {}
        ExecutionStatus::Running => state.start(at),
        ExecutionStatus::Succeeded => state.succeed(at),
        // Legacy runs stopped on every failure.
        ExecutionStatus::Failed => {
            let error = metadata.error.map(ErrorDetails::from).unwrap_or_default();
            state.fail(FailureType::UserFatal, error, at);
        }
        ExecutionStatus::Canceled => state.cancel(at),
        ExecutionStatus::Unknown => state.status = ExecutionStatus::Unknown,
    }
    state.user_logs = metadata.logs;
    state
}

fn parse_metadata(id: Uuid, raw: Option<serde_json::Value>) -> LegacyMetadata {
    match raw {
        Some(value) if !value.is_null() => serde_json::from_value(value).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable metadata of operator result {}: {}", id, e);
            LegacyMetadata::default()
        }),
        _ => LegacyMetadata::default(),
    }
}

pub(super) fn backfill(ctx: &StepContext<'_>) -> anyhow::Result<()> {
    let db = ctx.db;
    let column_type = json_type(ctx.dialect);
    for table in ["workflow_dag_result", "operator_result", "artifact_result"] {
        db.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN execution_state {column_type}"
        ))?;
    }

    for row in db.query("SELECT id, status, created_at FROM workflow_dag_result", &[])? {
        let id: Uuid = row.get("id")?;
        let status: String = row.get("status")?;
        let state = legacy_state(&status, LegacyMetadata::default(), row.get("created_at")?);
        db.execute(
            "UPDATE workflow_dag_result SET execution_state = $1 WHERE id = $2",
            &sql_args![Json(&state), id],
        )?;
    }

    for row in db.query(
        "SELECT o.id, o.status, o.metadata, r.created_at FROM operator_result o \
         JOIN workflow_dag_result r ON r.id = o.workflow_dag_result_id",
        &[],
    )? {
        let id: Uuid = row.get("id")?;
        let status: String = row.get("status")?;
        let metadata = parse_metadata(id, row.get("metadata")?);
        let state = legacy_state(&status, metadata, row.get("created_at")?);
        db.execute(
            "UPDATE operator_result SET execution_state = $1 WHERE id = $2",
            &sql_args![Json(&state), id],
        )?;
    }

    for row in db.query(
        "SELECT a.id, a.status, r.created_at FROM artifact_result a \
         JOIN workflow_dag_result r ON r.id = a.workflow_dag_result_id",
        &[],
    )? {
        let id: Uuid = row.get("id")?;
        let status: String = row.get("status")?;
        let state = legacy_state(&status, LegacyMetadata::default(), row.get("created_at")?);
        db.execute(
            "UPDATE artifact_result SET execution_state = $1 WHERE id = $2",
            &sql_args![Json(&state), id],
        )?;
    }

    db.execute_batch(
        "ALTER TABLE workflow_dag_result DROP COLUMN status;
         ALTER TABLE operator_result DROP COLUMN status;
         ALTER TABLE operator_result DROP COLUMN metadata;
         ALTER TABLE artifact_result DROP COLUMN status;",
    )?;
    Ok(())
}

/// Artifacts left pending or failed by legacy runs are never going to be
/// produced; they become canceled. There is no way back.
pub(super) fn cancel_legacy_artifacts(ctx: &StepContext<'_>) -> anyhow::Result<()> {
    let db = ctx.db;
    let mut canceled = 0;
    for row in db.query(
        "SELECT a.id, a.execution_state, r.created_at FROM artifact_result a \
         JOIN workflow_dag_result r ON r.id = a.workflow_dag_result_id",
        &[],
    )? {
        let id: Uuid = row.get("id")?;
        let Some(Json(mut state)) = row.get::<Option<Json<ExecutionState>>>("execution_state")?
        else {
            continue;
        };
        if !matches!(state.status, ExecutionStatus::Pending | ExecutionStatus::Failed) {
            continue;
        }
        let created_at: DateTime<Utc> = row.get("created_at")?;
        state.cancel(state.timestamps.finished_at.unwrap_or(created_at));
        db.execute(
            "UPDATE artifact_result SET execution_state = $1 WHERE id = $2",
            &sql_args![Json(&state), id],
        )?;
        canceled += 1;
    }
    let total: i64 = db.query_scalar("SELECT COUNT(*) AS n FROM artifact_result", &[])?;
    tracing::info!("Canceled {} of {} legacy artifact results", canceled, total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::database::{Database, DbError, Json, SqlValue, SqliteDatabase};
    use crate::migrator::{Migrator, Registry};
    use crate::sql_args;
    use crate::types::{ExecutionState, ExecutionStatus, FailureType};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn state_of(db: &dyn Database, table: &str, id: Uuid) -> ExecutionState {
        let rows = db
            .query(
                &format!("SELECT execution_state FROM {table} WHERE id = $1"),
                &[SqlValue::Uuid(id)],
            )
            .unwrap();
        rows[0].get::<Json<ExecutionState>>("execution_state").unwrap().0
    }

    #[test]
    fn test_legacy_rows_backfilled() -> Result<(), DbError> {
        let dir = TempDir::new().unwrap();
        let db: Arc<dyn Database> =
            Arc::new(SqliteDatabase::open(&dir.path().join("c.db")).unwrap());
        Migrator::new(db.clone(), Registry::builtin()).goto(3).unwrap();

        let created_at = Utc.with_ymd_and_hms(2022, 3, 1, 12, 0, 0).unwrap();
        let (run, op_ok, op_failed, art_pending, art_done) = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        db.execute(
            "INSERT INTO workflow_dag_result (id, workflow_dag_id, status, created_at) \
             VALUES ($1, $2, 'failed', $3)",
            &sql_args![run, Uuid::new_v4(), created_at],
        )
        .unwrap();
        for (id, status, metadata) in [
            (op_ok, "succeeded", r#"{"logs":{"stdout":"hi","stderr":""}}"#),
            (op_failed, "failed", r#"{"error":"division by zero"}"#),
        ] {
            db.execute(
                "INSERT INTO operator_result (id, workflow_dag_result_id, operator_id, status, metadata) \
                 VALUES ($1, $2, $3, $4, $5)",
                &sql_args![id, run, Uuid::new_v4(), status, metadata],
            )
            .unwrap();
        }
        for (id, status) in [(art_pending, "pending"), (art_done, "succeeded")] {
            db.execute(
                "INSERT INTO artifact_result (id, workflow_dag_result_id, artifact_id, content_path, status) \
                 VALUES ($1, $2, $3, $4, $5)",
                &sql_args![id, run, Uuid::new_v4(), id.to_string(), status],
            )
            .unwrap();
        }

        Migrator::new(db.clone(), Registry::builtin()).goto(5).unwrap();

        let run_state = state_of(db.as_ref(), "workflow_dag_result", run);
        assert_eq!(run_state.status, ExecutionStatus::Failed);
        assert_eq!(run_state.failure_type, Some(FailureType::UserFatal));
        assert_eq!(run_state.timestamps.finished_at, Some(created_at));
        assert!(run_state.is_consistent());

        let ok = state_of(db.as_ref(), "operator_result", op_ok);
        assert_eq!(ok.status, ExecutionStatus::Succeeded);
        assert_eq!(ok.user_logs.unwrap().stdout, "hi");

        let failed = state_of(db.as_ref(), "operator_result", op_failed);
        assert_eq!(failed.error.unwrap().context, "division by zero");

        assert_eq!(
            state_of(db.as_ref(), "artifact_result", art_pending).status,
            ExecutionStatus::Canceled
        );
        assert_eq!(
            state_of(db.as_ref(), "artifact_result", art_done).status,
            ExecutionStatus::Succeeded
        );

        assert!(db.query("SELECT status FROM operator_result", &[]).is_err());
        assert!(db.query("SELECT metadata FROM artifact_result", &[]).is_ok());
        Ok(())
    }
}
