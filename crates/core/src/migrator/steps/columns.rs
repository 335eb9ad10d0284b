//! Column and constraint changes.

use super::rebuild_table;
use crate::database::SqlValue;
use crate::migrator::StepContext;

pub(super) const SCHEDULE_UP_POSTGRES: &str = r#"
ALTER TABLE workflow ADD COLUMN schedule JSONB NOT NULL DEFAULT '{"trigger":"manual"}';
ALTER TABLE workflow ADD COLUMN retention_policy JSONB NOT NULL DEFAULT '{"k_latest_runs":-1}';
"#;

pub(super) const SCHEDULE_UP_SQLITE: &str = r#"
ALTER TABLE workflow ADD COLUMN schedule BLOB NOT NULL DEFAULT '{"trigger":"manual"}';
ALTER TABLE workflow ADD COLUMN retention_policy BLOB NOT NULL DEFAULT '{"k_latest_runs":-1}';
"#;

pub(super) const SCHEDULE_DOWN_POSTGRES: &str = r#"
ALTER TABLE workflow DROP COLUMN retention_policy;
ALTER TABLE workflow DROP COLUMN schedule;
"#;

pub(super) const EDGE_PK_UP_POSTGRES: &str = r#"
ALTER TABLE workflow_dag_edge ADD PRIMARY KEY (workflow_dag_id, from_id, to_id);
"#;

pub(super) const EDGE_PK_DOWN_POSTGRES: &str = r#"
ALTER TABLE workflow_dag_edge DROP CONSTRAINT workflow_dag_edge_pkey;
"#;

pub(super) fn edge_pk_up_sqlite(ctx: &StepContext<'_>) -> anyhow::Result<()> {
    rebuild_table(
        ctx,
        "workflow_dag_edge",
        "CREATE TABLE workflow_dag_edge (
            workflow_dag_id BLOB NOT NULL,
            type TEXT NOT NULL,
            from_id BLOB NOT NULL,
            to_id BLOB NOT NULL,
            idx INTEGER NOT NULL,
            PRIMARY KEY (workflow_dag_id, from_id, to_id)
        )",
        "workflow_dag_id, type, from_id, to_id, idx",
    )
}

/// Engine of DAGs registered before engines were recorded.
const DEFAULT_ENGINE_CONFIG: &str = r#"{"type":"aqueduct","aqueduct_config":{}}"#;

pub(super) const ENGINE_CONFIG_UP_POSTGRES: &str = r#"
UPDATE workflow_dag SET engine_config = '{"type":"aqueduct","aqueduct_config":{}}' WHERE engine_config IS NULL;
ALTER TABLE workflow_dag ADD CONSTRAINT workflow_dag_engine_config_not_null CHECK (engine_config IS NOT NULL) NOT VALID;
ALTER TABLE workflow_dag VALIDATE CONSTRAINT workflow_dag_engine_config_not_null;
ALTER TABLE workflow_dag ALTER COLUMN engine_config SET NOT NULL;
ALTER TABLE workflow_dag DROP CONSTRAINT workflow_dag_engine_config_not_null;
"#;

pub(super) const ENGINE_CONFIG_DOWN_POSTGRES: &str = r#"
ALTER TABLE workflow_dag ALTER COLUMN engine_config DROP NOT NULL;
"#;

pub(super) fn engine_config_up_sqlite(ctx: &StepContext<'_>) -> anyhow::Result<()> {
    ctx.db.execute(
        "UPDATE workflow_dag SET engine_config = $1 WHERE engine_config IS NULL",
        &[SqlValue::Text(DEFAULT_ENGINE_CONFIG.to_string())],
    )?;
    rebuild_table(
        ctx,
        "workflow_dag",
        "CREATE TABLE workflow_dag (
            id BLOB NOT NULL PRIMARY KEY,
            workflow_id BLOB NOT NULL,
            created_at DATETIME NOT NULL,
            storage_config BLOB NOT NULL,
            engine_config BLOB NOT NULL
        )",
        "id, workflow_id, created_at, storage_config, engine_config",
    )
}

pub(super) const NOTIFICATIONS_UP_POSTGRES: &str =
    "ALTER TABLE workflow ADD COLUMN notification_settings JSONB;";

pub(super) const NOTIFICATIONS_UP_SQLITE: &str =
    "ALTER TABLE workflow ADD COLUMN notification_settings BLOB;";

pub(super) const NOTIFICATIONS_DOWN_POSTGRES: &str =
    "ALTER TABLE workflow DROP COLUMN notification_settings;";

#[cfg(test)]
mod tests {
    use crate::database::{Database, QueryExt, SqlValue, SqliteDatabase};
    use crate::migrator::{Migrator, Registry};
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn test_engine_config_backfilled_and_required() {
        let dir = TempDir::new().unwrap();
        let db: Arc<dyn Database> =
            Arc::new(SqliteDatabase::open(&dir.path().join("c.db")).unwrap());
        Migrator::new(db.clone(), Registry::builtin()).goto(5).unwrap();

        let dag_id = Uuid::new_v4();
        db.execute(
            "INSERT INTO workflow_dag (id, workflow_id, created_at, storage_config) \
             VALUES ($1, $2, '2022-01-01T00:00:00.000000Z', '{}')",
            &[SqlValue::Uuid(dag_id), SqlValue::Uuid(Uuid::new_v4())],
        )
        .unwrap();

        Migrator::new(db.clone(), Registry::builtin()).goto(6).unwrap();
        let engine: serde_json::Value = db
            .query_scalar(
                "SELECT engine_config FROM workflow_dag WHERE id = $1",
                &[SqlValue::Uuid(dag_id)],
            )
            .unwrap();
        assert_eq!(engine["type"], "aqueduct");

        let err = db
            .execute(
                "INSERT INTO workflow_dag (id, workflow_id, created_at, storage_config) \
                 VALUES ($1, $2, '2022-01-01T00:00:00.000000Z', '{}')",
                &[SqlValue::Uuid(Uuid::new_v4()), SqlValue::Uuid(Uuid::new_v4())],
            )
            .unwrap_err();
        assert!(err.to_string().contains("NOT NULL"), "got {}", err);
    }
}
