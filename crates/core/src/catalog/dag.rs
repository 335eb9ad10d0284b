use super::{id_list, ArtifactRepository, DagResultRepository, EdgeRepository, OperatorRepository};
use crate::database::{Database, DbError, FromRow, Json, QueryExt, Row};
use crate::models::{Dag, EngineConfig};
use crate::sql_args;
use crate::storage::StorageConfig;
use uuid::Uuid;

const COLUMNS: &str = "id, workflow_id, created_at, storage_config, engine_config";

impl FromRow for Dag {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.get("id")?,
            workflow_id: row.get("workflow_id")?,
            created_at: row.get("created_at")?,
            storage_config: row.get::<Json<StorageConfig>>("storage_config")?.0,
            engine_config: row.get::<Json<EngineConfig>>("engine_config")?.0,
        })
    }
}

pub struct DagRepository;

impl DagRepository {
    pub fn create(db: &dyn Database, dag: &Dag) -> Result<(), DbError> {
        db.execute(
            &format!("INSERT INTO workflow_dag ({COLUMNS}) VALUES ($1, $2, $3, $4, $5)"),
            &sql_args![
                dag.id,
                dag.workflow_id,
                dag.created_at,
                Json(&dag.storage_config),
                Json(&dag.engine_config)
            ],
        )?;
        Ok(())
    }

    pub fn get(db: &dyn Database, id: Uuid) -> Result<Dag, DbError> {
        db.query_optional(
            &format!("SELECT {COLUMNS} FROM workflow_dag WHERE id = $1"),
            &sql_args![id],
        )?
        .ok_or_else(|| DbError::not_found("dag", id))
    }

    /// Revisions of a workflow, oldest first.
    pub fn list_by_workflow(db: &dyn Database, workflow_id: Uuid) -> Result<Vec<Dag>, DbError> {
        db.query_as(
            &format!(
                "SELECT {COLUMNS} FROM workflow_dag WHERE workflow_id = $1 ORDER BY created_at, id"
            ),
            &sql_args![workflow_id],
        )
    }

    pub fn latest_for_workflow(db: &dyn Database, workflow_id: Uuid) -> Result<Dag, DbError> {
        db.query_optional(
            &format!(
                "SELECT {COLUMNS} FROM workflow_dag WHERE workflow_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            ),
            &sql_args![workflow_id],
        )?
        .ok_or_else(|| DbError::not_found("dag for workflow", workflow_id))
    }

    pub fn list(db: &dyn Database) -> Result<Vec<Dag>, DbError> {
        db.query_as(
            &format!("SELECT {COLUMNS} FROM workflow_dag ORDER BY created_at, id"),
            &[],
        )
    }

    pub fn update_storage_config(
        db: &dyn Database,
        id: Uuid,
        config: &StorageConfig,
    ) -> Result<(), DbError> {
        let changed = db.execute(
            "UPDATE workflow_dag SET storage_config = $1 WHERE id = $2",
            &sql_args![Json(config), id],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("dag", id));
        }
        Ok(())
    }

    /// Delete every revision of a workflow with its edges, results and the
    /// operators and artifacts no other revision references.
    pub fn delete_by_workflow(db: &dyn Database, workflow_id: Uuid) -> Result<(), DbError> {
        let dag_ids: Vec<Uuid> = Self::list_by_workflow(db, workflow_id)?
            .into_iter()
            .map(|d| d.id)
            .collect();
        if dag_ids.is_empty() {
            return Ok(());
        }

        let txn = db.begin_transaction()?;
        for dag_id in &dag_ids {
            let result_ids: Vec<Uuid> = DagResultRepository::list_by_dag(&txn, *dag_id)?
                .into_iter()
                .map(|r| r.id)
                .collect();
            DagResultRepository::delete(&txn, &result_ids)?;
        }

        let nodes = EdgeRepository::node_ids_by_dags(&txn, &dag_ids)?;
        EdgeRepository::delete_by_dags(&txn, &dag_ids)?;
        let (placeholders, args) = id_list(&dag_ids, 1);
        txn.execute(
            &format!("DELETE FROM workflow_dag WHERE id IN ({placeholders})"),
            &args,
        )?;
        OperatorRepository::delete_unreferenced(&txn, &nodes)?;
        ArtifactRepository::delete_unreferenced(&txn, &nodes)?;
        txn.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::{catalog, workflow};
    use crate::catalog::{UserRepository, WorkflowRepository};
    use chrono::{Duration, Utc};

    #[test]
    fn test_revisions_are_ordered() {
        let (_dir, db) = catalog();
        let db = db.as_ref();
        let user = UserRepository::create(db, "a@x", "org", "").unwrap();
        let wf = workflow(user.id, "wf");
        WorkflowRepository::create(db, &wf).unwrap();

        let now = Utc::now();
        let revisions: Vec<Dag> = (0..3)
            .map(|i| Dag {
                id: Uuid::new_v4(),
                workflow_id: wf.id,
                created_at: now + Duration::seconds(i),
                storage_config: StorageConfig::file("/tmp/aq"),
                engine_config: EngineConfig::default(),
            })
            .collect();
        for dag in revisions.iter().rev() {
            DagRepository::create(db, dag).unwrap();
        }

        let listed = DagRepository::list_by_workflow(db, wf.id).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, revisions[0].id);
        assert_eq!(DagRepository::latest_for_workflow(db, wf.id).unwrap().id, revisions[2].id);

        let moved = StorageConfig::file("/tmp/elsewhere");
        DagRepository::update_storage_config(db, revisions[1].id, &moved).unwrap();
        assert_eq!(DagRepository::get(db, revisions[1].id).unwrap().storage_config, moved);
    }
}
