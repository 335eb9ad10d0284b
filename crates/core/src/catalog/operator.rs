use super::{id_list, EdgeRepository};
use crate::database::{Database, DbError, FromRow, Json, QueryExt, Row};
use crate::models::{EngineConfig, Operator, OperatorNode, OperatorSpec, ResourceConfig};
use crate::sql_args;
use uuid::Uuid;

const COLUMNS: &str =
    "id, name, description, spec, engine_config, resources, execution_environment_id";

impl FromRow for Operator {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        let engine_config: Option<Json<EngineConfig>> = row.get("engine_config")?;
        let resources: Option<Json<ResourceConfig>> = row.get("resources")?;
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            spec: row.get::<Json<OperatorSpec>>("spec")?.0,
            engine_config: engine_config.map(Json::into_inner),
            resources: resources.map(Json::into_inner),
            execution_environment_id: row.get("execution_environment_id")?,
        })
    }
}

impl FromRow for OperatorNode {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            operator: Operator::from_row(row)?,
            dag_id: row.get("dag_id")?,
            inputs: row.get::<Json<Vec<Uuid>>>("inputs")?.0,
            outputs: row.get::<Json<Vec<Uuid>>>("outputs")?.0,
        })
    }
}

pub struct OperatorRepository;

impl OperatorRepository {
    pub fn create(db: &dyn Database, operator: &Operator) -> Result<(), DbError> {
        db.execute(
            &format!("INSERT INTO operator ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"),
            &sql_args![
                operator.id,
                operator.name,
                operator.description,
                Json(&operator.spec),
                operator.engine_config.as_ref().map(Json),
                operator.resources.as_ref().map(Json),
                operator.execution_environment_id
            ],
        )?;
        Ok(())
    }

    pub fn get(db: &dyn Database, id: Uuid) -> Result<Operator, DbError> {
        db.query_optional(
            &format!("SELECT {COLUMNS} FROM operator WHERE id = $1"),
            &sql_args![id],
        )?
        .ok_or_else(|| DbError::not_found("operator", id))
    }

    pub fn get_node(db: &dyn Database, dag_id: Uuid, id: Uuid) -> Result<OperatorNode, DbError> {
        db.query_optional(
            &format!(
                "SELECT {COLUMNS}, dag_id, inputs, outputs FROM operator_node \
                 WHERE dag_id = $1 AND id = $2"
            ),
            &sql_args![dag_id, id],
        )?
        .ok_or_else(|| DbError::not_found("operator", id))
    }

    pub fn list_nodes_by_dag(db: &dyn Database, dag_id: Uuid) -> Result<Vec<OperatorNode>, DbError> {
        db.query_as(
            &format!(
                "SELECT {COLUMNS}, dag_id, inputs, outputs FROM operator_node \
                 WHERE dag_id = $1 ORDER BY name, id"
            ),
            &sql_args![dag_id],
        )
    }

    /// Deletes those of `ids` that are operators no edge references anymore.
    pub fn delete_unreferenced(db: &dyn Database, ids: &[Uuid]) -> Result<u64, DbError> {
        let kept = EdgeRepository::referenced(db, ids)?;
        let orphans: Vec<Uuid> = ids.iter().copied().filter(|id| !kept.contains(id)).collect();
        if orphans.is_empty() {
            return Ok(0);
        }
        let (placeholders, args) = id_list(&orphans, 1);
        db.execute(
            &format!("DELETE FROM operator WHERE id IN ({placeholders})"),
            &args,
        )
    }
}
