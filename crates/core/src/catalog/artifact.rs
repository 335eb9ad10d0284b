use super::{id_list, EdgeRepository};
use crate::database::{Database, DbError, FromRow, Json, QueryExt, Row};
use crate::models::{Artifact, ArtifactNode};
use crate::sql_args;
use uuid::Uuid;

const COLUMNS: &str = "id, name, description, type";

impl FromRow for Artifact {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        let kind: String = row.get("type")?;
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            artifact_type: kind.parse().map_err(|message| DbError::Decode {
                column: "type".to_string(),
                message,
            })?,
        })
    }
}

impl FromRow for ArtifactNode {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            artifact: Artifact::from_row(row)?,
            dag_id: row.get("dag_id")?,
            input: row.get("input")?,
            outputs: row.get::<Json<Vec<Uuid>>>("outputs")?.0,
        })
    }
}

pub struct ArtifactRepository;

impl ArtifactRepository {
    pub fn create(db: &dyn Database, artifact: &Artifact) -> Result<(), DbError> {
        db.execute(
            &format!("INSERT INTO artifact ({COLUMNS}) VALUES ($1, $2, $3, $4)"),
            &sql_args![
                artifact.id,
                artifact.name,
                artifact.description,
                artifact.artifact_type.as_str()
            ],
        )?;
        Ok(())
    }

    pub fn get(db: &dyn Database, id: Uuid) -> Result<Artifact, DbError> {
        db.query_optional(
            &format!("SELECT {COLUMNS} FROM artifact WHERE id = $1"),
            &sql_args![id],
        )?
        .ok_or_else(|| DbError::not_found("artifact", id))
    }

    pub fn get_node(db: &dyn Database, dag_id: Uuid, id: Uuid) -> Result<ArtifactNode, DbError> {
        db.query_optional(
            &format!(
                "SELECT {COLUMNS}, dag_id, input, outputs FROM artifact_node \
                 WHERE dag_id = $1 AND id = $2"
            ),
            &sql_args![dag_id, id],
        )?
        .ok_or_else(|| DbError::not_found("artifact", id))
    }

    pub fn list_nodes_by_dag(db: &dyn Database, dag_id: Uuid) -> Result<Vec<ArtifactNode>, DbError> {
        db.query_as(
            &format!(
                "SELECT {COLUMNS}, dag_id, input, outputs FROM artifact_node \
                 WHERE dag_id = $1 ORDER BY name, id"
            ),
            &sql_args![dag_id],
        )
    }

    /// Deletes those of `ids` that are artifacts no edge references anymore.
    pub fn delete_unreferenced(db: &dyn Database, ids: &[Uuid]) -> Result<u64, DbError> {
        let kept = EdgeRepository::referenced(db, ids)?;
        let orphans: Vec<Uuid> = ids.iter().copied().filter(|id| !kept.contains(id)).collect();
        if orphans.is_empty() {
            return Ok(0);
        }
        let (placeholders, args) = id_list(&orphans, 1);
        db.execute(
            &format!("DELETE FROM artifact WHERE id IN ({placeholders})"),
            &args,
        )
    }
}
