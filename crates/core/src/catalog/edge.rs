use super::id_list;
use crate::database::{Database, DbError, FromRow, QueryExt, Row};
use crate::models::{DagEdge, EdgeType};
use crate::sql_args;
use uuid::Uuid;

const COLUMNS: &str = "workflow_dag_id, type, from_id, to_id, idx";

impl FromRow for DagEdge {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        let kind: String = row.get("type")?;
        Ok(Self {
            dag_id: row.get("workflow_dag_id")?,
            edge_type: kind.parse().map_err(|message| DbError::Decode {
                column: "type".to_string(),
                message,
            })?,
            from_id: row.get("from_id")?,
            to_id: row.get("to_id")?,
            idx: row.get("idx")?,
        })
    }
}

pub struct EdgeRepository;

impl EdgeRepository {
    pub fn create(db: &dyn Database, edge: &DagEdge) -> Result<(), DbError> {
        db.execute(
            &format!("INSERT INTO workflow_dag_edge ({COLUMNS}) VALUES ($1, $2, $3, $4, $5)"),
            &sql_args![
                edge.dag_id,
                edge.edge_type.as_str(),
                edge.from_id,
                edge.to_id,
                edge.idx
            ],
        )?;
        Ok(())
    }

    /// Edges of a DAG ordered by their slot index.
    pub fn list_by_dag(db: &dyn Database, dag_id: Uuid) -> Result<Vec<DagEdge>, DbError> {
        db.query_as(
            &format!(
                "SELECT {COLUMNS} FROM workflow_dag_edge WHERE workflow_dag_id = $1 \
                 ORDER BY type, idx"
            ),
            &sql_args![dag_id],
        )
    }

    /// Edges leaving `from_id` of the given kind, ordered by idx.
    pub fn list_from(
        db: &dyn Database,
        dag_id: Uuid,
        edge_type: EdgeType,
        from_id: Uuid,
    ) -> Result<Vec<DagEdge>, DbError> {
        db.query_as(
            &format!(
                "SELECT {COLUMNS} FROM workflow_dag_edge \
                 WHERE workflow_dag_id = $1 AND type = $2 AND from_id = $3 ORDER BY idx"
            ),
            &sql_args![dag_id, edge_type.as_str(), from_id],
        )
    }

    /// Operator and artifact ids touched by the edges of these DAGs.
    pub fn node_ids_by_dags(db: &dyn Database, dag_ids: &[Uuid]) -> Result<Vec<Uuid>, DbError> {
        if dag_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (placeholders, args) = id_list(dag_ids, 1);
        let mut ids = Vec::new();
        for row in db.query(
            &format!(
                "SELECT from_id, to_id FROM workflow_dag_edge WHERE workflow_dag_id IN ({placeholders})"
            ),
            &args,
        )? {
            ids.push(row.get::<Uuid>("from_id")?);
            ids.push(row.get::<Uuid>("to_id")?);
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub fn delete_by_dags(db: &dyn Database, dag_ids: &[Uuid]) -> Result<u64, DbError> {
        if dag_ids.is_empty() {
            return Ok(0);
        }
        let (placeholders, args) = id_list(dag_ids, 1);
        db.execute(
            &format!("DELETE FROM workflow_dag_edge WHERE workflow_dag_id IN ({placeholders})"),
            &args,
        )
    }

    /// Which of `ids` still appear on some edge.
    pub(crate) fn referenced(db: &dyn Database, ids: &[Uuid]) -> Result<Vec<Uuid>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let n = ids.len();
        let (from_list, mut args) = id_list(ids, 1);
        let (to_list, to_args) = id_list(ids, n + 1);
        args.extend(to_args);
        let rows = db.query(
            &format!(
                "SELECT from_id AS id FROM workflow_dag_edge WHERE from_id IN ({from_list}) \
                 UNION SELECT to_id AS id FROM workflow_dag_edge WHERE to_id IN ({to_list})"
            ),
            &args,
        )?;
        rows.iter().map(|r| r.get("id")).collect()
    }
}
