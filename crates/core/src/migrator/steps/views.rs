//! `operator_node` and `artifact_node`: nodes joined with their position in
//! each DAG. A node belongs to every DAG one of its edges belongs to.

use crate::database::Dialect;
use crate::migrator::StepContext;

const BASE_OPERATOR_COLUMNS: &str = "o.id, o.name, o.description, o.spec";
const OPERATOR_COLUMNS: &str = "o.id, o.name, o.description, o.spec, o.engine_config, \
                                o.resources, o.execution_environment_id";

pub(super) const DROP_VIEWS: &str = "DROP VIEW IF EXISTS operator_node;
DROP VIEW IF EXISTS artifact_node;";

/// Ordered JSON array of `column` over the matching edges.
fn json_array(dialect: Dialect, column: &str, filter: &str) -> String {
    match dialect {
        Dialect::Postgres => format!(
            "COALESCE((SELECT json_agg(e.{column} ORDER BY e.idx) FROM workflow_dag_edge e \
             WHERE {filter}), '[]'::json)"
        ),
        Dialect::Sqlite => format!(
            "(SELECT json_group_array(e.{column} ORDER BY e.idx) FROM workflow_dag_edge e \
             WHERE {filter})"
        ),
    }
}

fn operator_view(dialect: Dialect, columns: &str) -> String {
    let inputs = json_array(
        dialect,
        "from_id",
        "e.workflow_dag_id = m.dag_id AND e.to_id = o.id AND e.type = 'artifact_to_operator'",
    );
    let outputs = json_array(
        dialect,
        "to_id",
        "e.workflow_dag_id = m.dag_id AND e.from_id = o.id AND e.type = 'operator_to_artifact'",
    );
    format!(
        "CREATE VIEW operator_node AS
         SELECT {columns}, m.dag_id, {inputs} AS inputs, {outputs} AS outputs
         FROM operator o
         JOIN (
             SELECT workflow_dag_id AS dag_id, from_id AS node_id FROM workflow_dag_edge
             WHERE type = 'operator_to_artifact'
             UNION
             SELECT workflow_dag_id AS dag_id, to_id AS node_id FROM workflow_dag_edge
             WHERE type = 'artifact_to_operator'
         ) m ON m.node_id = o.id;"
    )
}

fn artifact_view(dialect: Dialect) -> String {
    let outputs = json_array(
        dialect,
        "to_id",
        "e.workflow_dag_id = m.dag_id AND e.from_id = a.id AND e.type = 'artifact_to_operator'",
    );
    format!(
        "CREATE VIEW artifact_node AS
         SELECT a.id, a.name, a.description, a.type, m.dag_id,
             (SELECT e.from_id FROM workflow_dag_edge e
              WHERE e.workflow_dag_id = m.dag_id AND e.to_id = a.id
                AND e.type = 'operator_to_artifact'
              LIMIT 1) AS input,
             {outputs} AS outputs
         FROM artifact a
         JOIN (
             SELECT workflow_dag_id AS dag_id, to_id AS node_id FROM workflow_dag_edge
             WHERE type = 'operator_to_artifact'
             UNION
             SELECT workflow_dag_id AS dag_id, from_id AS node_id FROM workflow_dag_edge
             WHERE type = 'artifact_to_operator'
         ) m ON m.node_id = a.id;"
    )
}

fn column_types(dialect: Dialect) -> (&'static str, &'static str) {
    match dialect {
        Dialect::Postgres => ("JSONB", "UUID"),
        Dialect::Sqlite => ("BLOB", "BLOB"),
    }
}

pub(super) fn create_base_views(ctx: &StepContext<'_>) -> anyhow::Result<()> {
    ctx.db.execute_batch(&format!(
        "{}\n{}",
        operator_view(ctx.dialect, BASE_OPERATOR_COLUMNS),
        artifact_view(ctx.dialect)
    ))?;
    Ok(())
}

/// Per-operator engine, resources and execution environment. The operator
/// view names its columns, so it is recreated around the change.
pub(super) fn add_operator_overrides(ctx: &StepContext<'_>) -> anyhow::Result<()> {
    let (json, id) = column_types(ctx.dialect);
    ctx.db.execute_batch(&format!(
        "DROP VIEW IF EXISTS operator_node;
         ALTER TABLE operator ADD COLUMN engine_config {json};
         ALTER TABLE operator ADD COLUMN resources {json};
         ALTER TABLE operator ADD COLUMN execution_environment_id {id};
         {}",
        operator_view(ctx.dialect, OPERATOR_COLUMNS)
    ))?;
    Ok(())
}

pub(super) fn drop_operator_overrides(ctx: &StepContext<'_>) -> anyhow::Result<()> {
    ctx.db.execute_batch(&format!(
        "DROP VIEW IF EXISTS operator_node;
         ALTER TABLE operator DROP COLUMN execution_environment_id;
         ALTER TABLE operator DROP COLUMN resources;
         ALTER TABLE operator DROP COLUMN engine_config;
         {}",
        operator_view(ctx.dialect, BASE_OPERATOR_COLUMNS)
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_sql_is_dialect_specific() {
        let pg = operator_view(Dialect::Postgres, OPERATOR_COLUMNS);
        assert!(pg.contains("json_agg(e.from_id ORDER BY e.idx)"));
        assert!(pg.contains("'[]'::json"));

        let lite = artifact_view(Dialect::Sqlite);
        assert!(lite.contains("json_group_array(e.to_id ORDER BY e.idx)"));
        assert!(!lite.contains("::json"));
    }
}
