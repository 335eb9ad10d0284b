//! Migration steps shipped with the catalog.

mod base;
mod columns;
mod execution_state;
mod param_types;
mod views;

use super::{Action, Step, StepContext};

pub(crate) fn builtin() -> Vec<Step> {
    vec![
        Step::new(1, "base_schema")
            .up_postgres(Action::Sql(base::POSTGRES.to_string()))
            .up_sqlite(Action::Sql(base::SQLITE.to_string())),
        Step::new(2, "workflow_schedule")
            .up_postgres(Action::Sql(columns::SCHEDULE_UP_POSTGRES.to_string()))
            .up_sqlite(Action::Sql(columns::SCHEDULE_UP_SQLITE.to_string()))
            .down_postgres(Action::Sql(columns::SCHEDULE_DOWN_POSTGRES.to_string())),
        Step::new(3, "dag_edge_primary_key")
            .up_postgres(Action::Sql(columns::EDGE_PK_UP_POSTGRES.to_string()))
            .up_sqlite(Action::Code(columns::edge_pk_up_sqlite))
            .down_postgres(Action::Sql(columns::EDGE_PK_DOWN_POSTGRES.to_string())),
        Step::new(4, "execution_state").up(Action::Code(execution_state::backfill)),
        Step::new(5, "cancel_legacy_artifact_results")
            .up(Action::Code(execution_state::cancel_legacy_artifacts)),
        Step::new(6, "dag_engine_config_not_null")
            .up_postgres(Action::Sql(columns::ENGINE_CONFIG_UP_POSTGRES.to_string()))
            .up_sqlite(Action::Code(columns::engine_config_up_sqlite))
            .down_postgres(Action::Sql(columns::ENGINE_CONFIG_DOWN_POSTGRES.to_string())),
        Step::new(7, "node_views")
            .up(Action::Code(views::create_base_views))
            .down_postgres(Action::Sql(views::DROP_VIEWS.to_string())),
        Step::new(8, "operator_engine_overrides")
            .up(Action::Code(views::add_operator_overrides))
            .down_postgres(Action::Code(views::drop_operator_overrides)),
        Step::new(9, "workflow_notification_settings")
            .up_postgres(Action::Sql(columns::NOTIFICATIONS_UP_POSTGRES.to_string()))
            .up_sqlite(Action::Sql(columns::NOTIFICATIONS_UP_SQLITE.to_string()))
            .down_postgres(Action::Sql(columns::NOTIFICATIONS_DOWN_POSTGRES.to_string())),
        Step::new(10, "param_serialization_type")
            .up(Action::Code(param_types::encode))
            .down_postgres(Action::Code(param_types::decode)),
    ]
}

/// Replaces `table` with a new definition, keeping its rows.
///
/// SQLite cannot add constraints in place; the table is renamed, recreated
/// from `create_sql`, refilled and the old copy dropped. Runs inside the
/// step's transaction, so a failure leaves the original table intact.
pub(crate) fn rebuild_table(
    ctx: &StepContext<'_>,
    table: &str,
    create_sql: &str,
    columns: &str,
) -> anyhow::Result<()> {
    let old = format!("{}_old", table);
    ctx.db.execute_batch(&format!(
        "ALTER TABLE {table} RENAME TO {old};\n\
         {create_sql};\n\
         INSERT INTO {table} ({columns}) SELECT {columns} FROM {old};\n\
         DROP TABLE {old};"
    ))?;
    Ok(())
}
