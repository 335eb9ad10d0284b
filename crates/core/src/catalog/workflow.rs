use super::{json_field, DagRepository};
use crate::database::{Database, DbError, FromRow, Json, QueryExt, Row};
use crate::models::{NotificationSettings, RetentionPolicy, Schedule, TriggerType, Workflow};
use crate::sql_args;
use uuid::Uuid;

const COLUMNS: &str = "id, user_id, name, description, schedule, retention_policy, \
                       notification_settings, created_at";

impl FromRow for Workflow {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        let notification_settings: Option<Json<NotificationSettings>> =
            row.get("notification_settings")?;
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            schedule: row.get::<Json<Schedule>>("schedule")?.0,
            retention_policy: row.get::<Json<RetentionPolicy>>("retention_policy")?.0,
            notification_settings: notification_settings.map(Json::into_inner).unwrap_or_default(),
            created_at: row.get("created_at")?,
        })
    }
}

pub struct WorkflowRepository;

impl WorkflowRepository {
    pub fn create(db: &dyn Database, workflow: &Workflow) -> Result<(), DbError> {
        db.execute(
            &format!(
                "INSERT INTO workflow ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            ),
            &sql_args![
                workflow.id,
                workflow.user_id,
                workflow.name,
                workflow.description,
                Json(&workflow.schedule),
                Json(&workflow.retention_policy),
                Json(&workflow.notification_settings),
                workflow.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get(db: &dyn Database, id: Uuid) -> Result<Workflow, DbError> {
        db.query_optional(
            &format!("SELECT {COLUMNS} FROM workflow WHERE id = $1"),
            &sql_args![id],
        )?
        .ok_or_else(|| DbError::not_found("workflow", id))
    }

    pub fn get_by_name(db: &dyn Database, user_id: Uuid, name: &str) -> Result<Option<Workflow>, DbError> {
        db.query_optional(
            &format!("SELECT {COLUMNS} FROM workflow WHERE user_id = $1 AND name = $2"),
            &sql_args![user_id, name],
        )
    }

    pub fn list_by_user(db: &dyn Database, user_id: Uuid) -> Result<Vec<Workflow>, DbError> {
        db.query_as(
            &format!("SELECT {COLUMNS} FROM workflow WHERE user_id = $1 ORDER BY created_at"),
            &sql_args![user_id],
        )
    }

    pub fn list(db: &dyn Database) -> Result<Vec<Workflow>, DbError> {
        db.query_as(&format!("SELECT {COLUMNS} FROM workflow ORDER BY created_at"), &[])
    }

    /// Workflows with a periodic trigger, paused ones included.
    pub fn list_with_schedule(db: &dyn Database) -> Result<Vec<Workflow>, DbError> {
        let trigger = json_field(db.dialect(), "schedule", "trigger");
        db.query_as(
            &format!("SELECT {COLUMNS} FROM workflow WHERE {trigger} = $1 ORDER BY created_at"),
            &sql_args!["periodic"],
        )
        .map(|workflows: Vec<Workflow>| {
            workflows
                .into_iter()
                .filter(|w| w.schedule.trigger == TriggerType::Periodic)
                .collect()
        })
    }

    pub fn update_metadata(
        db: &dyn Database,
        id: Uuid,
        name: &str,
        description: &str,
    ) -> Result<(), DbError> {
        let changed = db.execute(
            "UPDATE workflow SET name = $1, description = $2 WHERE id = $3",
            &sql_args![name, description, id],
        )?;
        found(changed, id)
    }

    pub fn update_schedule(db: &dyn Database, id: Uuid, schedule: &Schedule) -> Result<(), DbError> {
        let changed = db.execute(
            "UPDATE workflow SET schedule = $1 WHERE id = $2",
            &sql_args![Json(schedule), id],
        )?;
        found(changed, id)
    }

    pub fn update_retention_policy(
        db: &dyn Database,
        id: Uuid,
        policy: &RetentionPolicy,
    ) -> Result<(), DbError> {
        let changed = db.execute(
            "UPDATE workflow SET retention_policy = $1 WHERE id = $2",
            &sql_args![Json(policy), id],
        )?;
        found(changed, id)
    }

    pub fn update_notification_settings(
        db: &dyn Database,
        id: Uuid,
        settings: &NotificationSettings,
    ) -> Result<(), DbError> {
        let changed = db.execute(
            "UPDATE workflow SET notification_settings = $1 WHERE id = $2",
            &sql_args![Json(settings), id],
        )?;
        found(changed, id)
    }

    /// Delete a workflow together with every DAG revision it owns.
    pub fn delete(db: &dyn Database, id: Uuid) -> Result<(), DbError> {
        let txn = db.begin_transaction()?;
        DagRepository::delete_by_workflow(&txn, id)?;
        let changed = txn.execute("DELETE FROM workflow WHERE id = $1", &sql_args![id])?;
        found(changed, id)?;
        txn.commit()
    }
}

fn found(changed: u64, id: Uuid) -> Result<(), DbError> {
    if changed == 0 {
        Err(DbError::not_found("workflow", id))
    } else {
        Ok(())
    }
}
