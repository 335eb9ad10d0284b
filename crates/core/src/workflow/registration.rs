use super::dag::{DagDefinition, DagGraph, DagValidationError};
use crate::catalog::{
    ArtifactRepository, DagRepository, EdgeRepository, OperatorRepository, WorkflowRepository,
};
use crate::database::{Database, DbError};
use crate::models::{Dag, DagEdge, Workflow};
use chrono::Utc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Invalid DAG: {0}")]
    Validation(#[from] DagValidationError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] DbError),
}

/// The workflow and the revision written by [`register_dag`]
#[derive(Debug, Clone)]
pub struct Registration {
    pub workflow: Workflow,
    pub dag: Dag,
    /// True when this revision created the workflow
    pub created_workflow: bool,
}

/// Validate `definition` and write it as a new revision of the user's
/// workflow of the same name, creating the workflow on first registration.
///
/// Operators and artifacts already in the catalog (unchanged nodes carried
/// over from an earlier revision) are referenced, not rewritten.
pub fn register_dag(
    db: &dyn Database,
    user_id: Uuid,
    definition: DagDefinition,
) -> Result<Registration, RegistrationError> {
    let dag_id = Uuid::new_v4();
    let edges: Vec<DagEdge> = definition
        .edges
        .into_iter()
        .map(|edge| edge.into_edge(dag_id))
        .collect();
    DagGraph::build(&definition.operators, &definition.artifacts, &edges)?;

    let now = Utc::now();
    let txn = db.begin_transaction()?;

    let existing = WorkflowRepository::get_by_name(&txn, user_id, &definition.workflow_name)?;
    let created_workflow = existing.is_none();
    let workflow = match existing {
        Some(mut workflow) => {
            WorkflowRepository::update_metadata(&txn, workflow.id, &workflow.name, &definition.description)?;
            WorkflowRepository::update_schedule(&txn, workflow.id, &definition.schedule)?;
            WorkflowRepository::update_retention_policy(&txn, workflow.id, &definition.retention_policy)?;
            WorkflowRepository::update_notification_settings(
                &txn,
                workflow.id,
                &definition.notification_settings,
            )?;
            workflow.description = definition.description;
            workflow.schedule = definition.schedule;
            workflow.retention_policy = definition.retention_policy;
            workflow.notification_settings = definition.notification_settings;
            workflow
        }
        None => {
            let workflow = Workflow {
                id: Uuid::new_v4(),
                user_id,
                name: definition.workflow_name,
                description: definition.description,
                schedule: definition.schedule,
                retention_policy: definition.retention_policy,
                notification_settings: definition.notification_settings,
                created_at: now,
            };
            WorkflowRepository::create(&txn, &workflow)?;
            workflow
        }
    };

    let dag = Dag {
        id: dag_id,
        workflow_id: workflow.id,
        created_at: now,
        storage_config: definition.storage_config,
        engine_config: definition.engine_config,
    };
    DagRepository::create(&txn, &dag)?;

    for operator in &definition.operators {
        match OperatorRepository::get(&txn, operator.id) {
            Ok(_) => tracing::debug!("Operator {} carried over from an earlier revision", operator.id),
            Err(e) if e.is_not_found() => OperatorRepository::create(&txn, operator)?,
            Err(e) => return Err(e.into()),
        }
    }
    for artifact in &definition.artifacts {
        match ArtifactRepository::get(&txn, artifact.id) {
            Ok(_) => tracing::debug!("Artifact {} carried over from an earlier revision", artifact.id),
            Err(e) if e.is_not_found() => ArtifactRepository::create(&txn, artifact)?,
            Err(e) => return Err(e.into()),
        }
    }
    for edge in &edges {
        EdgeRepository::create(&txn, edge)?;
    }
    txn.commit()?;

    tracing::info!(
        "Registered dag {} for workflow {} ({} operators)",
        dag.id,
        workflow.name,
        definition.operators.len()
    );
    Ok(Registration {
        workflow,
        dag,
        created_workflow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::catalog;
    use crate::catalog::UserRepository;
    use crate::models::{OperatorSpec, Schedule};
    use crate::storage::StorageConfig;
    use crate::workflow::dag::testing::{artifact, consumes, operator, produces};

    fn definition(name: &str) -> DagDefinition {
        let (extract, train) = (operator("extract"), operator("train"));
        let (table, model) = (artifact("table"), artifact("model"));
        DagDefinition {
            workflow_name: name.to_string(),
            description: "churn".to_string(),
            schedule: Schedule::default(),
            retention_policy: Default::default(),
            notification_settings: Default::default(),
            storage_config: StorageConfig::file("/tmp/aq"),
            engine_config: Default::default(),
            edges: vec![
                produces(&extract, &table, 0),
                consumes(&table, &train, 0),
                produces(&train, &model, 0),
            ],
            operators: vec![extract, train],
            artifacts: vec![table, model],
        }
    }

    #[test]
    fn test_register_then_load_nodes() {
        let (_dir, db) = catalog();
        let user = UserRepository::create(db.as_ref(), "a@b.c", "org", "").unwrap();

        let registration = register_dag(db.as_ref(), user.id, definition("churn")).unwrap();
        assert!(registration.created_workflow);

        let nodes = OperatorRepository::list_nodes_by_dag(db.as_ref(), registration.dag.id).unwrap();
        assert_eq!(nodes.len(), 2);
        let train = nodes.iter().find(|n| n.operator.name == "train").unwrap();
        assert_eq!(train.inputs.len(), 1);
        assert_eq!(train.outputs.len(), 1);
        assert_eq!(
            EdgeRepository::list_by_dag(db.as_ref(), registration.dag.id).unwrap().len(),
            3
        );
    }

    #[test]
    fn test_second_registration_adds_revision() {
        let (_dir, db) = catalog();
        let user = UserRepository::create(db.as_ref(), "a@b.c", "org", "").unwrap();

        let first = register_dag(db.as_ref(), user.id, definition("churn")).unwrap();
        let mut next = definition("churn");
        next.schedule = Schedule::periodic("0 * * * *");
        let second = register_dag(db.as_ref(), user.id, next).unwrap();

        assert!(!second.created_workflow);
        assert_eq!(first.workflow.id, second.workflow.id);
        assert_eq!(DagRepository::list_by_workflow(db.as_ref(), first.workflow.id).unwrap().len(), 2);
        let stored = WorkflowRepository::get(db.as_ref(), first.workflow.id).unwrap();
        assert_eq!(stored.schedule.cron_schedule, "0 * * * *");
    }

    #[test]
    fn test_invalid_definition_writes_nothing() {
        let (_dir, db) = catalog();
        let user = UserRepository::create(db.as_ref(), "a@b.c", "org", "").unwrap();

        let mut bad = definition("churn");
        if let OperatorSpec::Function { function } = &mut bad.operators[0].spec {
            function.storage_path = None;
        }
        let err = register_dag(db.as_ref(), user.id, bad).unwrap_err();
        assert!(matches!(err, RegistrationError::Validation(DagValidationError::InvalidSpec { .. })));
        assert!(WorkflowRepository::get_by_name(db.as_ref(), user.id, "churn").unwrap().is_none());
    }
}
