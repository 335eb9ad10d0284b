use aqueduct_core::catalog::{DagRepository, WorkflowRepository};
use aqueduct_core::database::Database;
use aqueduct_core::retention::apply_retention;
use aqueduct_core::scheduler::CronTrigger;
use aqueduct_core::workflow::{AqueductTimeConfig, Executor};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Runs the latest revision of a workflow, then applies its retention policy
pub struct ScheduledRun {
    pub db: Arc<dyn Database>,
    pub executor: Arc<Executor>,
    pub time_config: AqueductTimeConfig,
}

impl ScheduledRun {
    async fn run(&self, workflow_id: Uuid) -> anyhow::Result<()> {
        let dag = DagRepository::latest_for_workflow(self.db.as_ref(), workflow_id)?;
        let outcome = self
            .executor
            .run(dag.id, HashMap::new(), &self.time_config, false)
            .await?;
        match &outcome.error {
            None => tracing::info!(
                "Scheduled run {} of workflow {} succeeded",
                outcome.dag_result.id,
                workflow_id
            ),
            Some(e) => tracing::warn!(
                "Scheduled run {} of workflow {} ended {}: {}",
                outcome.dag_result.id,
                workflow_id,
                outcome.status(),
                e
            ),
        }

        let workflow = WorkflowRepository::get(self.db.as_ref(), workflow_id)?;
        apply_retention(self.db.as_ref(), &workflow).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CronTrigger for ScheduledRun {
    async fn fire(&self, workflow_id: Uuid) {
        if let Err(e) = self.run(workflow_id).await {
            tracing::error!("Scheduled run of workflow {} failed: {:#}", workflow_id, e);
        }
    }
}
