//! Garbage collection of old workflow runs.

use crate::catalog::{ArtifactResultRepository, DagRepository, DagResultRepository};
use crate::database::{Database, DbError};
use crate::models::Workflow;
use crate::storage::{self, StorageConfig, StorageError};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What one retention pass removed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted_runs: Vec<Uuid>,
    pub deleted_blobs: usize,
    /// Content keys that could not be removed from storage.
    pub failed_blobs: Vec<String>,
}

/// Delete the terminal runs of `workflow` beyond its `k_latest_runs`.
///
/// Only terminal runs count toward the limit, so an in-flight run is never
/// collected. Result rows go in one transaction; content blobs are removed
/// afterwards and failures there are only reported.
pub async fn apply_retention(
    db: &dyn Database,
    workflow: &Workflow,
) -> Result<RetentionReport, RetentionError> {
    let policy = workflow.retention_policy;
    if policy.keeps_all() {
        return Ok(RetentionReport::default());
    }
    let keep = usize::try_from(policy.k_latest_runs).unwrap_or(usize::MAX);

    // Blob keys to drop, grouped by the storage of the run's revision.
    let mut blobs: Vec<(StorageConfig, Vec<String>)> = Vec::new();
    let expired: Vec<Uuid> = {
        let txn = db.begin_transaction()?;
        let expired: Vec<_> = DagResultRepository::list_by_workflow(&txn, workflow.id)?
            .into_iter()
            .filter(|r| r.exec_state.is_terminal())
            .skip(keep)
            .collect();

        let mut configs: HashMap<Uuid, usize> = HashMap::new();
        for run in &expired {
            let slot = match configs.get(&run.dag_id) {
                Some(slot) => *slot,
                None => {
                    let dag = DagRepository::get(&txn, run.dag_id)?;
                    blobs.push((dag.storage_config, Vec::new()));
                    configs.insert(run.dag_id, blobs.len() - 1);
                    blobs.len() - 1
                }
            };
            blobs[slot].1.extend(
                ArtifactResultRepository::list_by_dag_result(&txn, run.id)?
                    .into_iter()
                    .map(|a| a.content_path),
            );
        }

        let ids: Vec<Uuid> = expired.iter().map(|r| r.id).collect();
        DagResultRepository::delete(&txn, &ids)?;
        txn.commit()?;
        ids
    };

    let mut report = RetentionReport {
        deleted_runs: expired,
        ..Default::default()
    };
    for (config, keys) in blobs {
        let store = storage::open(&config)?;
        for key in keys {
            match store.delete(&key).await {
                Ok(()) => report.deleted_blobs += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!("Failed to delete content {} of expired run: {}", key, e);
                    report.failed_blobs.push(key);
                }
            }
        }
    }

    if !report.deleted_runs.is_empty() {
        tracing::info!(
            "Retention removed {} runs of workflow {} ({} blobs)",
            report.deleted_runs.len(),
            workflow.name,
            report.deleted_blobs
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::{catalog, workflow};
    use crate::catalog::{ArtifactRepository, UserRepository, WorkflowRepository};
    use crate::models::{Artifact, Dag, EngineConfig, RetentionPolicy};
    use crate::storage::FileStorage;
    use crate::storage::Storage;
    use crate::types::{ArtifactType, ExecutionState};
    use bytes::Bytes;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    struct Fixture {
        _catalog_dir: TempDir,
        store_dir: TempDir,
        db: std::sync::Arc<dyn Database>,
        workflow: Workflow,
        dag: Dag,
        artifact: Artifact,
    }

    fn fixture(k_latest_runs: i64) -> Fixture {
        let (catalog_dir, db) = catalog();
        let store_dir = TempDir::new().unwrap();
        let user = UserRepository::create(db.as_ref(), "a@b.c", "org", "").unwrap();
        let mut wf = workflow(user.id, "churn");
        wf.retention_policy = RetentionPolicy { k_latest_runs };
        WorkflowRepository::create(db.as_ref(), &wf).unwrap();
        let dag = Dag {
            id: Uuid::new_v4(),
            workflow_id: wf.id,
            created_at: Utc::now(),
            storage_config: StorageConfig::file(store_dir.path()),
            engine_config: EngineConfig::default(),
        };
        DagRepository::create(db.as_ref(), &dag).unwrap();
        let artifact = Artifact {
            id: Uuid::new_v4(),
            name: "table".to_string(),
            description: String::new(),
            artifact_type: ArtifactType::Table,
        };
        ArtifactRepository::create(db.as_ref(), &artifact).unwrap();
        Fixture {
            _catalog_dir: catalog_dir,
            store_dir,
            db,
            workflow: wf,
            dag,
            artifact,
        }
    }

    /// A run `minutes_ago` with one stored artifact, returning its id and content key.
    async fn run(f: &Fixture, minutes_ago: i64, terminal: bool) -> (Uuid, String) {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        let mut state = ExecutionState::registered(at);
        if terminal {
            state.succeed(at);
        }
        let result = DagResultRepository::create(f.db.as_ref(), f.dag.id, &state, at).unwrap();
        let key = Uuid::new_v4().to_string();
        ArtifactResultRepository::create(f.db.as_ref(), result.id, f.artifact.id, &key, Some(&state))
            .unwrap();
        FileStorage::new(f.store_dir.path().to_path_buf())
            .put(&key, Bytes::from_static(b"rows"))
            .await
            .unwrap();
        (result.id, key)
    }

    #[tokio::test]
    async fn test_keeps_latest_terminal_runs() {
        let f = fixture(2);
        let (oldest, oldest_key) = run(&f, 30, true).await;
        let (middle, _) = run(&f, 20, true).await;
        let (newest, _) = run(&f, 10, true).await;
        let (in_flight, _) = run(&f, 0, false).await;

        let report = apply_retention(f.db.as_ref(), &f.workflow).await.unwrap();
        assert_eq!(report.deleted_runs, vec![oldest]);
        assert_eq!(report.deleted_blobs, 1);

        let remaining: Vec<Uuid> = DagResultRepository::list_by_workflow(f.db.as_ref(), f.workflow.id)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(remaining, vec![in_flight, newest, middle]);
        assert!(ArtifactResultRepository::list_by_dag_result(f.db.as_ref(), oldest)
            .unwrap()
            .is_empty());
        assert!(!f.store_dir.path().join(oldest_key).exists());
    }

    #[tokio::test]
    async fn test_keep_all_policy_deletes_nothing() {
        let f = fixture(RetentionPolicy::KEEP_ALL);
        run(&f, 10, true).await;
        run(&f, 5, true).await;

        let report = apply_retention(f.db.as_ref(), &f.workflow).await.unwrap();
        assert_eq!(report, RetentionReport::default());
        assert_eq!(
            DagResultRepository::list_by_workflow(f.db.as_ref(), f.workflow.id).unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_missing_blobs_are_not_failures() {
        let f = fixture(0);
        let (_, key) = run(&f, 5, true).await;
        std::fs::remove_file(f.store_dir.path().join(key)).unwrap();

        let report = apply_retention(f.db.as_ref(), &f.workflow).await.unwrap();
        assert_eq!(report.deleted_runs.len(), 1);
        assert_eq!(report.deleted_blobs, 0);
        assert!(report.failed_blobs.is_empty());
    }
}
