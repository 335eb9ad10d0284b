//! Moving live blob and vault content to a new storage backend.
//!
//! [`migrate_storage`] copies everything the catalog still references and
//! repoints the DAGs inside one catalog transaction. The old copies are left
//! in place; [`cleanup_old_storage`] removes them once the caller is
//! satisfied with the move.

use crate::catalog::{
    ArtifactRepository, ArtifactResultRepository, DagRepository, IntegrationRepository,
    OperatorRepository,
};
use crate::database::{Database, DbError};
use crate::storage::{self, Storage, StorageConfig, StorageError};
use crate::types::ExecutionStatus;
use crate::vault::{Vault, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageMigrationError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Blob {key} of dag {dag_id} is missing from the old storage")]
    MissingBlob { key: String, dag_id: Uuid },

    #[error("Failed to copy {key}: {source}")]
    Copy {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to copy secret {name}: {source}")]
    Secret {
        name: String,
        #[source]
        source: VaultError,
    },
}

/// Keys copied by a committed migration, to be removed from the old backing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupManifest {
    pub old_storage: StorageConfig,
    pub new_storage: StorageConfig,
    pub content_keys: Vec<String>,
    pub vault_names: Vec<String>,
}

/// Outcome of [`cleanup_old_storage`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    /// Storage keys that could not be deleted, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Copies one blob. Returns whether it was copied; an absent blob is an
/// error only when `required`.
async fn copy_blob(
    old: &dyn Storage,
    new: &dyn Storage,
    key: &str,
    required: bool,
    dag_id: Uuid,
) -> Result<bool, StorageMigrationError> {
    let content = match old.get(key).await {
        Ok(content) => content,
        Err(e) if e.is_not_found() && !required => return Ok(false),
        Err(e) if e.is_not_found() => {
            return Err(StorageMigrationError::MissingBlob {
                key: key.to_string(),
                dag_id,
            })
        }
        Err(source) => {
            return Err(StorageMigrationError::Copy {
                key: key.to_string(),
                source,
            })
        }
    };
    new.put(key, content)
        .await
        .map_err(|source| StorageMigrationError::Copy {
            key: key.to_string(),
            source,
        })?;
    Ok(true)
}

/// Copy every live blob and secret from `old_config` to `new_config` and
/// point all DAGs at the new storage.
///
/// Nothing in the catalog changes unless every copy succeeds. Blobs already
/// written to the new storage by a failed attempt are left behind.
pub async fn migrate_storage(
    db: &dyn Database,
    old_config: &StorageConfig,
    new_config: &StorageConfig,
    vault_key: &[u8],
) -> Result<CleanupManifest, StorageMigrationError> {
    tracing::info!(
        "Migrating storage from {} to {}",
        old_config.describe(),
        new_config.describe()
    );
    let old_store = storage::open(old_config)?;
    let new_store = storage::open(new_config)?;
    let old_vault = Vault::new(old_store.clone(), vault_key)?;
    let new_vault = Vault::new(new_store.clone(), vault_key)?;

    let txn = db.begin_transaction()?;
    let mut copied: HashSet<String> = HashSet::new();
    let mut content_keys = Vec::new();

    for dag in DagRepository::list(&txn)? {
        if dag.engine_config.is_airflow() {
            tracing::debug!("Skipping airflow dag {}", dag.id);
            continue;
        }

        for node in ArtifactRepository::list_nodes_by_dag(&txn, dag.id)? {
            for result in ArtifactResultRepository::list_by_artifact(&txn, node.artifact.id)? {
                if !copied.insert(result.content_path.clone()) {
                    continue;
                }
                let required = result
                    .exec_state
                    .as_ref()
                    .is_some_and(|s| s.status == ExecutionStatus::Succeeded);
                if copy_blob(
                    old_store.as_ref(),
                    new_store.as_ref(),
                    &result.content_path,
                    required,
                    dag.id,
                )
                .await?
                {
                    content_keys.push(result.content_path);
                }
            }
        }

        for node in OperatorRepository::list_nodes_by_dag(&txn, dag.id)? {
            let Some(path) = node.operator.spec.storage_path() else {
                continue;
            };
            if !copied.insert(path.to_string()) {
                continue;
            }
            copy_blob(old_store.as_ref(), new_store.as_ref(), path, true, dag.id).await?;
            content_keys.push(path.to_string());
        }

        DagRepository::update_storage_config(&txn, dag.id, new_config)?;
    }

    let mut vault_names = Vec::new();
    for integration in IntegrationRepository::list(&txn)? {
        if !integration.stores_credentials() {
            continue;
        }
        let name = integration.vault_name();
        let secret_error = |source| StorageMigrationError::Secret {
            name: name.clone(),
            source,
        };
        let secrets = old_vault.get(&name).await.map_err(secret_error)?;
        new_vault.put(&name, &secrets).await.map_err(secret_error)?;
        vault_names.push(name);
    }

    txn.commit()?;
    tracing::info!(
        "Storage migration committed: {} blobs, {} secrets",
        content_keys.len(),
        vault_names.len()
    );

    Ok(CleanupManifest {
        old_storage: old_config.clone(),
        new_storage: new_config.clone(),
        content_keys,
        vault_names,
    })
}

/// Delete the keys listed in `manifest` from its old storage. Failures are
/// logged and reported, and never stop the pass.
pub async fn cleanup_old_storage(manifest: &CleanupManifest) -> Result<CleanupReport, StorageError> {
    let old_store = storage::open(&manifest.old_storage)?;
    let keys = manifest
        .content_keys
        .iter()
        .cloned()
        .chain(manifest.vault_names.iter().map(|name| Vault::object_key(name)));

    let mut report = CleanupReport::default();
    for key in keys {
        match old_store.delete(&key).await {
            Ok(()) => report.deleted += 1,
            Err(e) => {
                tracing::warn!("Failed to delete {} from old storage: {}", key, e);
                report.failed.push((key, e.to_string()));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::catalog;
    use crate::catalog::UserRepository;
    use crate::models::{AirflowEngineConfig, EngineConfig, Integration};
    use crate::storage::FileStorage;
    use crate::types::ExecutionState;
    use crate::workflow::dag::testing::{artifact, operator, produces};
    use crate::workflow::{register_dag, DagDefinition};
    use bytes::Bytes;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    const KEY: [u8; 32] = [9u8; 32];

    struct Fixture {
        _catalog_dir: TempDir,
        old_dir: TempDir,
        new_dir: TempDir,
        db: Arc<dyn Database>,
        dag_id: Uuid,
        produced: String,
        integration: Integration,
    }

    fn secrets() -> HashMap<String, String> {
        HashMap::from([("password".to_string(), "hunter2".to_string())])
    }

    /// One DAG on the old storage: a code blob, a succeeded result with
    /// content, a canceled result without, and one vaulted integration.
    async fn fixture(engine_config: EngineConfig) -> Fixture {
        let (catalog_dir, db) = catalog();
        let old_dir = TempDir::new().unwrap();
        let new_dir = TempDir::new().unwrap();
        let old_config = StorageConfig::file(old_dir.path());
        let old = FileStorage::new(old_dir.path().to_path_buf());

        let user = UserRepository::create(db.as_ref(), "a@b.c", "org", "").unwrap();
        let extract = operator("extract");
        let table = artifact("table");
        let registration = register_dag(
            db.as_ref(),
            user.id,
            DagDefinition {
                workflow_name: "churn".to_string(),
                description: String::new(),
                schedule: Default::default(),
                retention_policy: Default::default(),
                notification_settings: Default::default(),
                storage_config: old_config,
                engine_config,
                edges: vec![produces(&extract, &table, 0)],
                operators: vec![extract],
                artifacts: vec![table.clone()],
            },
        )
        .unwrap();
        let dag_id = registration.dag.id;
        old.put("code/extract.zip", Bytes::from_static(b"zip")).await.unwrap();

        let now = Utc::now();
        let mut succeeded = ExecutionState::registered(now);
        succeeded.succeed(now);
        let mut canceled = ExecutionState::registered(now);
        canceled.cancel(now);
        let run = crate::catalog::DagResultRepository::create(db.as_ref(), dag_id, &succeeded, now)
            .unwrap();
        let produced = Uuid::new_v4().to_string();
        ArtifactResultRepository::create(db.as_ref(), run.id, table.id, &produced, Some(&succeeded))
            .unwrap();
        ArtifactResultRepository::create(
            db.as_ref(),
            run.id,
            table.id,
            &Uuid::new_v4().to_string(),
            Some(&canceled),
        )
        .unwrap();
        old.put(&produced, Bytes::from_static(b"rows")).await.unwrap();

        let integration = Integration {
            id: Uuid::new_v4(),
            user_id: Some(user.id),
            organization_id: "org".to_string(),
            service: "postgres".to_string(),
            name: "warehouse".to_string(),
            config: HashMap::new(),
            created_at: now,
            validated: true,
        };
        IntegrationRepository::create(db.as_ref(), &integration).unwrap();
        Vault::new(Arc::new(old), &KEY)
            .unwrap()
            .put(&integration.vault_name(), &secrets())
            .await
            .unwrap();

        Fixture {
            _catalog_dir: catalog_dir,
            old_dir,
            new_dir,
            db,
            dag_id,
            produced,
            integration,
        }
    }

    #[tokio::test]
    async fn test_migrate_and_back_preserves_content() {
        let f = fixture(EngineConfig::default()).await;
        let old_config = StorageConfig::file(f.old_dir.path());
        let new_config = StorageConfig::file(f.new_dir.path());

        let manifest = migrate_storage(f.db.as_ref(), &old_config, &new_config, &KEY)
            .await
            .unwrap();
        assert_eq!(manifest.content_keys.len(), 2);
        assert_eq!(manifest.vault_names, vec![f.integration.vault_name()]);
        assert_eq!(
            DagRepository::get(f.db.as_ref(), f.dag_id).unwrap().storage_config,
            new_config
        );

        let report = cleanup_old_storage(&manifest).await.unwrap();
        assert_eq!(report.deleted, 3);
        assert!(report.failed.is_empty());
        assert!(!f.old_dir.path().join(&f.produced).exists());

        migrate_storage(f.db.as_ref(), &new_config, &old_config, &KEY)
            .await
            .unwrap();
        assert_eq!(std::fs::read(f.old_dir.path().join(&f.produced)).unwrap(), b"rows");
        assert_eq!(
            std::fs::read(f.old_dir.path().join("code/extract.zip")).unwrap(),
            b"zip"
        );
        let vault = Vault::new(Arc::new(FileStorage::new(f.old_dir.path().to_path_buf())), &KEY)
            .unwrap();
        assert_eq!(vault.get(&f.integration.vault_name()).await.unwrap(), secrets());
    }

    #[tokio::test]
    async fn test_missing_succeeded_blob_aborts() {
        let f = fixture(EngineConfig::default()).await;
        std::fs::remove_file(f.old_dir.path().join(&f.produced)).unwrap();
        let old_config = StorageConfig::file(f.old_dir.path());

        let err = migrate_storage(
            f.db.as_ref(),
            &old_config,
            &StorageConfig::file(f.new_dir.path()),
            &KEY,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageMigrationError::MissingBlob { .. }));
        assert_eq!(
            DagRepository::get(f.db.as_ref(), f.dag_id).unwrap().storage_config,
            old_config
        );
    }

    #[tokio::test]
    async fn test_airflow_dags_stay_put() {
        let f = fixture(EngineConfig::Airflow {
            airflow_config: AirflowEngineConfig {
                integration_id: Uuid::new_v4(),
                dag_id: "churn".to_string(),
                operator_to_task: HashMap::new(),
            },
        })
        .await;
        let old_config = StorageConfig::file(f.old_dir.path());

        let manifest = migrate_storage(
            f.db.as_ref(),
            &old_config,
            &StorageConfig::file(f.new_dir.path()),
            &KEY,
        )
        .await
        .unwrap();
        assert!(manifest.content_keys.is_empty());
        assert_eq!(
            DagRepository::get(f.db.as_ref(), f.dag_id).unwrap().storage_config,
            old_config
        );
    }
}
