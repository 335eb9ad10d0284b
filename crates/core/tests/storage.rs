mod common;

use aqueduct_core::catalog::{ArtifactResultRepository, DagRepository, DagResultRepository};
use aqueduct_core::storage::{FileStorage, Storage, StorageConfig};
use aqueduct_core::storage_migration::{migrate_storage, StorageMigrationError};
use aqueduct_core::vault::{Vault, VaultError};
use aqueduct_core::ExecutionState;
use bytes::Bytes;
use chrono::Utc;
use common::*;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

const KEY: [u8; 16] = [3u8; 16];

#[tokio::test]
async fn test_failed_storage_migration_leaves_catalog_on_old_storage() {
    let h = Harness::new();
    let a = function("a");
    let x = artifact("x");
    let dag = h.register(vec![a.clone()], vec![x.clone()], vec![produces(&a, &x, 0)]);

    let storage = h.storage();
    storage.put("code/a.zip", Bytes::from_static(b"zip")).await.unwrap();
    let now = Utc::now();
    let mut state = ExecutionState::registered(now);
    state.succeed(now);
    for _ in 0..3 {
        let run = DagResultRepository::create(h.db.as_ref(), dag.id, &state, now).unwrap();
        let key = Uuid::new_v4().to_string();
        storage.put(&key, Bytes::from_static(b"rows")).await.unwrap();
        ArtifactResultRepository::create(h.db.as_ref(), run.id, x.id, &key, Some(&state)).unwrap();
    }

    // A directory below a regular file can never be created.
    let scratch = TempDir::new().unwrap();
    let blocker = scratch.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let unreachable = StorageConfig::file(blocker.join("store"));

    let err = migrate_storage(h.db.as_ref(), &h.storage_config(), &unreachable, &KEY)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageMigrationError::Copy { .. }), "got {:?}", err);
    assert_eq!(
        DagRepository::get(h.db.as_ref(), dag.id).unwrap().storage_config,
        h.storage_config()
    );
}

#[tokio::test]
async fn test_vault_round_trip_and_tamper() {
    let dir = TempDir::new().unwrap();
    let vault = Vault::new(Arc::new(FileStorage::new(dir.path().to_path_buf())), &KEY).unwrap();
    let secrets = HashMap::from([
        ("a".to_string(), "1".to_string()),
        ("b".to_string(), "2".to_string()),
    ]);

    vault.put("k", &secrets).await.unwrap();
    assert_eq!(vault.get("k").await.unwrap(), secrets);

    let path = dir.path().join(Vault::object_key("k"));
    let mut sealed = std::fs::read(&path).unwrap();
    sealed[20] ^= 0x80;
    std::fs::write(&path, sealed).unwrap();

    assert!(matches!(vault.get("k").await, Err(VaultError::Decrypt(_))));
}
