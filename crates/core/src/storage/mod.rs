//! Key/value blob storage over a local directory, S3 or GCS.

pub mod blob;
mod config;

pub use blob::{FileStorage, ObjectStorage};
pub use config::{FileConfig, GcsConfig, S3Config, StorageConfig};

use bytes::Bytes;
use std::sync::Arc;

/// Errors returned by storage backends
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The key is absent. Kept distinct from I/O failures on purpose.
    #[error("Object does not exist: {0}")]
    ObjectDoesNotExist(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Object store error: {0}")]
    Backend(#[from] object_store::Error),

    #[error("Invalid storage config: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectDoesNotExist(_))
    }
}

/// Blob storage addressed by caller-supplied keys
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Fetch a blob, failing with `ObjectDoesNotExist` when the key is absent.
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Write a blob, replacing any previous value.
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError>;

    /// Delete a blob. Deleting an absent key fails with `ObjectDoesNotExist`.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::ObjectDoesNotExist(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Build the storage backend described by `config`.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match config {
        StorageConfig::File { file_config } => {
            Ok(Arc::new(FileStorage::new(file_config.directory.clone())))
        }
        StorageConfig::S3 { s3_config } => Ok(Arc::new(ObjectStorage::s3(s3_config)?)),
        StorageConfig::Gcs { gcs_config } => Ok(Arc::new(ObjectStorage::gcs(gcs_config)?)),
    }
}

/// Rejects keys that could escape the configured root.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part == ".." || part == ".")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
