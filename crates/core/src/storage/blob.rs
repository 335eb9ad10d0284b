use super::config::{split_bucket, GcsConfig, S3Config};
use super::{validate_key, Storage, StorageError};
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Directory-backed storage (local development and single-node deployments)
#[derive(Debug, Clone)]
pub struct FileStorage {
    directory: PathBuf,
}

impl FileStorage {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.directory.join(key))
    }
}

/// Sibling of `path` a write is staged in before it is renamed into place.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", name, Uuid::new_v4().simple()))
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    if source.kind() == std::io::ErrorKind::NotFound {
        StorageError::ObjectDoesNotExist(key.to_string())
    } else {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait::async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.blob_path(key)?;
        let data = tokio::fs::read(&path).await.map_err(|e| io_error(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        let path = self.blob_path(key)?;

        // A missing parent is an I/O failure here, never ObjectDoesNotExist.
        let io = |source: std::io::Error| StorageError::Io {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }

        // Readers see either the old blob or the new one, never a partial write.
        let tmp = temp_path(&path);
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&value).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(source) = written {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                tracing::debug!("Failed to remove partial write {}: {}", tmp.display(), e);
            }
            return Err(io(source));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.blob_path(key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error(key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.blob_path(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(key, e))
    }
}

/// Object store-based storage (S3, GCS, in-memory)
pub struct ObjectStorage {
    store: Box<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStorage {
    pub fn new(store: Box<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Process-local store, used by tests and previews.
    pub fn in_memory() -> Self {
        Self::new(Box::new(object_store::memory::InMemory::new()), "")
    }

    pub fn s3(config: &S3Config) -> Result<Self, StorageError> {
        let (bucket, prefix) = split_bucket(&config.bucket, "s3://");
        let mut builder = AmazonS3Builder::from_env()
            .with_region(&config.region)
            .with_bucket_name(bucket);

        if !config.credentials_path.is_empty() {
            let profile = if config.credentials_profile.is_empty() {
                "default"
            } else {
                config.credentials_profile.as_str()
            };
            let credentials = read_aws_credentials(&config.credentials_path, profile)?;
            builder = builder
                .with_access_key_id(credentials.access_key_id)
                .with_secret_access_key(credentials.secret_access_key);
            if let Some(token) = credentials.session_token {
                builder = builder.with_token(token);
            }
        }

        Ok(Self::new(Box::new(builder.build()?), prefix))
    }

    pub fn gcs(config: &GcsConfig) -> Result<Self, StorageError> {
        let (bucket, prefix) = split_bucket(&config.bucket, "gs://");
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if !config.service_account_credentials.is_empty() {
            builder = builder.with_service_account_key(&config.service_account_credentials);
        }
        Ok(Self::new(Box::new(builder.build()?), prefix))
    }

    fn object_key(&self, key: &str) -> Result<ObjectPath, StorageError> {
        validate_key(key)?;
        let full = if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        };
        Ok(ObjectPath::from(full))
    }
}

fn backend_error(key: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::ObjectDoesNotExist(key.to_string()),
        other => StorageError::Backend(other),
    }
}

#[async_trait::async_trait]
impl Storage for ObjectStorage {
    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.object_key(key)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| backend_error(key, e))?;
        result.bytes().await.map_err(|e| backend_error(key, e))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        let path = self.object_key(key)?;
        self.store.put(&path, value.into()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_key(key)?;
        // Object stores delete idempotently; keep the file backend's contract.
        self.store
            .head(&path)
            .await
            .map_err(|e| backend_error(key, e))?;
        self.store
            .delete(&path)
            .await
            .map_err(|e| backend_error(key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.object_key(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::Backend(e)),
        }
    }
}

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

/// Reads one profile out of an AWS shared credentials file.
fn read_aws_credentials(path: &str, profile: &str) -> Result<AwsCredentials, StorageError> {
    let expanded = match path.strip_prefix("~/") {
        Some(rest) => std::env::var("HOME")
            .map(|home| format!("{}/{}", home, rest))
            .unwrap_or_else(|_| path.to_string()),
        None => path.to_string(),
    };
    let content = std::fs::read_to_string(&expanded).map_err(|e| {
        StorageError::Config(format!("cannot read credentials file {}: {}", expanded, e))
    })?;
    parse_aws_credentials(&content, profile).ok_or_else(|| {
        StorageError::Config(format!(
            "profile {} not found or incomplete in {}",
            profile, expanded
        ))
    })
}

/// Drop a full-line comment, or an inline one opened by `#` or `;` after
/// whitespace.
fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with(['#', ';']) {
        return "";
    }
    let mut prev_space = false;
    for (idx, ch) in line.char_indices() {
        if prev_space && (ch == '#' || ch == ';') {
            return &line[..idx];
        }
        prev_space = ch.is_whitespace();
    }
    line
}

fn parse_aws_credentials(content: &str, profile: &str) -> Option<AwsCredentials> {
    let mut in_profile = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in content.lines() {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            // `[profile name]` is the config file spelling of `[name]`.
            let section = section.trim();
            let name = section.strip_prefix("profile ").unwrap_or(section);
            in_profile = name.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((name, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match name.trim() {
                "aws_access_key_id" => access_key_id = Some(value),
                "aws_secret_access_key" => secret_access_key = Some(value),
                "aws_session_token" => session_token = Some(value),
                _ => {}
            }
        }
    }

    Some(AwsCredentials {
        access_key_id: access_key_id?,
        secret_access_key: secret_access_key?,
        session_token,
    })
}
