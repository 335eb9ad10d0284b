use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which blob backing artifact payloads, code blobs and the vault live on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    File { file_config: FileConfig },
    S3 { s3_config: S3Config },
    Gcs { gcs_config: GcsConfig },
}

impl StorageConfig {
    pub fn file(directory: impl Into<PathBuf>) -> Self {
        Self::File {
            file_config: FileConfig {
                directory: directory.into(),
            },
        }
    }

    /// Short human-readable description, safe to log.
    pub fn describe(&self) -> String {
        match self {
            Self::File { file_config } => format!("file:{}", file_config.directory.display()),
            Self::S3 { s3_config } => format!("s3:{}", s3_config.bucket),
            Self::Gcs { gcs_config } => format!("gcs:{}", gcs_config.bucket),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub region: String,
    /// Bucket name, optionally `s3://bucket/prefix`
    pub bucket: String,
    #[serde(default)]
    pub credentials_path: String,
    #[serde(default)]
    pub credentials_profile: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcsConfig {
    /// Bucket name, optionally `gs://bucket/prefix`
    pub bucket: String,
    /// Service account key JSON
    #[serde(default)]
    pub service_account_credentials: String,
}

/// Splits `scheme://bucket/some/prefix` into `("bucket", "some/prefix")`.
pub(crate) fn split_bucket(raw: &str, scheme: &str) -> (String, String) {
    let trimmed = raw.strip_prefix(scheme).unwrap_or(raw).trim_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, prefix)) => (bucket.to_string(), prefix.trim_matches('/').to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}
