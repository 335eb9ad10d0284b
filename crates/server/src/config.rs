use anyhow::{bail, Context, Result};
use aqueduct_core::database::DatabaseConfig;
use aqueduct_core::migrator::DEFAULT_PYTHON;
use aqueduct_core::storage::StorageConfig;
use aqueduct_core::workflow::AqueductTimeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub time: TimeConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_storage() -> StorageConfig {
    StorageConfig::file(PathBuf::from("data").join("storage"))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            storage: default_storage(),
            vault: VaultConfig::default(),
            time: TimeConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Hex-encoded AES key of 16, 24 or 32 bytes
    #[serde(default)]
    pub encryption_key: String,
}

impl VaultConfig {
    pub fn key(&self) -> Result<Vec<u8>> {
        if self.encryption_key.is_empty() {
            bail!("vault.encryption_key is not set");
        }
        let key = hex::decode(self.encryption_key.trim())
            .context("vault.encryption_key is not valid hex")?;
        if ![16, 24, 32].contains(&key.len()) {
            bail!(
                "vault.encryption_key must be 16, 24 or 32 bytes, got {}",
                key.len()
            );
        }
        Ok(key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub operator_poll_interval_ms: u64,

    #[serde(default = "default_exec_timeout_s")]
    pub exec_timeout_s: u64,

    #[serde(default = "default_cleanup_timeout_s")]
    pub cleanup_timeout_s: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_exec_timeout_s() -> u64 {
    24 * 60 * 60
}

fn default_cleanup_timeout_s() -> u64 {
    30
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            operator_poll_interval_ms: default_poll_interval_ms(),
            exec_timeout_s: default_exec_timeout_s(),
            cleanup_timeout_s: default_cleanup_timeout_s(),
        }
    }
}

impl TimeConfig {
    pub fn to_time_config(&self) -> AqueductTimeConfig {
        AqueductTimeConfig {
            operator_poll_interval: Duration::from_millis(self.operator_poll_interval_ms),
            exec_timeout: Duration::from_secs(self.exec_timeout_s),
            cleanup_timeout: Duration::from_secs(self.cleanup_timeout_s),
        }
    }
}

/// Local engine: the program launched once per operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_program")]
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Interpreter for schema steps that need the Python serializers
    #[serde(default = "default_python")]
    pub python: String,
}

fn default_program() -> String {
    "aqueduct-executor".to_string()
}

fn default_python() -> String {
    DEFAULT_PYTHON.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            python: default_python(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(config_path).context("Failed to read configuration file")?;
        toml::from_str(&content).context("Failed to parse configuration file")
    }
}
