use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Services that are built into the platform and keep nothing in the vault.
const BUILT_IN_SERVICES: &[&str] = &["aqueduct", "aqueduct_demo", "filesystem"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub organization_id: String,
    pub api_key: String,
    pub auth0_id: String,
}

/// A registered connector resource.
///
/// The non-secret part of its configuration lives in `config`; credentials
/// are stored in the vault under the integration's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub organization_id: String,
    pub service: String,
    pub name: String,
    pub config: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub validated: bool,
}

impl Integration {
    pub fn stores_credentials(&self) -> bool {
        !BUILT_IN_SERVICES.contains(&self.service.as_str())
    }

    /// Vault entry name holding this integration's credentials.
    pub fn vault_name(&self) -> String {
        self.id.to_string()
    }
}
