use crate::types::{ArtifactType, ExecutionState, SerializationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One run of a DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagResult {
    pub id: Uuid,
    pub dag_id: Uuid,
    pub exec_state: ExecutionState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorResult {
    pub id: Uuid,
    pub dag_result_id: Uuid,
    pub operator_id: Uuid,
    pub exec_state: Option<ExecutionState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactResult {
    pub id: Uuid,
    pub dag_result_id: Uuid,
    pub artifact_id: Uuid,
    /// Storage key of the payload
    pub content_path: String,
    pub exec_state: Option<ExecutionState>,
    pub metadata: Option<ArtifactResultMetadata>,
}

/// Metadata reported by the job that wrote an artifact payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArtifactResultMetadata {
    /// Column name to column type, for tabular artifacts
    #[serde(default)]
    pub schema: Vec<HashMap<String, String>>,
    /// e.g. `runtime`, `max_memory`
    #[serde(default)]
    pub system_metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization_type: Option<SerializationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<ArtifactType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_type: Option<String>,
}
