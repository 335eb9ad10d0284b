use super::engine::{EngineConfig, ResourceConfig};
use crate::types::{CheckLevel, SerializationType};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A node of a DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub spec: OperatorSpec,
    /// Overrides the DAG's engine for this operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_config: Option<EngineConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_environment_id: Option<Uuid>,
}

/// An operator together with its position in one DAG
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorNode {
    pub operator: Operator,
    pub dag_id: Uuid,
    /// Input artifacts, ordered by edge idx
    pub inputs: Vec<Uuid>,
    /// Output artifacts, ordered by edge idx
    pub outputs: Vec<Uuid>,
}

/// What an operator does. Serialized with a `type` discriminator and one
/// variant-specific sub-record, e.g. `{"type": "check", "check": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorSpec {
    Function { function: FunctionSpec },
    Metric { metric: MetricSpec },
    Check { check: CheckSpec },
    Extract { extract: ExtractSpec },
    Load { load: LoadSpec },
    Param { param: ParamSpec },
    SystemMetric { system_metric: SystemMetricSpec },
}

impl OperatorSpec {
    pub fn operator_type(&self) -> OperatorType {
        match self {
            Self::Function { .. } => OperatorType::Function,
            Self::Metric { .. } => OperatorType::Metric,
            Self::Check { .. } => OperatorType::Check,
            Self::Extract { .. } => OperatorType::Extract,
            Self::Load { .. } => OperatorType::Load,
            Self::Param { .. } => OperatorType::Param,
            Self::SystemMetric { .. } => OperatorType::SystemMetric,
        }
    }

    /// The embedded function, for function, metric and check operators.
    pub fn function(&self) -> Option<&FunctionSpec> {
        match self {
            Self::Function { function } => Some(function),
            Self::Metric { metric } => Some(&metric.function),
            Self::Check { check } => Some(&check.function),
            _ => None,
        }
    }

    /// Storage key of the operator's code blob.
    pub fn storage_path(&self) -> Option<&str> {
        self.function().and_then(|f| f.storage_path.as_deref())
    }

    pub fn check_level(&self) -> Option<CheckLevel> {
        match self {
            Self::Check { check } => Some(check.level),
            _ => None,
        }
    }

    /// The connector an extract or load operator talks to.
    pub fn integration_id(&self) -> Option<Uuid> {
        match self {
            Self::Extract { extract } => Some(extract.integration_id),
            Self::Load { load } => Some(load.integration_id),
            _ => None,
        }
    }

    /// Checks variant-specific requirements that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(function) = self.function() {
            function.validate()?;
        }
        match self {
            Self::Extract { extract } if extract.service.is_empty() => {
                Err("extract operator has no service".to_string())
            }
            Self::Load { load } if load.service.is_empty() => {
                Err("load operator has no service".to_string())
            }
            Self::SystemMetric { system_metric } if system_metric.metric_name.is_empty() => {
                Err("system metric operator has no metric name".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    Function,
    Metric,
    Check,
    Extract,
    Load,
    Param,
    SystemMetric,
}

impl fmt::Display for OperatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Function => "function",
            Self::Metric => "metric",
            Self::Check => "check",
            Self::Extract => "extract",
            Self::Load => "load",
            Self::Param => "param",
            Self::SystemMetric => "system_metric",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionType {
    #[default]
    File,
    Github,
    BuiltIn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub file: String,
    pub class_name: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubMetadata {
    pub repo: String,
    pub branch: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    #[serde(rename = "type", default)]
    pub function_type: FunctionType,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<EntryPoint>,
    #[serde(default)]
    pub custom_args: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_metadata: Option<GithubMetadata>,
}

fn default_language() -> String {
    "python".to_string()
}

impl FunctionSpec {
    /// A file function whose code blob lives at `storage_path`.
    pub fn file(storage_path: impl Into<String>) -> Self {
        Self {
            function_type: FunctionType::File,
            language: default_language(),
            storage_path: Some(storage_path.into()),
            entry_point: None,
            custom_args: String::new(),
            github_metadata: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.function_type {
            FunctionType::Github if self.github_metadata.is_none() => {
                Err("github function is missing github metadata".to_string())
            }
            FunctionType::File if self.storage_path.is_none() => {
                Err("file function is missing a storage path".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    #[serde(default)]
    pub level: CheckLevel,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractSpec {
    pub service: String,
    pub integration_id: Uuid,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSpec {
    pub service: String,
    pub integration_id: Uuid,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A workflow parameter. `val` is the serialized default value; binary
/// serialization types carry it base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub val: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization_type: Option<SerializationType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMetricSpec {
    pub metric_name: String,
}
