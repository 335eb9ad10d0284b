use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Execution engine a DAG (or a single operator) runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineConfig {
    Aqueduct {
        #[serde(default)]
        aqueduct_config: AqueductEngineConfig,
    },
    K8s {
        k8s_config: IntegrationEngineConfig,
    },
    Lambda {
        lambda_config: IntegrationEngineConfig,
    },
    Databricks {
        databricks_config: IntegrationEngineConfig,
    },
    Airflow {
        airflow_config: AirflowEngineConfig,
    },
    Spark {
        spark_config: IntegrationEngineConfig,
    },
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::Aqueduct {
            aqueduct_config: AqueductEngineConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn engine_type(&self) -> EngineType {
        match self {
            Self::Aqueduct { .. } => EngineType::Aqueduct,
            Self::K8s { .. } => EngineType::K8s,
            Self::Lambda { .. } => EngineType::Lambda,
            Self::Databricks { .. } => EngineType::Databricks,
            Self::Airflow { .. } => EngineType::Airflow,
            Self::Spark { .. } => EngineType::Spark,
        }
    }

    pub fn is_airflow(&self) -> bool {
        self.engine_type() == EngineType::Airflow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Aqueduct,
    K8s,
    Lambda,
    Databricks,
    Airflow,
    Spark,
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aqueduct => "aqueduct",
            Self::K8s => "k8s",
            Self::Lambda => "lambda",
            Self::Databricks => "databricks",
            Self::Airflow => "airflow",
            Self::Spark => "spark",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AqueductEngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_exec_path: Option<String>,
}

/// Engines backed by a registered compute integration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationEngineConfig {
    pub integration_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirflowEngineConfig {
    pub integration_id: Uuid,
    pub dag_id: String,
    #[serde(default)]
    pub operator_to_task: HashMap<Uuid, String>,
}

/// Resource request of an operator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuda_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_wire_shape() {
        let config: EngineConfig = serde_json::from_str(r#"{"type":"aqueduct"}"#).unwrap();
        assert_eq!(config, EngineConfig::default());

        let id = Uuid::new_v4();
        let config = EngineConfig::Lambda {
            lambda_config: IntegrationEngineConfig { integration_id: id },
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["type"], "lambda");
        assert_eq!(value["lambda_config"]["integration_id"], id.to_string());
        assert_eq!(config.engine_type().to_string(), "lambda");
    }
}
