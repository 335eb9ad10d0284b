use crate::types::ArtifactType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
}

/// An artifact together with its position in one DAG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNode {
    pub artifact: Artifact,
    pub dag_id: Uuid,
    /// Producing operator
    pub input: Option<Uuid>,
    /// Consuming operators, ordered by edge idx
    pub outputs: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    OperatorToArtifact,
    ArtifactToOperator,
}

impl EdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OperatorToArtifact => "operator_to_artifact",
            Self::ArtifactToOperator => "artifact_to_operator",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator_to_artifact" => Ok(Self::OperatorToArtifact),
            "artifact_to_operator" => Ok(Self::ArtifactToOperator),
            other => Err(format!("unknown edge type: {}", other)),
        }
    }
}

/// Edge of a DAG. `idx` orders the edge among its operator's inputs or outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagEdge {
    pub dag_id: Uuid,
    pub edge_type: EdgeType,
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub idx: i64,
}

impl DagEdge {
    /// The operator endpoint of this edge.
    pub fn operator_id(&self) -> Uuid {
        match self.edge_type {
            EdgeType::OperatorToArtifact => self.from_id,
            EdgeType::ArtifactToOperator => self.to_id,
        }
    }

    /// The artifact endpoint of this edge.
    pub fn artifact_id(&self) -> Uuid {
        match self.edge_type {
            EdgeType::OperatorToArtifact => self.to_id,
            EdgeType::ArtifactToOperator => self.from_id,
        }
    }
}
