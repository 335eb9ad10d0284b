use crate::models::{
    Artifact, DagEdge, EdgeType, EngineConfig, NotificationSettings, Operator, RetentionPolicy,
    Schedule,
};
use crate::storage::StorageConfig;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Why a DAG definition was rejected
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DagValidationError {
    #[error("Node {0} is defined more than once")]
    DuplicateNode(Uuid),

    #[error("Edge {from} -> {to} ({edge_type}) references an unknown node")]
    UnknownEndpoint {
        edge_type: EdgeType,
        from: Uuid,
        to: Uuid,
    },

    #[error("Artifact {0} has no producing operator")]
    NoProducer(Uuid),

    #[error("Artifact {0} has more than one producing operator")]
    MultipleProducers(Uuid),

    #[error("Operator {0} is not connected to any artifact")]
    Disconnected(String),

    #[error("Edge indices of {node} {direction} are not contiguous from 0")]
    NonContiguousIdx { node: Uuid, direction: &'static str },

    #[error("DAG contains a cycle")]
    Cycle,

    #[error("Invalid operator {operator}: {reason}")]
    InvalidSpec { operator: String, reason: String },

    #[error("Unknown parameter {0}")]
    UnknownParameter(String),
}

/// An edge as submitted, before it belongs to a DAG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub idx: i64,
}

impl EdgeDefinition {
    pub fn into_edge(self, dag_id: Uuid) -> DagEdge {
        DagEdge {
            dag_id,
            edge_type: self.edge_type,
            from_id: self.from_id,
            to_id: self.to_id,
            idx: self.idx,
        }
    }
}

/// A DAG revision as submitted for registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagDefinition {
    pub workflow_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    #[serde(default)]
    pub notification_settings: NotificationSettings,
    pub storage_config: StorageConfig,
    #[serde(default)]
    pub engine_config: EngineConfig,
    pub operators: Vec<Operator>,
    pub artifacts: Vec<Artifact>,
    pub edges: Vec<EdgeDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Operator(Uuid),
    Artifact(Uuid),
}

/// Validated graph of one DAG revision
pub struct DagGraph {
    graph: DiGraph<Node, ()>,
    indices: HashMap<Uuid, NodeIndex>,
}

/// Checks that the `idx` values are exactly `0..n`.
fn contiguous(idx: &BTreeSet<i64>, count: usize) -> bool {
    idx.len() == count && idx.iter().copied().eq(0..count as i64)
}

impl DagGraph {
    /// Build the graph, rejecting anything the executor could not run.
    pub fn build(
        operators: &[Operator],
        artifacts: &[Artifact],
        edges: &[DagEdge],
    ) -> Result<Self, DagValidationError> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for operator in operators {
            operator
                .spec
                .validate()
                .map_err(|reason| DagValidationError::InvalidSpec {
                    operator: operator.name.clone(),
                    reason,
                })?;
            let node = graph.add_node(Node::Operator(operator.id));
            if indices.insert(operator.id, node).is_some() {
                return Err(DagValidationError::DuplicateNode(operator.id));
            }
        }
        for artifact in artifacts {
            let node = graph.add_node(Node::Artifact(artifact.id));
            if indices.insert(artifact.id, node).is_some() {
                return Err(DagValidationError::DuplicateNode(artifact.id));
            }
        }

        let mut producers: HashMap<Uuid, usize> = HashMap::new();
        let mut inputs: HashMap<Uuid, BTreeSet<i64>> = HashMap::new();
        let mut outputs: HashMap<Uuid, BTreeSet<i64>> = HashMap::new();
        let mut input_counts: HashMap<Uuid, usize> = HashMap::new();
        let mut output_counts: HashMap<Uuid, usize> = HashMap::new();

        for edge in edges {
            let endpoints = (indices.get(&edge.from_id), indices.get(&edge.to_id));
            let (Some(&from), Some(&to)) = endpoints else {
                return Err(unknown(edge));
            };
            let kinds_match = match edge.edge_type {
                EdgeType::OperatorToArtifact => {
                    matches!((graph[from], graph[to]), (Node::Operator(_), Node::Artifact(_)))
                }
                EdgeType::ArtifactToOperator => {
                    matches!((graph[from], graph[to]), (Node::Artifact(_), Node::Operator(_)))
                }
            };
            if !kinds_match {
                return Err(unknown(edge));
            }
            graph.add_edge(from, to, ());

            match edge.edge_type {
                EdgeType::OperatorToArtifact => {
                    *producers.entry(edge.to_id).or_default() += 1;
                    outputs.entry(edge.from_id).or_default().insert(edge.idx);
                    *output_counts.entry(edge.from_id).or_default() += 1;
                }
                EdgeType::ArtifactToOperator => {
                    inputs.entry(edge.to_id).or_default().insert(edge.idx);
                    *input_counts.entry(edge.to_id).or_default() += 1;
                }
            }
        }

        for artifact in artifacts {
            match producers.get(&artifact.id).copied().unwrap_or(0) {
                0 => return Err(DagValidationError::NoProducer(artifact.id)),
                1 => {}
                _ => return Err(DagValidationError::MultipleProducers(artifact.id)),
            }
        }

        for operator in operators {
            let n_in = input_counts.get(&operator.id).copied().unwrap_or(0);
            let n_out = output_counts.get(&operator.id).copied().unwrap_or(0);
            if n_in + n_out == 0 {
                return Err(DagValidationError::Disconnected(operator.name.clone()));
            }
            let empty = BTreeSet::new();
            if !contiguous(inputs.get(&operator.id).unwrap_or(&empty), n_in) {
                return Err(DagValidationError::NonContiguousIdx {
                    node: operator.id,
                    direction: "inputs",
                });
            }
            if !contiguous(outputs.get(&operator.id).unwrap_or(&empty), n_out) {
                return Err(DagValidationError::NonContiguousIdx {
                    node: operator.id,
                    direction: "outputs",
                });
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(DagValidationError::Cycle);
        }

        Ok(Self { graph, indices })
    }

    /// Operators in topological order (producers first)
    pub fn topological_order(&self) -> Vec<Uuid> {
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::new();
        while let Some(node) = topo.next(&self.graph) {
            if let Node::Operator(id) = self.graph[node] {
                order.push(id);
            }
        }
        order
    }

    /// Operators that consume no artifact and can start immediately
    pub fn entry_operators(&self) -> Vec<Uuid> {
        self.graph
            .node_indices()
            .filter(|&n| {
                matches!(self.graph[n], Node::Operator(_))
                    && self
                        .graph
                        .neighbors_directed(n, petgraph::Direction::Incoming)
                        .count()
                        == 0
            })
            .filter_map(|n| match self.graph[n] {
                Node::Operator(id) => Some(id),
                Node::Artifact(_) => None,
            })
            .collect()
    }

    /// Operators consuming any output of `operator_id`
    pub fn dependents(&self, operator_id: Uuid) -> HashSet<Uuid> {
        let Some(&node) = self.indices.get(&operator_id) else {
            return HashSet::new();
        };
        self.graph
            .neighbors_directed(node, petgraph::Direction::Outgoing)
            .flat_map(|artifact| {
                self.graph
                    .neighbors_directed(artifact, petgraph::Direction::Outgoing)
            })
            .filter_map(|n| match self.graph[n] {
                Node::Operator(id) => Some(id),
                Node::Artifact(_) => None,
            })
            .collect()
    }
}

fn unknown(edge: &DagEdge) -> DagValidationError {
    DagValidationError::UnknownEndpoint {
        edge_type: edge.edge_type,
        from: edge.from_id,
        to: edge.to_id,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::{FunctionSpec, OperatorSpec};
    use crate::types::ArtifactType;

    pub fn operator(name: &str) -> Operator {
        Operator {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            spec: OperatorSpec::Function {
                function: FunctionSpec::file(format!("code/{}.zip", name)),
            },
            engine_config: None,
            resources: None,
            execution_environment_id: None,
        }
    }

    pub fn artifact(name: &str) -> Artifact {
        Artifact {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            artifact_type: ArtifactType::Table,
        }
    }

    pub fn produces(op: &Operator, artifact: &Artifact, idx: i64) -> EdgeDefinition {
        EdgeDefinition {
            edge_type: EdgeType::OperatorToArtifact,
            from_id: op.id,
            to_id: artifact.id,
            idx,
        }
    }

    pub fn consumes(artifact: &Artifact, op: &Operator, idx: i64) -> EdgeDefinition {
        EdgeDefinition {
            edge_type: EdgeType::ArtifactToOperator,
            from_id: artifact.id,
            to_id: op.id,
            idx,
        }
    }
}
