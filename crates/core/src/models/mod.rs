//! Typed records for every catalog entity.

mod artifact;
mod engine;
mod integration;
mod operator;
mod result;
mod workflow;

pub use artifact::{Artifact, ArtifactNode, DagEdge, EdgeType};
pub use engine::{
    AirflowEngineConfig, AqueductEngineConfig, EngineConfig, EngineType, IntegrationEngineConfig,
    ResourceConfig,
};
pub use integration::{Integration, User};
pub use operator::{
    CheckSpec, EntryPoint, ExtractSpec, FunctionSpec, FunctionType, GithubMetadata, LoadSpec,
    MetricSpec, Operator, OperatorNode, OperatorSpec, OperatorType, ParamSpec, SystemMetricSpec,
};
pub use result::{ArtifactResult, ArtifactResultMetadata, DagResult, OperatorResult};
pub use workflow::{
    Dag, NotificationLevel, NotificationSettings, RetentionPolicy, Schedule, TriggerType, Workflow,
};
