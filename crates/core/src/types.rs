use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tip attached to failures the user cannot act on.
pub const TIP_INTERNAL_ERROR: &str =
    "Sorry, we've run into an unexpected error! Please inspect the server logs for details.";

/// Tip attached to runs that exceed their execution timeout.
pub const TIP_TIMEOUT: &str =
    "The workflow exceeded its execution timeout. Consider raising `exec_timeout` or splitting the workflow.";

/// Status of a run or of a node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Unknown,
}

impl ExecutionStatus {
    /// Whether no further transition is expected from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            // Legacy rows spell it both ways.
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Infrastructure failure, stops the run.
    System,
    /// User code failed in a way that must stop the run.
    UserFatal,
    /// User code failed but the run continues.
    UserNonFatal,
}

impl FailureType {
    pub fn stops_run(self) -> bool {
        !matches!(self, Self::UserNonFatal)
    }
}

/// Error attached to a failed execution state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub context: String,
    pub tip: String,
}

impl ErrorDetails {
    pub fn new(context: impl Into<String>, tip: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            tip: tip.into(),
        }
    }

    /// An internal error with the generic tip.
    pub fn internal(context: impl Into<String>) -> Self {
        Self::new(context, TIP_INTERNAL_ERROR)
    }
}

/// Output captured from user code
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Logs {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionTimestamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Status record attached to a run or to a node within a run.
///
/// `failure_type` and `error` are set iff the status is `failed`, a terminal
/// status always carries `finished_at`, and `running_at` is set once the
/// state has been `running`. The transition methods below keep those
/// invariants; `is_consistent` checks them on states read from elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_logs: Option<Logs>,
    #[serde(default)]
    pub timestamps: ExecutionTimestamps,
}

impl ExecutionState {
    /// A freshly registered, pending state.
    pub fn registered(now: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Pending,
            timestamps: ExecutionTimestamps {
                registered_at: Some(now),
                pending_at: Some(now),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Running;
        self.failure_type = None;
        self.error = None;
        if self.timestamps.running_at.is_none() {
            self.timestamps.running_at = Some(now);
        }
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Succeeded;
        self.failure_type = None;
        self.error = None;
        self.timestamps.finished_at = Some(now);
    }

    pub fn fail(&mut self, failure_type: FailureType, error: ErrorDetails, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Failed;
        self.failure_type = Some(failure_type);
        self.error = Some(error);
        self.timestamps.finished_at = Some(now);
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Canceled;
        self.failure_type = None;
        self.error = None;
        self.timestamps.finished_at = Some(now);
    }

    /// Builds a terminal failed state in one step.
    pub fn failed(failure_type: FailureType, error: ErrorDetails, now: DateTime<Utc>) -> Self {
        let mut state = Self::registered(now);
        state.fail(failure_type, error, now);
        state
    }

    /// Checks the status/failure/timestamp invariants.
    pub fn is_consistent(&self) -> bool {
        let failed = self.status == ExecutionStatus::Failed;
        if failed != self.failure_type.is_some() || failed != self.error.is_some() {
            return false;
        }
        if self.status.is_terminal() && self.timestamps.finished_at.is_none() {
            return false;
        }
        if self.status == ExecutionStatus::Running && self.timestamps.running_at.is_none() {
            return false;
        }
        true
    }

    /// Restores the invariants on a state reported by a job. A failure
    /// without a type is taken as a system failure.
    pub fn repair(&mut self, now: DateTime<Utc>) {
        if self.status == ExecutionStatus::Failed {
            if self.failure_type.is_none() {
                self.failure_type = Some(FailureType::System);
            }
            if self.error.is_none() {
                self.error = Some(ErrorDetails::internal(
                    "Job reported a failure without error details",
                ));
            }
        } else {
            self.failure_type = None;
            self.error = None;
        }
        if self.status.is_terminal() && self.timestamps.finished_at.is_none() {
            self.timestamps.finished_at = Some(now);
        }
        if self.status == ExecutionStatus::Running && self.timestamps.running_at.is_none() {
            self.timestamps.running_at = Some(now);
        }
    }
}

/// Type of the value an artifact carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    #[default]
    Untyped,
    String,
    Bool,
    Numeric,
    Dict,
    Tuple,
    Table,
    Json,
    Bytes,
    Image,
    Picklable,
    None,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untyped => "untyped",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Numeric => "numeric",
            Self::Dict => "dict",
            Self::Tuple => "tuple",
            Self::Table => "table",
            Self::Json => "json",
            Self::Bytes => "bytes",
            Self::Image => "image",
            Self::Picklable => "picklable",
            Self::None => "none",
        }
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown artifact type: {}", s))
    }
}

/// Encoding used to write an artifact payload to storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationType {
    String,
    Table,
    Json,
    Bytes,
    Image,
    Pickle,
}

impl SerializationType {
    /// Whether payloads of this type are carried as base64 text in parameter values.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Bytes | Self::Image | Self::Pickle | Self::Table)
    }
}

impl FromStr for SerializationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown serialization type: {}", s))
    }
}

/// Severity of a check operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckLevel {
    #[default]
    Error,
    Warning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_keep_invariants() {
        let now = Utc::now();
        let mut state = ExecutionState::registered(now);
        assert!(state.is_consistent());
        assert!(!state.is_terminal());

        state.start(now);
        assert!(state.is_consistent());
        assert_eq!(state.timestamps.running_at, Some(now));

        state.fail(FailureType::System, ErrorDetails::internal("boom"), now);
        assert!(state.is_consistent());
        assert!(state.is_terminal());

        state.cancel(now);
        assert!(state.is_consistent());
        assert!(state.error.is_none());
    }

    #[test]
    fn test_inconsistent_states_detected() {
        let now = Utc::now();
        let mut state = ExecutionState::registered(now);
        state.status = ExecutionStatus::Succeeded;
        assert!(!state.is_consistent(), "terminal without finished_at");

        let mut state = ExecutionState::registered(now);
        state.failure_type = Some(FailureType::UserFatal);
        assert!(!state.is_consistent(), "failure type without failed status");
    }

    #[test]
    fn test_repair_bare_failure() {
        let now = Utc::now();
        let mut state: ExecutionState = serde_json::from_str(r#"{"status":"failed"}"#).unwrap();
        assert!(!state.is_consistent());

        state.repair(now);
        assert!(state.is_consistent());
        assert_eq!(state.failure_type, Some(FailureType::System));
        assert!(state.failure_type.unwrap().stops_run());
        assert_eq!(state.timestamps.finished_at, Some(now));

        let mut succeeded = ExecutionState::registered(now);
        succeeded.succeed(now);
        succeeded.failure_type = Some(FailureType::UserNonFatal);
        succeeded.repair(now);
        assert!(succeeded.is_consistent());
        assert_eq!(succeeded.status, ExecutionStatus::Succeeded);
    }

    #[test]
    fn test_execution_state_wire_shape() {
        let now = Utc::now();
        let state = ExecutionState::failed(
            FailureType::UserNonFatal,
            ErrorDetails::new("check failed", "inspect the check"),
            now,
        );
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["failure_type"], "user_non_fatal");
        assert_eq!(value["error"]["context"], "check failed");
        assert!(value["timestamps"]["finished_at"].is_string());

        let parsed: ExecutionState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_legacy_status_spellings() {
        assert_eq!("cancelled".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Canceled);
        assert!("bogus".parse::<ExecutionStatus>().is_err());
        assert_eq!("table".parse::<ArtifactType>().unwrap(), ArtifactType::Table);
    }
}
