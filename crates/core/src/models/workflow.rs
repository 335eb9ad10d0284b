use super::engine::EngineConfig;
use crate::storage::StorageConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// How runs of a workflow get triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Periodic,
    #[default]
    Manual,
    Cascade,
}

/// Trigger configuration of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub trigger: TriggerType,
    #[serde(default)]
    pub cron_schedule: String,
    #[serde(default)]
    pub disable_manual_trigger: bool,
    #[serde(default)]
    pub paused: bool,
    /// Upstream workflow for cascade triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
}

impl Schedule {
    pub fn periodic(cron_schedule: impl Into<String>) -> Self {
        Self {
            trigger: TriggerType::Periodic,
            cron_schedule: cron_schedule.into(),
            ..Default::default()
        }
    }

    /// Cron expression to deploy, `None` when the workflow has no active periodic trigger.
    pub fn active_cron(&self) -> Option<&str> {
        if self.trigger == TriggerType::Periodic && !self.paused && !self.cron_schedule.is_empty() {
            Some(&self.cron_schedule)
        } else {
            None
        }
    }
}

/// How many past runs of a workflow are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// -1 keeps every run
    pub k_latest_runs: i64,
}

impl RetentionPolicy {
    pub const KEEP_ALL: i64 = -1;

    pub fn keeps_all(&self) -> bool {
        self.k_latest_runs < 0
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            k_latest_runs: Self::KEEP_ALL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Success,
    Warning,
    Error,
    Neutral,
}

/// Notification resource id to threshold level
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub settings: HashMap<Uuid, NotificationLevel>,
}

/// A user-owned workflow, uniquely named within its user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: String,
    pub schedule: Schedule,
    pub retention_policy: RetentionPolicy,
    pub notification_settings: NotificationSettings,
    pub created_at: DateTime<Utc>,
}

/// An immutable revision of a workflow's graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub storage_config: StorageConfig,
    pub engine_config: EngineConfig,
}
