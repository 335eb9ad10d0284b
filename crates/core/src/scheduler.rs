//! Process-local cron manager for periodic workflows.
//!
//! One entry per workflow. A paused entry has no schedule and no task;
//! editing an entry moves it between paused and active by stopping or
//! starting its task. The manager only fires triggers; runs themselves are
//! the executor's business.

use crate::models::Schedule;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("Invalid cron schedule {expr:?}: {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("Workflow {0} already has a cron entry")]
    AlreadyDeployed(Uuid),

    #[error("Workflow {0} has no cron entry")]
    NotFound(Uuid),
}

/// Fires a run of a workflow when its schedule comes due
#[async_trait::async_trait]
pub trait CronTrigger: Send + Sync {
    async fn fire(&self, workflow_id: Uuid);
}

/// Public view of one workflow's entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronEntry {
    pub workflow_id: Uuid,
    /// `None` while paused
    pub cron_schedule: Option<String>,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fired: Option<DateTime<Utc>>,
}

impl CronEntry {
    pub fn is_paused(&self) -> bool {
        self.cron_schedule.is_none()
    }
}

struct Slot {
    entry: CronEntry,
    task: Option<JoinHandle<()>>,
}

type Entries = Arc<RwLock<HashMap<Uuid, Slot>>>;

/// Parse a cron expression. Five-field expressions (no seconds) fire at
/// second zero; six and seven-field expressions are taken as they are.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, CronError> {
    let invalid = |reason: String| CronError::InvalidSchedule {
        expr: expr.to_string(),
        reason,
    };
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {}", expr.trim()),
        6 | 7 => expr.trim().to_string(),
        n => return Err(invalid(format!("expected 5 to 7 fields, got {}", n))),
    };
    cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

pub struct CronManager {
    entries: Entries,
    trigger: Arc<dyn CronTrigger>,
}

impl CronManager {
    pub fn new(trigger: Arc<dyn CronTrigger>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            trigger,
        }
    }

    /// Add an entry, paused when `cron_schedule` is `None`.
    pub async fn deploy(&self, workflow_id: Uuid, cron_schedule: Option<&str>) -> Result<(), CronError> {
        let parsed = cron_schedule.map(parse_cron).transpose()?;
        let mut entries = self.entries.write().await;
        if entries.contains_key(&workflow_id) {
            return Err(CronError::AlreadyDeployed(workflow_id));
        }
        let task = parsed.map(|schedule| self.spawn(workflow_id, schedule));
        entries.insert(
            workflow_id,
            Slot {
                entry: CronEntry {
                    workflow_id,
                    cron_schedule: cron_schedule.map(str::to_string),
                    next_fire: None,
                    last_fired: None,
                },
                task,
            },
        );
        tracing::info!(
            "Deployed cron entry for workflow {}: {}",
            workflow_id,
            cron_schedule.unwrap_or("paused")
        );
        Ok(())
    }

    /// Replace the schedule of an entry. `None` pauses it.
    pub async fn edit(&self, workflow_id: Uuid, cron_schedule: Option<&str>) -> Result<(), CronError> {
        let parsed = cron_schedule.map(parse_cron).transpose()?;
        let mut entries = self.entries.write().await;
        let slot = entries
            .get_mut(&workflow_id)
            .ok_or(CronError::NotFound(workflow_id))?;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.entry.cron_schedule = cron_schedule.map(str::to_string);
        slot.entry.next_fire = None;
        slot.task = parsed.map(|schedule| self.spawn(workflow_id, schedule));
        tracing::info!(
            "Edited cron entry for workflow {}: {}",
            workflow_id,
            cron_schedule.unwrap_or("paused")
        );
        Ok(())
    }

    /// Deploy or edit so the entry matches a workflow's schedule.
    pub async fn sync(&self, workflow_id: Uuid, schedule: &Schedule) -> Result<(), CronError> {
        let cron_schedule = schedule.active_cron();
        let exists = self.entries.read().await.contains_key(&workflow_id);
        if exists {
            self.edit(workflow_id, cron_schedule).await
        } else {
            self.deploy(workflow_id, cron_schedule).await
        }
    }

    pub async fn delete(&self, workflow_id: Uuid) -> Result<(), CronError> {
        let slot = self
            .entries
            .write()
            .await
            .remove(&workflow_id)
            .ok_or(CronError::NotFound(workflow_id))?;
        if let Some(task) = slot.task {
            task.abort();
        }
        tracing::info!("Deleted cron entry for workflow {}", workflow_id);
        Ok(())
    }

    pub async fn entry(&self, workflow_id: Uuid) -> Option<CronEntry> {
        self.entries
            .read()
            .await
            .get(&workflow_id)
            .map(|slot| slot.entry.clone())
    }

    pub async fn entries(&self) -> Vec<CronEntry> {
        self.entries
            .read()
            .await
            .values()
            .map(|slot| slot.entry.clone())
            .collect()
    }

    /// Stop every entry's task and forget all entries.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.write().await;
        for (_, slot) in entries.drain() {
            if let Some(task) = slot.task {
                task.abort();
            }
        }
        tracing::info!("Cron manager stopped");
    }

    fn spawn(&self, workflow_id: Uuid, schedule: cron::Schedule) -> JoinHandle<()> {
        let entries = self.entries.clone();
        let trigger = self.trigger.clone();
        tokio::spawn(async move {
            let mut after = Utc::now();
            loop {
                let Some(next) = next_fire(&schedule, after, Utc::now()) else {
                    tracing::info!("Cron schedule of workflow {} has no further occurrences", workflow_id);
                    break;
                };
                if let Some(slot) = entries.write().await.get_mut(&workflow_id) {
                    slot.entry.next_fire = Some(next);
                }

                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                tracing::info!("Triggering scheduled run of workflow {}", workflow_id);
                if let Some(slot) = entries.write().await.get_mut(&workflow_id) {
                    slot.entry.last_fired = Some(Utc::now());
                }
                let trigger = trigger.clone();
                tokio::spawn(async move { trigger.fire(workflow_id).await });
                after = next;
            }
        })
    }
}

/// First occurrence after both the last fire and `now`. Occurrences missed
/// while a run was being triggered are skipped rather than replayed.
fn next_fire(
    schedule: &cron::Schedule,
    last: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.after(&last.max(now)).next()
}
