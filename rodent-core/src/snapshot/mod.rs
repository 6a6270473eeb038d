//! Snapshot-side data model: `SnapshotPolicy`, its retention policy, and
//! the runtime `JobMonitor` the scheduler updates.

pub mod manager;

use crate::schedule::ScheduleSpec;
use chrono::{DateTime, Utc};
use rodent_common::PolicyId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use manager::SnapshotManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub count: u32,
    #[serde(default, with = "crate::serde_util::duration_secs_opt")]
    pub older_than: Option<std::time::Duration>,
    #[serde(default)]
    pub keep_named_snap: HashSet<String>,
    #[serde(default)]
    pub force_destroy: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { count: 0, older_than: None, keep_named_snap: HashSet::new(), force_destroy: false }
    }
}

impl RetentionPolicy {
    pub fn is_active(&self) -> bool {
        self.count > 0 || self.older_than.map(|d| !d.is_zero()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    pub id: PolicyId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub dataset: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub properties: std::collections::HashMap<String, String>,
    pub snap_name_pattern: String,
    pub schedules: Vec<ScheduleSpec>,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    #[serde(default)]
    pub transfer_policy_ids: Vec<String>,
    #[serde(default = "crate::serde_util::default_true")]
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_status: Option<RunStatus>,
    pub last_run_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SnapshotPolicy {
    pub fn add_transfer_policy_id(&mut self, id: &str) {
        if !self.transfer_policy_ids.iter().any(|existing| existing == id) {
            self.transfer_policy_ids.push(id.to_string());
        }
    }

    pub fn remove_transfer_policy_id(&mut self, id: &str) {
        self.transfer_policy_ids.retain(|existing| existing != id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobMonitorStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "completed")]
    Completed,
}

/// One past run of a policy's snapshot job, kept only in memory. Mirrors
/// the split `nas/scheduler.rs` draws between a `ScheduledJob`'s summary
/// fields and its bounded `JobExecution` history: `JobMonitor` above is
/// the persisted summary, this is a runtime diagnostic trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRunRecord {
    pub schedule_index: usize,
    pub ran_at: DateTime<Utc>,
    #[serde(default, with = "crate::serde_util::duration_secs_opt")]
    pub duration: Option<std::time::Duration>,
    pub status: RunStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMonitor {
    pub status: JobMonitorStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::serde_util::duration_secs_opt")]
    pub last_duration: Option<std::time::Duration>,
    #[serde(default)]
    pub run_count: u64,
    pub last_error: Option<String>,
}

impl Default for JobMonitor {
    fn default() -> Self {
        Self {
            status: JobMonitorStatus::Pending,
            last_run_at: None,
            last_duration: None,
            run_count: 0,
            last_error: None,
        }
    }
}

/// Parameters accepted by `AddPolicy`/`UpdatePolicy`. `id` is empty for
/// `AddPolicy` (a fresh UUID is assigned) and required for `UpdatePolicy`.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPolicyParams {
    pub id: String,
    pub name: String,
    pub description: String,
    pub dataset: String,
    pub recursive: bool,
    pub properties: std::collections::HashMap<String, String>,
    pub snap_name_pattern: String,
    pub schedules: Vec<ScheduleSpec>,
    pub retention_policy: RetentionPolicy,
    pub enabled: bool,
}
