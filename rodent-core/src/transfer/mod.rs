//! Transfer-side data model: `TransferPolicy`, its record-retention
//! policy, and the `TransferPolicyMonitor` state machine.

pub mod manager;
pub mod ssh;

use crate::schedule::ScheduleSpec;
use crate::zfs_ops::TransferConfig;
use chrono::{DateTime, Utc};
use rodent_common::PolicyId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use manager::TransferPolicyManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferRunStatus {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRetentionPolicy {
    #[serde(default)]
    pub keep_count: u32,
    #[serde(default, with = "crate::serde_util::duration_secs_opt")]
    pub older_than: Option<std::time::Duration>,
    #[serde(default)]
    pub completed_only: bool,
    #[serde(default)]
    pub keep_failed: bool,
    #[serde(default)]
    pub keep_transfer_ids: HashSet<String>,
}

impl Default for TransferRetentionPolicy {
    fn default() -> Self {
        Self {
            keep_count: 0,
            older_than: None,
            completed_only: false,
            keep_failed: false,
            keep_transfer_ids: HashSet::new(),
        }
    }
}

impl TransferRetentionPolicy {
    pub fn is_active(&self) -> bool {
        self.keep_count > 0 || self.older_than.map(|d| !d.is_zero()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPolicy {
    pub id: PolicyId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub snapshot_policy_id: String,
    #[serde(default)]
    pub transfer_config: TransferConfigSpec,
    pub schedules: Vec<ScheduleSpec>,
    #[serde(default)]
    pub retention_policy: TransferRetentionPolicy,
    #[serde(default = "crate::serde_util::default_true")]
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<TransferRunStatus>,
    pub last_run_error: Option<String>,
    #[serde(default)]
    pub last_transfer_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `TransferConfig` is not `Serialize`/`Deserialize` itself (it's the
/// wire type exchanged with the transfer engine); this is the persisted
/// shape a `TransferPolicy` carries between runs, converted to/from
/// `TransferConfig` at execution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfigSpec {
    pub send: SendConfigSpec,
    pub receive: ReceiveConfigSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendConfigSpec {
    #[serde(default)]
    pub replicate: bool,
    #[serde(default)]
    pub skip_missing: bool,
    #[serde(default)]
    pub properties: bool,
    #[serde(default)]
    pub large_blocks: bool,
    #[serde(default)]
    pub intermediary: bool,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub resumable: bool,
    #[serde(default, with = "crate::serde_util::duration_secs_opt")]
    pub timeout: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiveConfigSpec {
    pub target: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub resumable: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub remote: RemoteConfigSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfigSpec {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub private_key: Option<String>,
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

impl RemoteConfigSpec {
    pub fn is_remote(&self) -> bool {
        !self.host.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMonitorStatus {
    Idle,
    Running,
    Waiting,
    Paused,
    Error,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPolicyMonitor {
    pub status: TransferMonitorStatus,
    pub current_transfer_id: Option<String>,
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub last_skipped: bool,
    pub last_skip_reason: Option<String>,
    #[serde(default)]
    pub skip_count: u64,
    #[serde(default)]
    pub run_count: u64,
}

impl Default for TransferPolicyMonitor {
    fn default() -> Self {
        Self {
            status: TransferMonitorStatus::Idle,
            current_transfer_id: None,
            blocked_reason: None,
            last_skipped: false,
            last_skip_reason: None,
            skip_count: 0,
            run_count: 0,
        }
    }
}

/// One past run of a transfer policy, kept only in memory. Same runtime-
/// diagnostic split as `SnapshotRunRecord` on the snapshot side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRunRecord {
    pub ran_at: DateTime<Utc>,
    pub status: TransferRunStatus,
    pub transfer_id: Option<String>,
    pub error: Option<String>,
}

/// Parameters accepted by `AddPolicy`/`UpdatePolicy` on the transfer side.
#[derive(Debug, Clone, Default)]
pub struct TransferPolicyParams {
    pub id: String,
    pub name: String,
    pub description: String,
    pub snapshot_policy_id: String,
    pub transfer_config: TransferConfigSpec,
    pub schedules: Vec<ScheduleSpec>,
    pub retention_policy: TransferRetentionPolicy,
    pub enabled: bool,
}
