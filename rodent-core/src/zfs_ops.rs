//! Collaborator interfaces the core consumes, per the external-interfaces
//! section: `PrivilegedExec` (command execution), `ZfsOps` (typed `zfs`
//! operations), and `TransferManager` (the running-transfer registry).
//!
//! None of these are implemented here — the core only defines the
//! contract. Production wiring (the actual `zfs` CLI wrapper, the
//! privileged command runner) lives outside the core, per the purpose and
//! scope section.

use async_trait::async_trait;
use rodent_common::{PolicyId, Result};
use std::collections::HashMap;

/// Output of a command run through `PrivilegedExec`.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs shell commands under elevated privileges. The core never shells
/// out directly; every `zfs`/`ssh` invocation not covered by the typed
/// `ZfsOps` surface (remote probes, GUID reconciliation) goes through
/// this capability object.
#[async_trait]
pub trait PrivilegedExec: Send + Sync {
    async fn execute_command(&self, argv: &[String]) -> Result<CommandOutput>;

    /// Materializes `contents` (an SSH private key PEM) into a
    /// restricted-access temp file and returns its path, for `-i` on an
    /// assembled SSH command. The core never writes key material to a
    /// path of its own choosing — this capability owns that restriction.
    async fn write_temp_file(&self, contents: &str) -> Result<String>;
}

/// A single ZFS property value as `zfs list -p` reports it: either a
/// pre-parsed number or the raw string, since different `zfs`
/// implementations format `creation` differently (unix-seconds float vs.
/// numeric string).
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
}

impl PropertyValue {
    pub fn as_unix_seconds(&self) -> Option<i64> {
        match self {
            PropertyValue::Number(n) => Some(*n as i64),
            PropertyValue::Text(s) => s.trim().parse::<f64>().ok().map(|n| n as i64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            PropertyValue::Number(_) => None,
        }
    }
}

/// A single dataset or snapshot entry returned by `ZfsOps::list`.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub name: String,
    pub properties: HashMap<String, PropertyValue>,
}

impl DatasetInfo {
    pub fn creation(&self) -> Option<i64> {
        self.properties.get("creation").and_then(|v| v.as_unix_seconds())
    }

    pub fn guid(&self) -> Option<&str> {
        self.properties.get("guid").and_then(|v| v.as_str())
    }

    /// The short name after `@`, e.g. `tank/a@snap-1` -> `snap-1`.
    pub fn short_name(&self) -> &str {
        self.name.split('@').next_back().unwrap_or(&self.name)
    }
}

/// Dataset/snapshot type filter for `ZfsOps::list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZfsObjectType {
    Snapshot,
    Filesystem,
}

/// Query for `ZfsOps::list`, mirroring `zfs list -t <type> -o <properties> <name>`.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub name: String,
    pub object_type: ZfsObjectType,
    pub parsable: bool,
    pub properties: Vec<String>,
    pub sort_by_creation_desc: bool,
}

impl ListQuery {
    pub fn snapshots_of(dataset: &str) -> Self {
        Self {
            name: dataset.to_string(),
            object_type: ZfsObjectType::Snapshot,
            parsable: true,
            properties: vec!["name".into(), "creation".into(), "guid".into()],
            sort_by_creation_desc: true,
        }
    }
}

/// Result of `ZfsOps::list`.
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub datasets: HashMap<String, DatasetInfo>,
}

impl ListResult {
    /// Entries ordered newest snapshot first, matching `zfs list -S creation`.
    pub fn sorted_by_creation_desc(&self) -> Vec<&DatasetInfo> {
        let mut entries: Vec<&DatasetInfo> = self.datasets.values().collect();
        entries.sort_by(|a, b| b.creation().cmp(&a.creation()));
        entries
    }
}

/// Parameters for `ZfsOps::create_snapshot`.
#[derive(Debug, Clone)]
pub struct CreateSnapshotParams {
    pub dataset: String,
    pub snap_name: String,
    pub recursive: bool,
    pub properties: HashMap<String, String>,
}

/// Parameters for `ZfsOps::destroy`.
#[derive(Debug, Clone)]
pub struct DestroyParams {
    pub name: String,
    pub force: bool,
    pub defer_destroy: bool,
    pub recursive_destroy_children: bool,
    pub recursive_destroy_dependents: bool,
}

impl DestroyParams {
    pub fn snapshot(name: impl Into<String>, recursive: bool) -> Self {
        Self {
            name: name.into(),
            force: false,
            defer_destroy: true,
            recursive_destroy_children: recursive,
            recursive_destroy_dependents: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DestroyResult {
    pub destroyed: Vec<String>,
}

/// Typed operations over the `zfs` CLI. The core never formats the
/// underlying command line itself — that's the collaborator's job.
#[async_trait]
pub trait ZfsOps: Send + Sync {
    async fn create_snapshot(&self, params: CreateSnapshotParams) -> Result<()>;
    async fn destroy(&self, params: DestroyParams) -> Result<DestroyResult>;
    async fn list(&self, query: ListQuery) -> Result<ListResult>;
}

/// Remote endpoint for a replication target, per the transfer wire config.
#[derive(Debug, Clone, Default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub private_key: Option<String>,
    pub strict_host_key_checking: bool,
}

impl RemoteConfig {
    pub fn is_remote(&self) -> bool {
        !self.host.is_empty()
    }
}

/// `zfs send` side of a transfer.
#[derive(Debug, Clone, Default)]
pub struct SendConfig {
    pub snapshot: String,
    pub from_snapshot: Option<String>,
    pub replicate: bool,
    pub skip_missing: bool,
    pub properties: bool,
    pub large_blocks: bool,
    pub intermediary: bool,
    pub compressed: bool,
    pub verbose: bool,
    pub resumable: bool,
    pub timeout: std::time::Duration,
}

/// `zfs receive` side of a transfer.
#[derive(Debug, Clone, Default)]
pub struct ReceiveConfig {
    pub target: String,
    pub force: bool,
    pub resumable: bool,
    pub verbose: bool,
    pub remote_config: RemoteConfig,
}

/// Opaque per-transfer logging knobs; the core never inspects these.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TransferConfig {
    pub send: SendConfig,
    pub receive: ReceiveConfig,
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Starting,
    Running,
    Paused,
    Completed,
    Failed,
    Skipped,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub id: String,
    pub policy_id: Option<PolicyId>,
    pub status: TransferStatus,
    pub source_snapshot: String,
    pub target_dataset: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub error: Option<String>,
}

/// Owns running transfers keyed by id; consumed by `TransferPolicyManager`
/// for overlap detection, retention sweeps, and starting new transfers.
#[async_trait]
pub trait TransferManager: Send + Sync {
    async fn start_transfer_with_policy(
        &self,
        cfg: TransferConfig,
        policy_id: PolicyId,
    ) -> Result<String>;
    async fn create_skipped_transfer(
        &self,
        cfg: TransferConfig,
        policy_id: PolicyId,
        reason: String,
    ) -> Result<String>;
    async fn get_transfer(&self, id: &str) -> Result<TransferInfo>;
    async fn list_transfers(&self) -> Result<Vec<TransferInfo>>;
    async fn delete_transfer(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_value_parses_number_and_text() {
        assert_eq!(PropertyValue::Number(1700000000.0).as_unix_seconds(), Some(1700000000));
        assert_eq!(PropertyValue::Text("1700000000".into()).as_unix_seconds(), Some(1700000000));
        assert_eq!(PropertyValue::Text("garbage".into()).as_unix_seconds(), None);
    }

    #[test]
    fn dataset_info_short_name_splits_at_at_sign() {
        let info = DatasetInfo {
            name: "tank/a@autosnap-1".to_string(),
            properties: HashMap::new(),
        };
        assert_eq!(info.short_name(), "autosnap-1");
    }

    #[test]
    fn list_result_sorts_newest_first() {
        let mut datasets = HashMap::new();
        datasets.insert(
            "tank/a@s1".to_string(),
            DatasetInfo {
                name: "tank/a@s1".to_string(),
                properties: HashMap::from([("creation".to_string(), PropertyValue::Number(100.0))]),
            },
        );
        datasets.insert(
            "tank/a@s2".to_string(),
            DatasetInfo {
                name: "tank/a@s2".to_string(),
                properties: HashMap::from([("creation".to_string(), PropertyValue::Number(200.0))]),
            },
        );
        let result = ListResult { datasets };
        let sorted = result.sorted_by_creation_desc();
        assert_eq!(sorted[0].name, "tank/a@s2");
        assert_eq!(sorted[1].name, "tank/a@s1");
    }

    #[test]
    fn remote_config_is_remote_checks_host() {
        let local = RemoteConfig::default();
        assert!(!local.is_remote());
        let remote = RemoteConfig {
            host: "backup.example".to_string(),
            ..Default::default()
        };
        assert!(remote.is_remote());
    }
}
