//! In-memory fakes for the collaborator traits, used by manager unit
//! tests. Not part of the public API.

use crate::zfs_ops::{
    CommandOutput, CreateSnapshotParams, DestroyParams, DestroyResult, DatasetInfo, ListQuery,
    ListResult, PrivilegedExec, PropertyValue, TransferConfig, TransferInfo, TransferManager,
    TransferStatus, ZfsOps,
};
use async_trait::async_trait;
use chrono::Utc;
use rodent_common::{Error, PolicyId, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MockZfsOps {
    snapshots: Mutex<Vec<DatasetInfo>>,
    next_guid: AtomicU64,
}

impl MockZfsOps {
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn seed(&self, datasets: Vec<DatasetInfo>) {
        *self.snapshots.lock().unwrap() = datasets;
    }

    pub fn snapshots(&self) -> Vec<DatasetInfo> {
        self.snapshots.lock().unwrap().clone()
    }
}

#[async_trait]
impl ZfsOps for MockZfsOps {
    async fn create_snapshot(&self, params: CreateSnapshotParams) -> Result<()> {
        let guid = self.next_guid.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}@{}", params.dataset, params.snap_name);
        let mut properties = HashMap::new();
        properties.insert("creation".to_string(), PropertyValue::Number(Utc::now().timestamp() as f64));
        properties.insert("guid".to_string(), PropertyValue::Text(format!("g{guid}")));
        self.snapshots.lock().unwrap().push(DatasetInfo { name, properties });
        Ok(())
    }

    async fn destroy(&self, params: DestroyParams) -> Result<DestroyResult> {
        let mut snaps = self.snapshots.lock().unwrap();
        let before = snaps.len();
        snaps.retain(|d| d.name != params.name);
        let destroyed = if snaps.len() < before { vec![params.name] } else { Vec::new() };
        Ok(DestroyResult { destroyed })
    }

    async fn list(&self, query: ListQuery) -> Result<ListResult> {
        let prefix = format!("{}@", query.name);
        let datasets = self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.name.starts_with(&prefix))
            .map(|d| (d.name.clone(), d.clone()))
            .collect();
        Ok(ListResult { datasets })
    }
}

#[derive(Default)]
pub struct MockPrivilegedExec {
    responses: Mutex<HashMap<String, CommandOutput>>,
    written_files: Mutex<Vec<String>>,
}

impl MockPrivilegedExec {
    pub fn succeed(&self, argv_joined: &str, stdout: &str) {
        self.responses.lock().unwrap().insert(
            argv_joined.to_string(),
            CommandOutput { stdout: stdout.to_string(), stderr: String::new(), exit_code: 0 },
        );
    }

    pub fn fail(&self, argv_joined: &str) {
        self.responses.lock().unwrap().insert(
            argv_joined.to_string(),
            CommandOutput { stdout: String::new(), stderr: "not found".to_string(), exit_code: 1 },
        );
    }
}

#[async_trait]
impl PrivilegedExec for MockPrivilegedExec {
    async fn execute_command(&self, argv: &[String]) -> Result<CommandOutput> {
        let key = argv.join(" ");
        self.responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::zfs_operation(format!("no mock response registered for: {key}")))
    }

    async fn write_temp_file(&self, contents: &str) -> Result<String> {
        let idx = self.written_files.lock().unwrap().len();
        let path = format!("/tmp/mock-identity-{idx}");
        self.written_files.lock().unwrap().push(contents.to_string());
        Ok(path)
    }
}

#[derive(Default)]
pub struct MockTransferManager {
    transfers: Mutex<HashMap<String, TransferInfo>>,
    next_id: AtomicU64,
}

impl MockTransferManager {
    pub fn seed(&self, info: TransferInfo) {
        self.transfers.lock().unwrap().insert(info.id.clone(), info);
    }

    pub fn set_status(&self, id: &str, status: TransferStatus) {
        if let Some(info) = self.transfers.lock().unwrap().get_mut(id) {
            info.status = status;
        }
    }
}

#[async_trait]
impl TransferManager for MockTransferManager {
    async fn start_transfer_with_policy(&self, cfg: TransferConfig, policy_id: PolicyId) -> Result<String> {
        let id = format!("transfer-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.transfers.lock().unwrap().insert(
            id.clone(),
            TransferInfo {
                id: id.clone(),
                policy_id: Some(policy_id),
                status: TransferStatus::Starting,
                source_snapshot: cfg.send.snapshot,
                target_dataset: cfg.receive.target,
                created_at: Utc::now(),
                error: None,
            },
        );
        Ok(id)
    }

    async fn create_skipped_transfer(&self, cfg: TransferConfig, policy_id: PolicyId, reason: String) -> Result<String> {
        let id = format!("skipped-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.transfers.lock().unwrap().insert(
            id.clone(),
            TransferInfo {
                id: id.clone(),
                policy_id: Some(policy_id),
                status: TransferStatus::Skipped,
                source_snapshot: cfg.send.snapshot,
                target_dataset: cfg.receive.target,
                created_at: Utc::now(),
                error: Some(reason),
            },
        );
        Ok(id)
    }

    async fn get_transfer(&self, id: &str) -> Result<TransferInfo> {
        self.transfers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("transfer {id} not found")))
    }

    async fn list_transfers(&self) -> Result<Vec<TransferInfo>> {
        Ok(self.transfers.lock().unwrap().values().cloned().collect())
    }

    async fn delete_transfer(&self, id: &str) -> Result<()> {
        self.transfers.lock().unwrap().remove(id);
        Ok(())
    }
}
