//! `TransferPolicyManager`: owns transfer policies, executes transfers,
//! and applies transfer-record retention.

use super::ssh::{self, AncestorOutcome};
use super::{
    ReceiveConfigSpec, RemoteConfigSpec, SendConfigSpec, TransferConfigSpec, TransferMonitorStatus,
    TransferPolicy, TransferPolicyMonitor, TransferPolicyParams, TransferRetentionPolicy, TransferRunRecord,
    TransferRunStatus,
};
use crate::config::CoreConfig;
use crate::pattern;
use crate::persistence::{self, PolicyFile};
use crate::scheduler::{JobCallback, JobSpec, Scheduler};
use crate::snapshot::SnapshotManager;
use crate::zfs_ops::{
    DatasetInfo, ListQuery, PrivilegedExec, ReceiveConfig, RemoteConfig, SendConfig, TransferConfig, TransferManager,
    TransferStatus, ZfsOps,
};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use rodent_common::{Error, PolicyId, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Cap on the in-memory run-history trail kept per policy, mirroring the
/// same cap on the snapshot side.
const MAX_HISTORY: usize = 20;

#[derive(Debug, Clone)]
pub struct TransferPolicyView {
    pub policy: TransferPolicy,
    pub monitor: TransferPolicyMonitor,
}

/// Result of running a transfer policy once, via a schedule fire or a
/// manual `RunPolicy`.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Started { transfer_id: String, source_snapshot: String, target_dataset: String },
    Skipped { reason: String },
}

#[derive(Default)]
struct ManagerState {
    policies: HashMap<String, TransferPolicy>,
    monitors: HashMap<String, TransferPolicyMonitor>,
    history: HashMap<String, VecDeque<TransferRunRecord>>,
}

const MAX_SCHEDULES: usize = 5;

pub struct TransferPolicyManager {
    config: CoreConfig,
    snapshot_manager: Arc<SnapshotManager>,
    transfer_manager: Arc<dyn TransferManager>,
    zfs: Arc<dyn ZfsOps>,
    privileged: Arc<dyn PrivilegedExec>,
    scheduler: Scheduler,
    state: RwLock<ManagerState>,
    self_ref: Weak<TransferPolicyManager>,
}

impl TransferPolicyManager {
    pub fn new(
        config: CoreConfig,
        snapshot_manager: Arc<SnapshotManager>,
        transfer_manager: Arc<dyn TransferManager>,
        zfs: Arc<dyn ZfsOps>,
        privileged: Arc<dyn PrivilegedExec>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            snapshot_manager,
            transfer_manager,
            zfs,
            privileged,
            scheduler: Scheduler::new(),
            state: RwLock::new(ManagerState::default()),
            self_ref: weak.clone(),
        })
    }

    fn validate_params(&self, params: &TransferPolicyParams) -> Result<()> {
        if params.name.trim().is_empty() {
            return Err(Error::request_validation("name must not be empty"));
        }
        if params.snapshot_policy_id.trim().is_empty() {
            return Err(Error::request_validation("snapshot_policy_id must not be empty"));
        }
        if params.transfer_config.receive.target.trim().is_empty() {
            return Err(Error::request_validation("transfer_config.receive.target must not be empty"));
        }
        if !(1..=MAX_SCHEDULES).contains(&params.schedules.len()) {
            return Err(Error::request_validation(format!(
                "schedules must contain between 1 and {MAX_SCHEDULES} entries"
            )));
        }
        for spec in &params.schedules {
            spec.validate()?;
        }
        Ok(())
    }

    pub async fn add_policy(&self, params: TransferPolicyParams) -> Result<PolicyId> {
        self.validate_params(&params)?;
        self.snapshot_manager.get_policy(&params.snapshot_policy_id).await?;

        let id = if params.id.is_empty() { PolicyId::new() } else { PolicyId::from(params.id.clone()) };

        // Associate first: per the contract, this must succeed before
        // any in-memory mutation happens.
        self.snapshot_manager
            .update_transfer_policy_association("", &params.snapshot_policy_id, id.as_str())
            .await?;

        let now = Utc::now();
        let policy = TransferPolicy {
            id: id.clone(),
            name: params.name,
            description: params.description,
            snapshot_policy_id: params.snapshot_policy_id,
            transfer_config: params.transfer_config,
            schedules: params.schedules,
            retention_policy: params.retention_policy,
            enabled: params.enabled,
            last_run_at: None,
            last_run_status: None,
            last_run_error: None,
            last_transfer_id: String::new(),
            created_at: now,
            updated_at: now,
        };

        {
            let mut state = self.state.write().await;
            state.policies.insert(id.as_str().to_string(), policy.clone());
            state.monitors.insert(id.as_str().to_string(), TransferPolicyMonitor::default());
        }

        if policy.enabled {
            self.materialize_jobs(&policy).await?;
        }
        self.persist().await?;
        Ok(id)
    }

    pub async fn update_policy(&self, params: TransferPolicyParams) -> Result<()> {
        if params.id.is_empty() {
            return Err(Error::request_validation("update requires id"));
        }
        self.validate_params(&params)?;

        let existing = self.get_policy(&params.id).await?.policy;

        if existing.snapshot_policy_id != params.snapshot_policy_id {
            self.snapshot_manager.get_policy(&params.snapshot_policy_id).await?;
            self.snapshot_manager
                .update_transfer_policy_association(&existing.snapshot_policy_id, &params.snapshot_policy_id, &params.id)
                .await?;
        }

        self.remove_jobs_for_policy(&params.id).await;

        let mut transfer_config = params.transfer_config;
        if transfer_config.receive.remote.private_key.is_none() {
            transfer_config.receive.remote.private_key = existing.transfer_config.receive.remote.private_key.clone();
        }

        let updated = TransferPolicy {
            id: existing.id.clone(),
            name: params.name,
            description: params.description,
            snapshot_policy_id: params.snapshot_policy_id,
            transfer_config,
            schedules: params.schedules,
            retention_policy: params.retention_policy,
            enabled: params.enabled,
            last_run_at: existing.last_run_at,
            last_run_status: existing.last_run_status,
            last_run_error: existing.last_run_error,
            last_transfer_id: existing.last_transfer_id,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };

        {
            let mut state = self.state.write().await;
            state.policies.insert(params.id.clone(), updated.clone());
        }

        if updated.enabled {
            self.materialize_jobs(&updated).await?;
        }
        self.persist().await
    }

    pub async fn remove_policy(&self, id: &str, delete_transfers: bool) -> Result<()> {
        let policy = self.get_policy(id).await?.policy;
        self.remove_jobs_for_policy(id).await;

        if delete_transfers {
            for transfer in self.transfer_manager.list_transfers().await?.into_iter() {
                let owned_by_policy = transfer.policy_id.as_ref().map(|p| p.as_str() == id).unwrap_or(false);
                let active = matches!(transfer.status, TransferStatus::Running | TransferStatus::Paused | TransferStatus::Starting);
                if owned_by_policy && !active {
                    if let Err(err) = self.transfer_manager.delete_transfer(&transfer.id).await {
                        warn!(transfer_id = %transfer.id, error = %err.message, "failed to delete transfer during policy removal");
                    }
                }
            }
        }

        self.snapshot_manager
            .update_transfer_policy_association(&policy.snapshot_policy_id, "", id)
            .await?;

        let mut state = self.state.write().await;
        state.policies.remove(id);
        state.monitors.remove(id);
        drop(state);
        self.persist().await
    }

    pub async fn get_policy(&self, id: &str) -> Result<TransferPolicyView> {
        let state = self.state.read().await;
        let policy = state.policies.get(id).cloned().ok_or_else(|| Error::not_found(format!("transfer policy {id} not found")))?;
        let monitor = state.monitors.get(id).cloned().unwrap_or_default();
        Ok(TransferPolicyView { policy, monitor })
    }

    pub async fn list_policies(&self) -> Vec<TransferPolicyView> {
        let state = self.state.read().await;
        state
            .policies
            .values()
            .map(|policy| TransferPolicyView {
                policy: policy.clone(),
                monitor: state.monitors.get(policy.id.as_str()).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Read-only monitor accessor, mirroring the snapshot side's
    /// `get_monitor` and `NasScheduler::get_job`.
    pub async fn get_monitor(&self, id: &str) -> Result<TransferPolicyMonitor> {
        let state = self.state.read().await;
        state
            .monitors
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("transfer policy {id} not found")))
    }

    /// Most recent `limit` run records for `id`, newest first.
    pub async fn run_history(&self, id: &str, limit: usize) -> Vec<TransferRunRecord> {
        let state = self.state.read().await;
        state
            .history
            .get(id)
            .map(|records| records.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn enable_policy(&self, id: &str) -> Result<()> {
        let policy = self.get_policy(id).await?.policy;
        if policy.enabled {
            return Ok(());
        }
        {
            let mut state = self.state.write().await;
            if let Some(p) = state.policies.get_mut(id) {
                p.enabled = true;
            }
        }
        self.materialize_jobs(&self.get_policy(id).await?.policy).await?;
        self.persist().await
    }

    pub async fn disable_policy(&self, id: &str) -> Result<()> {
        let policy = self.get_policy(id).await?.policy;
        if !policy.enabled {
            return Ok(());
        }
        self.remove_jobs_for_policy(id).await;
        let mut state = self.state.write().await;
        if let Some(p) = state.policies.get_mut(id) {
            p.enabled = false;
        }
        if let Some(monitor) = state.monitors.get_mut(id) {
            monitor.status = TransferMonitorStatus::Disabled;
        }
        drop(state);
        self.persist().await
    }

    pub async fn check_snapshot_policy_in_use(&self, sp_id: &str) -> (bool, Vec<String>) {
        let state = self.state.read().await;
        let ids: Vec<String> = state
            .policies
            .values()
            .filter(|p| p.snapshot_policy_id == sp_id)
            .map(|p| p.id.as_str().to_string())
            .collect();
        (!ids.is_empty(), ids)
    }

    pub async fn start(&self) -> Result<()> {
        self.drop_all_jobs().await;
        self.load_policies().await?;
        self.scheduler.start().await?;
        let policies: Vec<TransferPolicy> = {
            let state = self.state.read().await;
            state.policies.values().filter(|p| p.enabled).cloned().collect()
        };
        for policy in policies {
            self.materialize_jobs(&policy).await?;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
        if let Err(err) = self.persist().await {
            warn!(error = %err.message, "failed to persist transfer config during stop");
        }
    }

    /// Runs a transfer policy once: overlap guard, snapshot selection,
    /// common-ancestor reconciliation, start. Drives the monitor
    /// `idle -> running -> {idle, error}` state machine (skip leaves
    /// `idle` with `last_skipped=true`).
    pub async fn run_policy(&self, policy_id: &str, snapshot_override: Option<String>) -> Result<ExecutionOutcome> {
        self.set_monitor_running(policy_id).await;
        let result = self.execute_transfer_for_policy(policy_id, snapshot_override).await;
        self.finish_monitor_run(policy_id, &result).await;
        result
    }

    async fn set_monitor_running(&self, policy_id: &str) {
        let mut state = self.state.write().await;
        let monitor = state.monitors.entry(policy_id.to_string()).or_insert_with(TransferPolicyMonitor::default);
        monitor.status = TransferMonitorStatus::Running;
        monitor.run_count += 1;
    }

    async fn finish_monitor_run(&self, policy_id: &str, result: &Result<ExecutionOutcome>) {
        let mut state = self.state.write().await;
        let monitor = state.monitors.entry(policy_id.to_string()).or_insert_with(TransferPolicyMonitor::default);
        // The overlap guard may have already moved the monitor to
        // `Waiting`; only a monitor still `Running` gets resolved here.
        if monitor.status != TransferMonitorStatus::Running {
            return;
        }
        match result {
            Ok(ExecutionOutcome::Started { .. }) => {
                monitor.status = TransferMonitorStatus::Idle;
            }
            Ok(ExecutionOutcome::Skipped { reason }) => {
                monitor.status = TransferMonitorStatus::Idle;
                monitor.last_skipped = true;
                monitor.last_skip_reason = Some(reason.clone());
                monitor.skip_count += 1;
            }
            Err(_) => {
                monitor.status = TransferMonitorStatus::Error;
            }
        }
        drop(state);

        let ran_at = Utc::now();
        let mut state = self.state.write().await;
        if let Some(policy) = state.policies.get_mut(policy_id) {
            policy.last_run_at = Some(ran_at);
            match result {
                Ok(ExecutionOutcome::Started { transfer_id, .. }) => {
                    policy.last_run_status = Some(TransferRunStatus::Success);
                    policy.last_run_error = None;
                    policy.last_transfer_id = transfer_id.clone();
                }
                Ok(ExecutionOutcome::Skipped { .. }) => {
                    policy.last_run_status = Some(TransferRunStatus::Skipped);
                    policy.last_run_error = None;
                }
                Err(err) => {
                    policy.last_run_status = Some(TransferRunStatus::Error);
                    policy.last_run_error = Some(err.message.clone());
                }
            }
        }

        let (status, transfer_id, error) = match result {
            Ok(ExecutionOutcome::Started { transfer_id, .. }) => (TransferRunStatus::Success, Some(transfer_id.clone()), None),
            Ok(ExecutionOutcome::Skipped { reason }) => (TransferRunStatus::Skipped, None, Some(reason.clone())),
            Err(err) => (TransferRunStatus::Error, None, Some(err.message.clone())),
        };
        let history = state.history.entry(policy_id.to_string()).or_default();
        history.push_front(TransferRunRecord { ran_at, status, transfer_id, error });
        history.truncate(MAX_HISTORY);

        drop(state);
        self.persist_best_effort().await;

        if matches!(result, Ok(ExecutionOutcome::Started { .. }) | Ok(ExecutionOutcome::Skipped { .. })) {
            let policy = self.get_policy(policy_id).await.ok().map(|v| v.policy);
            if let Some(policy) = policy {
                if let Err(err) = self.apply_retention_policy(&policy).await {
                    warn!(policy_id = %policy_id, error = %err.message, "transfer retention sweep failed");
                }
            }
        }
    }

    async fn execute_transfer_for_policy(&self, policy_id: &str, snapshot_override: Option<String>) -> Result<ExecutionOutcome> {
        let policy = self.get_policy(policy_id).await?.policy;

        // 1. Overlap guard.
        if !policy.last_transfer_id.is_empty() {
            let previous = self.transfer_manager.get_transfer(&policy.last_transfer_id).await;
            if let Ok(previous) = previous {
                if matches!(previous.status, TransferStatus::Starting | TransferStatus::Running | TransferStatus::Paused) {
                    let mut state = self.state.write().await;
                    let monitor = state.monitors.entry(policy_id.to_string()).or_insert_with(TransferPolicyMonitor::default);
                    monitor.status = TransferMonitorStatus::Waiting;
                    monitor.blocked_reason = Some(format!("Previous transfer {} still running", policy.last_transfer_id));
                    drop(state);
                    return Err(Error::transfer_overlap(format!(
                        "previous transfer {} is still active",
                        policy.last_transfer_id
                    )));
                }
            }
        }

        let sp = self.snapshot_manager.get_policy(&policy.snapshot_policy_id).await?.policy;
        let regex = pattern::compile_regex(&sp.snap_name_pattern)?;

        // 2. Pick source snapshot.
        let (source_snapshot, matching) = match &snapshot_override {
            Some(name) if !name.is_empty() => {
                if !name.contains('@') {
                    return Err(Error::request_validation("snapshot_override must be a full dataset@snapshot name"));
                }
                let matching = self.matching_source_snapshots(&sp.dataset, &regex).await?;
                (name.clone(), matching)
            }
            _ => {
                let matching = self.matching_source_snapshots(&sp.dataset, &regex).await?;
                let newest = matching.first().ok_or_else(|| {
                    Error::no_matching_snapshots(format!("no snapshot matches policy pattern for dataset {}", sp.dataset))
                })?;
                (newest.name.clone(), matching)
            }
        };

        let target_dataset = policy.transfer_config.receive.target.clone();
        let remote: RemoteConfigSpec = policy.transfer_config.receive.remote.clone();

        // 3. Find most recent common ancestor.
        let oldest = matching.last();
        let outcome = ssh::resolve_send_plan(
            self.privileged.as_ref(),
            &remote,
            &sp.dataset,
            &matching,
            &source_snapshot,
            &target_dataset,
            policy.transfer_config.send.intermediary,
            oldest,
        )
        .await?;

        let from_snapshot = match outcome {
            AncestorOutcome::InSync => {
                let reason = format!("target already has the latest snapshot: {source_snapshot}");
                self.transfer_manager
                    .create_skipped_transfer(
                        self.build_transfer_config(&policy, &source_snapshot, None),
                        policy.id.clone(),
                        reason.clone(),
                    )
                    .await?;
                return Ok(ExecutionOutcome::Skipped { reason });
            }
            AncestorOutcome::Incremental(common) => Some(common),
            AncestorOutcome::FullThenIncremental(oldest) => Some(oldest),
            AncestorOutcome::Full => None,
        };

        // 4. Start.
        let transfer_cfg = self.build_transfer_config(&policy, &source_snapshot, from_snapshot.clone());
        let transfer_id = self
            .transfer_manager
            .start_transfer_with_policy(transfer_cfg, policy.id.clone())
            .await?;

        Ok(ExecutionOutcome::Started { transfer_id, source_snapshot, target_dataset })
    }

    fn build_transfer_config(&self, policy: &TransferPolicy, snapshot: &str, from_snapshot: Option<String>) -> TransferConfig {
        let send_spec: &SendConfigSpec = &policy.transfer_config.send;
        let receive_spec: &ReceiveConfigSpec = &policy.transfer_config.receive;
        TransferConfig {
            send: SendConfig {
                snapshot: snapshot.to_string(),
                from_snapshot,
                replicate: send_spec.replicate,
                skip_missing: send_spec.skip_missing,
                properties: send_spec.properties,
                large_blocks: send_spec.large_blocks,
                intermediary: send_spec.intermediary,
                compressed: send_spec.compressed,
                verbose: send_spec.verbose,
                resumable: send_spec.resumable,
                timeout: send_spec.timeout.unwrap_or_default(),
            },
            receive: ReceiveConfig {
                target: receive_spec.target.clone(),
                force: receive_spec.force,
                resumable: receive_spec.resumable,
                verbose: receive_spec.verbose,
                remote_config: RemoteConfig {
                    host: receive_spec.remote.host.clone(),
                    port: receive_spec.remote.port,
                    user: receive_spec.remote.user.clone(),
                    private_key: receive_spec.remote.private_key.clone(),
                    strict_host_key_checking: receive_spec.remote.strict_host_key_checking,
                },
            },
            log: None,
        }
    }

    async fn matching_source_snapshots(&self, dataset: &str, regex: &Regex) -> Result<Vec<DatasetInfo>> {
        let list = self.zfs.list(ListQuery::snapshots_of(dataset)).await?;
        let mut matching: Vec<DatasetInfo> = list.datasets.into_values().filter(|d| regex.is_match(d.short_name())).collect();
        matching.sort_by(|a, b| b.creation().cmp(&a.creation()));
        Ok(matching)
    }

    /// Transfer-record retention, run after each successful or skipped
    /// transfer.
    async fn apply_retention_policy(&self, policy: &TransferPolicy) -> Result<()> {
        let retention: &TransferRetentionPolicy = &policy.retention_policy;
        if !retention.is_active() && retention.keep_transfer_ids.is_empty() {
            return Ok(());
        }

        let mut records: Vec<_> = self
            .transfer_manager
            .list_transfers()
            .await?
            .into_iter()
            .filter(|t| t.policy_id.as_deref().map(|id| id == policy.id.as_str()).unwrap_or(false))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let now = Utc::now();
        for (index, record) in records.iter().enumerate() {
            if retention.keep_transfer_ids.contains(&record.id) {
                continue;
            }
            if matches!(record.status, TransferStatus::Starting | TransferStatus::Running | TransferStatus::Paused) {
                continue;
            }
            if retention.keep_failed && record.status == TransferStatus::Failed {
                continue;
            }
            if retention.completed_only && record.status != TransferStatus::Completed {
                continue;
            }
            let over_count = retention.keep_count > 0 && index >= retention.keep_count as usize;
            let over_age = retention
                .older_than
                .filter(|d| !d.is_zero())
                .map(|max_age| (now - record.created_at).num_seconds() > max_age.as_secs() as i64)
                .unwrap_or(false);
            if over_count || over_age {
                if let Err(err) = self.transfer_manager.delete_transfer(&record.id).await {
                    warn!(transfer_id = %record.id, error = %err.message, "failed to prune transfer record");
                }
            }
        }
        Ok(())
    }

    async fn load_policies(&self) -> Result<()> {
        let path = self.config.transfer_policy_path();
        let file: PolicyFile<TransferPolicy, TransferPolicyMonitor> = persistence::load(&path).await?;

        let mut valid = Vec::new();
        let mut had_invalid = false;
        for policy in file.policies {
            let schedule_count_ok = (1..=MAX_SCHEDULES).contains(&policy.schedules.len());
            let schedules_ok = policy.schedules.iter().all(|s| s.validate().is_ok());
            if schedule_count_ok && schedules_ok {
                valid.push(policy);
            } else {
                had_invalid = true;
                warn!(policy_id = %policy.id, "skipping transfer policy with invalid schedule on load");
            }
        }
        if had_invalid {
            if let Ok(contents) = tokio::fs::read_to_string(&path).await {
                let _ = persistence::backup_corrupt_file(&path, &contents, "error").await;
            }
        }

        let mut state = self.state.write().await;
        state.policies = valid.into_iter().map(|p| (p.id.as_str().to_string(), p)).collect();
        state.monitors = file.monitors;
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let (policies, monitors) = {
            let state = self.state.read().await;
            (state.policies.values().cloned().collect::<Vec<_>>(), state.monitors.clone())
        };
        let file = PolicyFile { policies, monitors };
        persistence::save(&self.config.transfer_policy_path(), &file).await
    }

    async fn persist_best_effort(&self) {
        if let Err(err) = self.persist().await {
            warn!(error = %err.message, "best-effort config persist failed after transfer run");
        }
    }

    async fn drop_all_jobs(&self) {
        let ids: Vec<String> = {
            let state = self.state.read().await;
            state.policies.keys().cloned().collect()
        };
        for id in ids {
            self.remove_jobs_for_policy(&id).await;
        }
    }

    async fn remove_jobs_for_policy(&self, policy_id: &str) {
        for idx in 0..MAX_SCHEDULES {
            let _ = self.scheduler.remove_job(&job_id(policy_id, idx)).await;
        }
    }

    async fn materialize_jobs(&self, policy: &TransferPolicy) -> Result<()> {
        for (idx, spec) in policy.schedules.iter().enumerate() {
            // All kinds use single-inflight=Wait on the transfer side.
            let Some((kind, single_inflight)) = spec.translate(true)? else {
                continue;
            };
            let job_spec = JobSpec {
                id: job_id(policy.id.as_str(), idx),
                kind,
                single_inflight,
                start_time: spec.start_time,
                end_time: spec.end_time,
                limited_runs: spec.limited_runs,
            };
            let callback: Arc<dyn JobCallback> = Arc::new(TransferJob {
                manager: self.self_ref.clone(),
                policy_id: policy.id.as_str().to_string(),
            });
            self.scheduler.add_job(job_spec, callback).await?;
        }
        Ok(())
    }
}

fn job_id(policy_id: &str, schedule_index: usize) -> String {
    format!("transfer:{policy_id}:{schedule_index}")
}

struct TransferJob {
    manager: Weak<TransferPolicyManager>,
    policy_id: String,
}

#[async_trait]
impl JobCallback for TransferJob {
    async fn before_run(&self, _job_id: &str) {}

    async fn run(&self, _job_id: &str) -> Result<()> {
        let manager = self.manager.upgrade().ok_or_else(|| Error::invalid_state("transfer policy manager dropped"))?;
        match manager.run_policy(&self.policy_id, None).await {
            Ok(_) => Ok(()),
            Err(err) if err.code == "TRANSFER_OVERLAP" => {
                info!(policy_id = %self.policy_id, "transfer skipped: previous run still active");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn after_run(&self, _job_id: &str, _result: &Result<()>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{ScheduleKind, ScheduleSpec};
    use crate::snapshot::{RetentionPolicy, SnapshotPolicyParams};
    use crate::testing::{MockPrivilegedExec, MockTransferManager, MockZfsOps};
    use crate::zfs_ops::PropertyValue;
    use std::collections::HashMap as StdHashMap;

    fn schedule() -> ScheduleSpec {
        ScheduleSpec {
            kind: ScheduleKind::Duration,
            interval: 1,
            at_time: None,
            week_day: None,
            day_of_month: None,
            month: None,
            start_time: None,
            end_time: None,
            duration: Some(std::time::Duration::from_secs(3600)),
            min_duration: None,
            max_duration: None,
            cron_expr: None,
            limited_runs: 0,
            enabled: true,
        }
    }

    async fn setup() -> (Arc<SnapshotManager>, Arc<TransferPolicyManager>, Arc<MockZfsOps>, Arc<MockTransferManager>, Arc<MockPrivilegedExec>, PolicyId) {
        let zfs = Arc::new(MockZfsOps::default());
        let snapshot_manager = SnapshotManager::new(CoreConfig::new("/tmp/rodent-test"), zfs.clone());
        let sp_id = snapshot_manager
            .add_policy(SnapshotPolicyParams {
                id: String::new(),
                name: "nightly".to_string(),
                description: String::new(),
                dataset: "tank/a".to_string(),
                recursive: false,
                properties: StdHashMap::new(),
                snap_name_pattern: "autosnap-%Y%m%d%H%M%S".to_string(),
                schedules: vec![schedule()],
                retention_policy: RetentionPolicy::default(),
                enabled: false,
            })
            .await
            .unwrap();

        let transfer_manager = Arc::new(MockTransferManager::default());
        let privileged = Arc::new(MockPrivilegedExec::default());
        let manager = TransferPolicyManager::new(
            CoreConfig::new("/tmp/rodent-test"),
            snapshot_manager.clone(),
            transfer_manager.clone(),
            zfs.clone(),
            privileged.clone(),
        );
        (snapshot_manager, manager, zfs, transfer_manager, privileged, sp_id)
    }

    fn transfer_params(sp_id: &str) -> TransferPolicyParams {
        TransferPolicyParams {
            id: String::new(),
            name: "offsite".to_string(),
            description: String::new(),
            snapshot_policy_id: sp_id.to_string(),
            transfer_config: TransferConfigSpec {
                send: SendConfigSpec::default(),
                receive: ReceiveConfigSpec { target: "backup/tank/a".to_string(), ..Default::default() },
            },
            schedules: vec![schedule()],
            retention_policy: TransferRetentionPolicy::default(),
            enabled: false,
        }
    }

    #[tokio::test]
    async fn add_policy_associates_with_snapshot_policy() {
        let (snapshot_manager, manager, _zfs, _tm, _pe, sp_id) = setup().await;
        let tp_id = manager.add_policy(transfer_params(sp_id.as_str())).await.unwrap();
        let assoc = snapshot_manager.get_transfer_policy_associations(sp_id.as_str()).await.unwrap();
        assert_eq!(assoc, vec![tp_id.as_str().to_string()]);
    }

    #[tokio::test]
    async fn add_policy_fails_when_snapshot_policy_missing() {
        let (_sm, manager, ..) = setup().await;
        let err = manager.add_policy(transfer_params("missing-id")).await.unwrap_err();
        assert_eq!(err.code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn execute_transfer_reports_no_matching_snapshots() {
        let (_sm, manager, _zfs, _tm, _pe, sp_id) = setup().await;
        let tp_id = manager.add_policy(transfer_params(sp_id.as_str())).await.unwrap();
        let err = manager.run_policy(tp_id.as_str(), None).await.unwrap_err();
        assert_eq!(err.code, "NO_MATCHING_SNAPSHOTS");
    }

    #[tokio::test]
    async fn execute_transfer_full_send_when_target_absent() {
        let (_sm, manager, zfs, tm, pe, sp_id) = setup().await;
        let tp_id = manager.add_policy(transfer_params(sp_id.as_str())).await.unwrap();
        zfs.seed(vec![make_snap("tank/a@autosnap-20250101000000-0-aaa", 100.0, "g1")]);
        pe.fail("zfs list -H -o name backup/tank/a");

        let outcome = manager.run_policy(tp_id.as_str(), None).await.unwrap();
        match outcome {
            ExecutionOutcome::Started { source_snapshot, .. } => {
                assert_eq!(source_snapshot, "tank/a@autosnap-20250101000000-0-aaa");
            }
            _ => panic!("expected Started outcome"),
        }
        assert_eq!(tm.list_transfers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn execute_transfer_skips_when_in_sync() {
        let (_sm, manager, zfs, tm, pe, sp_id) = setup().await;
        let tp_id = manager.add_policy(transfer_params(sp_id.as_str())).await.unwrap();
        zfs.seed(vec![make_snap("tank/a@autosnap-20250101000000-0-aaa", 100.0, "g3")]);
        pe.succeed("zfs list -H -o name backup/tank/a", "backup/tank/a\n");
        pe.succeed("zfs list -H -p -o name,guid -t snap -S creation backup/tank/a", "backup/tank/a@S3\tg3\n");

        let outcome = manager.run_policy(tp_id.as_str(), None).await.unwrap();
        match outcome {
            ExecutionOutcome::Skipped { reason } => assert!(reason.contains("already has the latest snapshot")),
            _ => panic!("expected Skipped outcome"),
        }
        let view = manager.get_policy(tp_id.as_str()).await.unwrap();
        assert!(view.monitor.last_skipped);
        assert_eq!(view.monitor.skip_count, 1);
        assert_eq!(tm.list_transfers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retention_sweep_runs_after_a_skip_not_only_after_a_start() {
        let (_sm, manager, zfs, tm, pe, sp_id) = setup().await;
        let mut params = transfer_params(sp_id.as_str());
        params.retention_policy = TransferRetentionPolicy { keep_count: 1, ..TransferRetentionPolicy::default() };
        let tp_id = manager.add_policy(params).await.unwrap();

        for i in 0..2 {
            tm.seed(crate::zfs_ops::TransferInfo {
                id: format!("old-{i}"),
                policy_id: Some(tp_id.clone()),
                status: TransferStatus::Completed,
                source_snapshot: "tank/a@old".to_string(),
                target_dataset: "backup/tank/a".to_string(),
                created_at: Utc::now() - chrono::Duration::days(1),
                error: None,
            });
        }

        zfs.seed(vec![make_snap("tank/a@autosnap-20250101000000-0-aaa", 100.0, "g3")]);
        pe.succeed("zfs list -H -o name backup/tank/a", "backup/tank/a\n");
        pe.succeed("zfs list -H -p -o name,guid -t snap -S creation backup/tank/a", "backup/tank/a@S3\tg3\n");

        let outcome = manager.run_policy(tp_id.as_str(), None).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Skipped { .. }));

        // keep_count=1 keeps only the newest record (the skip itself);
        // if the sweep hadn't run on the skip path, both seeded "old-*"
        // records would still be present.
        let remaining = tm.list_transfers().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(!remaining.iter().any(|t| t.id.starts_with("old-")));
    }

    #[tokio::test]
    async fn overlap_guard_blocks_when_previous_transfer_running() {
        let (_sm, manager, zfs, tm, _pe, sp_id) = setup().await;
        let tp_id = manager.add_policy(transfer_params(sp_id.as_str())).await.unwrap();
        zfs.seed(vec![make_snap("tank/a@autosnap-20250101000000-0-aaa", 100.0, "g1")]);

        tm.seed(crate::zfs_ops::TransferInfo {
            id: "running-1".to_string(),
            policy_id: Some(tp_id.clone()),
            status: TransferStatus::Running,
            source_snapshot: "tank/a@autosnap-20250101000000-0-aaa".to_string(),
            target_dataset: "backup/tank/a".to_string(),
            created_at: Utc::now(),
            error: None,
        });
        {
            let mut state = manager.state.write().await;
            state.policies.get_mut(tp_id.as_str()).unwrap().last_transfer_id = "running-1".to_string();
        }

        let err = manager.run_policy(tp_id.as_str(), None).await.unwrap_err();
        assert_eq!(err.code, "TRANSFER_OVERLAP");
        let view = manager.get_policy(tp_id.as_str()).await.unwrap();
        assert_eq!(view.monitor.status, TransferMonitorStatus::Waiting);
        assert!(view.monitor.blocked_reason.as_ref().unwrap().contains("running-1"));
    }

    #[tokio::test]
    async fn remove_policy_refused_is_not_applicable_but_disassociates_on_removal() {
        let (snapshot_manager, manager, ..) = setup().await;
        let sp_id = snapshot_manager
            .add_policy(SnapshotPolicyParams {
                id: String::new(),
                name: "other".to_string(),
                description: String::new(),
                dataset: "tank/b".to_string(),
                recursive: false,
                properties: StdHashMap::new(),
                snap_name_pattern: "autosnap-%Y%m%d%H%M%S".to_string(),
                schedules: vec![schedule()],
                retention_policy: RetentionPolicy::default(),
                enabled: false,
            })
            .await
            .unwrap();
        let tp_id = manager.add_policy(transfer_params(sp_id.as_str())).await.unwrap();
        manager.remove_policy(tp_id.as_str(), false).await.unwrap();
        let assoc = snapshot_manager.get_transfer_policy_associations(sp_id.as_str()).await.unwrap();
        assert!(assoc.is_empty());
    }

    #[tokio::test]
    async fn get_monitor_returns_not_found_for_unknown_policy() {
        let (_sm, manager, ..) = setup().await;
        let err = manager.get_monitor("missing").await.unwrap_err();
        assert_eq!(err.code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn run_history_records_skip_then_start() {
        let (_sm, manager, zfs, tm, pe, sp_id) = setup().await;
        let tp_id = manager.add_policy(transfer_params(sp_id.as_str())).await.unwrap();

        zfs.seed(vec![make_snap("tank/a@autosnap-20250101000000-0-aaa", 100.0, "g3")]);
        pe.succeed("zfs list -H -o name backup/tank/a", "backup/tank/a\n");
        pe.succeed("zfs list -H -p -o name,guid -t snap -S creation backup/tank/a", "backup/tank/a@S3\tg3\n");
        manager.run_policy(tp_id.as_str(), None).await.unwrap();

        zfs.seed(vec![make_snap("tank/a@autosnap-20250101000000-0-aaa", 100.0, "g4")]);
        pe.fail("zfs list -H -o name backup/tank/a");
        manager.run_policy(tp_id.as_str(), None).await.unwrap();

        let history = manager.run_history(tp_id.as_str(), 10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, TransferRunStatus::Success);
        assert_eq!(history[1].status, TransferRunStatus::Skipped);
        assert_eq!(tm.list_transfers().await.unwrap().len(), 2);
    }

    fn make_snap(name: &str, creation: f64, guid: &str) -> DatasetInfo {
        let mut properties = StdHashMap::new();
        properties.insert("creation".to_string(), PropertyValue::Number(creation));
        properties.insert("guid".to_string(), PropertyValue::Text(guid.to_string()));
        DatasetInfo { name: name.to_string(), properties }
    }
}
