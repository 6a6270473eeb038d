//! `SnapshotManager`: owns snapshot policies, their scheduler jobs, and
//! their on-disk persistence.

use super::{
    JobMonitor, JobMonitorStatus, RetentionPolicy, RunStatus, SnapshotPolicy, SnapshotPolicyParams,
    SnapshotRunRecord,
};
use crate::config::CoreConfig;
use crate::pattern;
use crate::persistence::{self, PolicyFile};
use crate::scheduler::{JobCallback, JobSpec, Scheduler};
use crate::zfs_ops::{CreateSnapshotParams, DestroyParams, ListQuery, ZfsOps};
use async_trait::async_trait;
use chrono::Utc;
use rodent_common::{Error, PolicyId, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Cap on the in-memory run-history trail kept per policy; oldest entries
/// are evicted first, matching `SchedulerState::max_history`.
const MAX_HISTORY: usize = 20;

#[derive(Debug, Clone)]
pub struct SnapshotPolicyView {
    pub policy: SnapshotPolicy,
    pub monitor: JobMonitor,
}

#[derive(Default)]
struct ManagerState {
    policies: HashMap<String, SnapshotPolicy>,
    monitors: HashMap<String, JobMonitor>,
    history: HashMap<String, VecDeque<SnapshotRunRecord>>,
}

/// Maximum schedules per policy, per the `len(schedules) in [1,5]` invariant.
const MAX_SCHEDULES: usize = 5;

pub struct SnapshotManager {
    config: CoreConfig,
    zfs: Arc<dyn ZfsOps>,
    scheduler: Scheduler,
    state: RwLock<ManagerState>,
    self_ref: Weak<SnapshotManager>,
}

impl SnapshotManager {
    pub fn new(config: CoreConfig, zfs: Arc<dyn ZfsOps>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            zfs,
            scheduler: Scheduler::new(),
            state: RwLock::new(ManagerState::default()),
            self_ref: weak.clone(),
        })
    }

    fn validate_params(&self, params: &SnapshotPolicyParams) -> Result<()> {
        if params.name.trim().is_empty() {
            return Err(Error::request_validation("name must not be empty"));
        }
        if params.dataset.trim().is_empty() {
            return Err(Error::request_validation("dataset must not be empty"));
        }
        if params.snap_name_pattern.trim().is_empty() {
            return Err(Error::request_validation("snap_name_pattern must not be empty"));
        }
        if !(1..=MAX_SCHEDULES).contains(&params.schedules.len()) {
            return Err(Error::request_validation(format!(
                "schedules must contain between 1 and {MAX_SCHEDULES} entries"
            )));
        }
        for spec in &params.schedules {
            spec.validate()?;
        }
        pattern::compile_regex(&params.snap_name_pattern)?;
        Ok(())
    }

    pub async fn add_policy(&self, params: SnapshotPolicyParams) -> Result<PolicyId> {
        self.validate_params(&params)?;
        let id = if params.id.is_empty() { PolicyId::new() } else { PolicyId::from(params.id.clone()) };

        let policy = {
            let mut state = self.state.write().await;
            if state.policies.contains_key(id.as_str()) {
                return Err(Error::conflict(format!("snapshot policy {id} already exists")));
            }
            let policy = SnapshotPolicy {
                id: id.clone(),
                name: params.name,
                description: params.description,
                dataset: params.dataset,
                recursive: params.recursive,
                properties: params.properties,
                snap_name_pattern: params.snap_name_pattern,
                schedules: params.schedules,
                retention_policy: params.retention_policy,
                transfer_policy_ids: Vec::new(),
                enabled: params.enabled,
                last_run_at: None,
                last_run_status: None,
                last_run_error: None,
                created_at: Utc::now(),
            };
            state.policies.insert(id.as_str().to_string(), policy.clone());
            state.monitors.entry(id.as_str().to_string()).or_insert_with(JobMonitor::default);
            policy
        };

        if policy.enabled {
            if let Err(err) = self.materialize_jobs(&policy).await {
                let mut state = self.state.write().await;
                state.policies.remove(id.as_str());
                state.monitors.remove(id.as_str());
                return Err(err);
            }
        }
        self.persist().await?;
        Ok(id)
    }

    pub async fn update_policy(&self, params: SnapshotPolicyParams) -> Result<()> {
        if params.id.is_empty() {
            return Err(Error::request_validation("update requires id"));
        }
        self.validate_params(&params)?;
        self.remove_jobs_for_policy(&params.id).await;

        {
            let mut state = self.state.write().await;
            let existing = state
                .policies
                .get(&params.id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("snapshot policy {} not found", params.id)))?;
            let updated = SnapshotPolicy {
                id: existing.id.clone(),
                name: params.name,
                description: params.description,
                dataset: params.dataset,
                recursive: params.recursive,
                properties: params.properties,
                snap_name_pattern: params.snap_name_pattern,
                schedules: params.schedules,
                retention_policy: params.retention_policy,
                transfer_policy_ids: existing.transfer_policy_ids,
                enabled: params.enabled,
                last_run_at: existing.last_run_at,
                last_run_status: existing.last_run_status,
                last_run_error: existing.last_run_error,
                created_at: existing.created_at,
            };
            state.policies.insert(params.id.clone(), updated);
        }

        let policy = self.get_policy(&params.id).await?.policy;
        if policy.enabled {
            self.materialize_jobs(&policy).await?;
        }
        self.persist().await
    }

    pub async fn remove_policy(&self, id: &str, remove_snapshots: bool) -> Result<()> {
        let policy = {
            let state = self.state.read().await;
            state.policies.get(id).cloned().ok_or_else(|| Error::not_found(format!("snapshot policy {id} not found")))?
        };
        if !policy.transfer_policy_ids.is_empty() {
            return Err(Error::snapshot_policy_in_use(format!(
                "snapshot policy {id} is referenced by {} transfer polic{}",
                policy.transfer_policy_ids.len(),
                if policy.transfer_policy_ids.len() == 1 { "y" } else { "ies" }
            )));
        }

        self.remove_jobs_for_policy(id).await;

        if remove_snapshots {
            // Lock is released for the duration of ZFS enumeration, per
            // the concurrency model, then reacquired to mutate config.
            if let Err(err) = self.destroy_matching_snapshots(&policy).await {
                warn!(policy_id = %id, error = %err.message, "failed to destroy snapshots during policy removal");
            }
        }

        let mut state = self.state.write().await;
        state.policies.remove(id);
        state.monitors.remove(id);
        drop(state);
        self.persist().await
    }

    async fn destroy_matching_snapshots(&self, policy: &SnapshotPolicy) -> Result<()> {
        let regex = pattern::compile_regex(&policy.snap_name_pattern)?;
        let list = self.zfs.list(ListQuery::snapshots_of(&policy.dataset)).await?;
        for dataset in list.datasets.values() {
            if regex.is_match(dataset.short_name()) {
                if let Err(err) = self
                    .zfs
                    .destroy(DestroyParams::snapshot(dataset.name.clone(), policy.recursive))
                    .await
                {
                    warn!(snapshot = %dataset.name, error = %err.message, "failed to destroy snapshot");
                }
            }
        }
        Ok(())
    }

    pub async fn get_policy(&self, id: &str) -> Result<SnapshotPolicyView> {
        let state = self.state.read().await;
        let policy = state.policies.get(id).cloned().ok_or_else(|| Error::not_found(format!("snapshot policy {id} not found")))?;
        let monitor = state.monitors.get(id).cloned().unwrap_or_default();
        Ok(SnapshotPolicyView { policy, monitor })
    }

    pub async fn list_policies(&self) -> Vec<SnapshotPolicyView> {
        let state = self.state.read().await;
        state
            .policies
            .values()
            .map(|policy| SnapshotPolicyView {
                policy: policy.clone(),
                monitor: state.monitors.get(policy.id.as_str()).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Read-only monitor accessor for callers that want runtime status
    /// without a full policy fetch, mirroring `NasScheduler::get_job`.
    pub async fn get_monitor(&self, id: &str) -> Result<JobMonitor> {
        let state = self.state.read().await;
        state
            .monitors
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("snapshot policy {id} not found")))
    }

    /// Most recent `limit` run records for `id`, newest first. Runtime
    /// diagnostic only — not persisted, not part of the YAML config.
    pub async fn run_history(&self, id: &str, limit: usize) -> Vec<SnapshotRunRecord> {
        let state = self.state.read().await;
        state
            .history
            .get(id)
            .map(|records| records.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn run_policy(&self, id: &str, schedule_index: usize, dry_run: bool) -> Result<()> {
        let policy = self.get_policy(id).await?.policy;
        self.create_snapshot(&policy, schedule_index, dry_run).await
    }

    pub async fn start(&self) -> Result<()> {
        self.drop_all_jobs().await;
        self.load_policies().await?;
        self.scheduler.start().await?;
        let policies: Vec<SnapshotPolicy> = {
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
            warn!(error = %err.message, "failed to persist snapshot config during stop");
        }
    }

    pub async fn update_transfer_policy_association(&self, old_sp_id: &str, new_sp_id: &str, tp_id: &str) -> Result<()> {
        if old_sp_id == new_sp_id || (old_sp_id.is_empty() && new_sp_id.is_empty()) {
            return Ok(());
        }
        {
            let mut state = self.state.write().await;
            if !old_sp_id.is_empty() {
                match state.policies.get_mut(old_sp_id) {
                    Some(policy) => policy.remove_transfer_policy_id(tp_id),
                    None => warn!(sp_id = %old_sp_id, "snapshot policy missing during association removal"),
                }
            }
            if !new_sp_id.is_empty() {
                match state.policies.get_mut(new_sp_id) {
                    Some(policy) => policy.add_transfer_policy_id(tp_id),
                    None => return Err(Error::not_found(format!("snapshot policy {new_sp_id} not found"))),
                }
            }
        }
        self.persist().await
    }

    pub async fn get_transfer_policy_associations(&self, sp_id: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        state
            .policies
            .get(sp_id)
            .map(|p| p.transfer_policy_ids.clone())
            .ok_or_else(|| Error::not_found(format!("snapshot policy {sp_id} not found")))
    }

    async fn load_policies(&self) -> Result<()> {
        let path = self.config.snapshot_policy_path();
        let file: PolicyFile<SnapshotPolicy, JobMonitor> = persistence::load(&path).await?;

        let mut valid = Vec::new();
        let mut had_invalid = false;
        for policy in file.policies {
            let schedule_count_ok = (1..=MAX_SCHEDULES).contains(&policy.schedules.len());
            let schedules_ok = policy.schedules.iter().all(|s| s.validate().is_ok());
            if schedule_count_ok && schedules_ok {
                valid.push(policy);
            } else {
                had_invalid = true;
                warn!(policy_id = %policy.id, "skipping snapshot policy with invalid schedule on load");
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
        persistence::save(&self.config.snapshot_policy_path(), &file).await
    }

    async fn persist_best_effort(&self) {
        if let Err(err) = self.persist().await {
            warn!(error = %err.message, "best-effort config persist failed after job fire");
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

    async fn materialize_jobs(&self, policy: &SnapshotPolicy) -> Result<()> {
        for (idx, spec) in policy.schedules.iter().enumerate() {
            let Some((kind, single_inflight)) = spec.translate(false)? else {
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
            let callback: Arc<dyn JobCallback> = Arc::new(SnapshotJob {
                manager: self.self_ref.clone(),
                policy_id: policy.id.as_str().to_string(),
                schedule_index: idx,
                started_at: Mutex::new(None),
            });
            self.scheduler.add_job(job_spec, callback).await?;
        }
        Ok(())
    }

    async fn create_snapshot(&self, policy: &SnapshotPolicy, schedule_index: usize, dry_run: bool) -> Result<()> {
        let now = Utc::now();
        let name = pattern::expand_name(&policy.snap_name_pattern, now, &policy.id, &policy.name, schedule_index);

        if dry_run {
            info!(policy_id = %policy.id, snap_name = %name, "dry run: snapshot not created");
            return Ok(());
        }

        let result = self
            .zfs
            .create_snapshot(CreateSnapshotParams {
                dataset: policy.dataset.clone(),
                snap_name: name.clone(),
                recursive: policy.recursive,
                properties: policy.properties.clone(),
            })
            .await;

        {
            let mut state = self.state.write().await;
            if let Some(p) = state.policies.get_mut(policy.id.as_str()) {
                p.last_run_at = Some(now);
                match &result {
                    Ok(()) => {
                        p.last_run_status = Some(RunStatus::Success);
                        p.last_run_error = None;
                    }
                    Err(err) => {
                        p.last_run_status = Some(RunStatus::Error);
                        p.last_run_error = Some(err.message.clone());
                    }
                }
            }
        }
        self.persist_best_effort().await;
        result?;

        if policy.retention_policy.is_active() {
            if let Err(err) = self.prune(policy).await {
                warn!(policy_id = %policy.id, error = %err.message, "pruning failed, creation unaffected");
            }
        }
        Ok(())
    }

    async fn prune(&self, policy: &SnapshotPolicy) -> Result<()> {
        let regex = pattern::compile_regex(&policy.snap_name_pattern)?;
        let list = self.zfs.list(ListQuery::snapshots_of(&policy.dataset)).await?;

        let mut matching: Vec<_> = list.datasets.values().filter(|d| regex.is_match(d.short_name())).collect();
        matching.sort_by(|a, b| b.creation().cmp(&a.creation()));

        let now = Utc::now().timestamp();
        let retention = &policy.retention_policy;
        for (index, dataset) in matching.iter().enumerate() {
            if retention.keep_named_snap.contains(dataset.short_name()) {
                continue;
            }
            let over_count = retention.count > 0 && index >= retention.count as usize;
            let over_age = retention
                .older_than
                .filter(|d| !d.is_zero())
                .and_then(|max_age| dataset.creation().map(|c| now - c > max_age.as_secs() as i64))
                .unwrap_or(false);
            if over_count || over_age {
                if let Err(err) = self
                    .zfs
                    .destroy(DestroyParams {
                        force: retention.force_destroy,
                        ..DestroyParams::snapshot(dataset.name.clone(), policy.recursive)
                    })
                    .await
                {
                    warn!(snapshot = %dataset.name, error = %err.message, "failed to prune snapshot");
                }
            }
        }
        Ok(())
    }

    async fn mark_running(&self, policy_id: &str) {
        let mut state = self.state.write().await;
        let monitor = state.monitors.entry(policy_id.to_string()).or_insert_with(JobMonitor::default);
        monitor.status = JobMonitorStatus::Running;
    }

    async fn mark_finished(
        &self,
        policy_id: &str,
        schedule_index: usize,
        result: &Result<()>,
        duration: std::time::Duration,
    ) {
        let ran_at = Utc::now();
        let mut state = self.state.write().await;
        let monitor = state.monitors.entry(policy_id.to_string()).or_insert_with(JobMonitor::default);
        monitor.last_run_at = Some(ran_at);
        monitor.last_duration = Some(duration);
        monitor.run_count += 1;
        let (status, error) = match result {
            Ok(()) => {
                monitor.status = JobMonitorStatus::Success;
                monitor.last_error = None;
                (RunStatus::Success, None)
            }
            Err(err) => {
                monitor.status = JobMonitorStatus::Error;
                monitor.last_error = Some(err.message.clone());
                (RunStatus::Error, Some(err.message.clone()))
            }
        };

        let history = state.history.entry(policy_id.to_string()).or_default();
        history.push_front(SnapshotRunRecord { schedule_index, ran_at, duration: Some(duration), status, error });
        history.truncate(MAX_HISTORY);
    }
}

fn job_id(policy_id: &str, schedule_index: usize) -> String {
    format!("snapshot:{policy_id}:{schedule_index}")
}

struct SnapshotJob {
    manager: Weak<SnapshotManager>,
    policy_id: String,
    schedule_index: usize,
    started_at: Mutex<Option<Instant>>,
}

#[async_trait]
impl JobCallback for SnapshotJob {
    async fn before_run(&self, _job_id: &str) {
        *self.started_at.lock().unwrap() = Some(Instant::now());
        if let Some(manager) = self.manager.upgrade() {
            manager.mark_running(&self.policy_id).await;
        }
    }

    async fn run(&self, _job_id: &str) -> Result<()> {
        let manager = self.manager.upgrade().ok_or_else(|| Error::invalid_state("snapshot manager dropped"))?;
        let policy = manager.get_policy(&self.policy_id).await?.policy;
        manager.create_snapshot(&policy, self.schedule_index, false).await
    }

    async fn after_run(&self, _job_id: &str, result: &Result<()>) {
        let elapsed = self.started_at.lock().unwrap().take().map(|t| t.elapsed()).unwrap_or_default();
        if let Some(manager) = self.manager.upgrade() {
            manager.mark_finished(&self.policy_id, self.schedule_index, result, elapsed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{ScheduleKind, ScheduleSpec};
    use crate::testing::MockZfsOps;

    fn one_schedule(kind: ScheduleKind) -> ScheduleSpec {
        ScheduleSpec {
            kind,
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

    fn params() -> SnapshotPolicyParams {
        SnapshotPolicyParams {
            id: String::new(),
            name: "nightly".to_string(),
            description: String::new(),
            dataset: "tank/a".to_string(),
            recursive: false,
            properties: HashMap::new(),
            snap_name_pattern: "autosnap-%Y%m%d%H%M%S".to_string(),
            schedules: vec![one_schedule(ScheduleKind::Duration)],
            retention_policy: RetentionPolicy::default(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn add_policy_assigns_id_and_materializes_jobs() {
        let manager = SnapshotManager::new(CoreConfig::new("/tmp/does-not-matter"), Arc::new(MockZfsOps::default()));
        let id = manager.add_policy(params()).await.unwrap();
        let view = manager.get_policy(id.as_str()).await.unwrap();
        assert_eq!(view.policy.name, "nightly");
        manager.scheduler.stop().await;
    }

    #[tokio::test]
    async fn remove_policy_refuses_when_referenced_by_transfer_policy() {
        let manager = SnapshotManager::new(CoreConfig::new("/tmp/does-not-matter"), Arc::new(MockZfsOps::default()));
        let id = manager.add_policy(params()).await.unwrap();
        manager.update_transfer_policy_association("", id.as_str(), "tp-1").await.unwrap();
        let err = manager.remove_policy(id.as_str(), false).await.unwrap_err();
        assert_eq!(err.code, "SNAPSHOT_POLICY_IN_USE");
        manager.scheduler.stop().await;
    }

    #[tokio::test]
    async fn association_missing_new_id_fails_not_found() {
        let manager = SnapshotManager::new(CoreConfig::new("/tmp/does-not-matter"), Arc::new(MockZfsOps::default()));
        let err = manager.update_transfer_policy_association("", "missing", "tp-1").await.unwrap_err();
        assert_eq!(err.code, "NOT_FOUND");
        manager.scheduler.stop().await;
    }

    #[tokio::test]
    async fn run_policy_dry_run_does_not_call_zfs() {
        let zfs = Arc::new(MockZfsOps::default());
        let manager = SnapshotManager::new(CoreConfig::new("/tmp/does-not-matter"), zfs.clone());
        let id = manager.add_policy(params()).await.unwrap();
        manager.run_policy(id.as_str(), 0, true).await.unwrap();
        assert_eq!(zfs.snapshot_count(), 0);
        manager.scheduler.stop().await;
    }

    #[tokio::test]
    async fn get_monitor_returns_not_found_for_unknown_policy() {
        let manager = SnapshotManager::new(CoreConfig::new("/tmp/does-not-matter"), Arc::new(MockZfsOps::default()));
        let err = manager.get_monitor("missing").await.unwrap_err();
        assert_eq!(err.code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn run_history_records_scheduled_fires_newest_first() {
        let zfs = Arc::new(MockZfsOps::default());
        let manager = SnapshotManager::new(CoreConfig::new("/tmp/does-not-matter"), zfs.clone());
        let id = manager.add_policy(params()).await.unwrap();
        let policy = manager.get_policy(id.as_str()).await.unwrap().policy;

        manager.create_snapshot(&policy, 0, false).await.unwrap();
        manager.mark_finished(id.as_str(), 0, &Ok(()), std::time::Duration::from_millis(10)).await;
        manager.mark_finished(id.as_str(), 0, &Err(Error::zfs_operation("boom")), std::time::Duration::from_millis(5)).await;

        let history = manager.run_history(id.as_str(), 10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, RunStatus::Error);
        assert_eq!(history[1].status, RunStatus::Success);
        manager.scheduler.stop().await;
    }
}
