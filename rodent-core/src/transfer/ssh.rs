//! SSH command assembly for remote targets, and the GUID-based
//! common-ancestor reconciliation that picks `from_snapshot` for a send.

use super::RemoteConfigSpec;
use crate::zfs_ops::{CommandOutput, DatasetInfo, PrivilegedExec};
use rodent_common::{Error, Result};
use std::collections::HashMap;

/// Builds `ssh -o BatchMode=yes [-o StrictHostKeyChecking=no] [-i <key>]
/// [-p <port>] <user>@<host>`, materializing the PEM private key (if
/// any) through the privileged-exec capability first.
pub async fn build_ssh_prefix(exec: &dyn PrivilegedExec, remote: &RemoteConfigSpec) -> Result<Vec<String>> {
    if remote.host.is_empty() {
        return Err(Error::ssh_command_assembly("remote_config.host must not be empty"));
    }
    let mut argv = vec!["ssh".to_string(), "-o".to_string(), "BatchMode=yes".to_string()];
    if !remote.strict_host_key_checking {
        argv.push("-o".to_string());
        argv.push("StrictHostKeyChecking=no".to_string());
    }
    if let Some(pem) = remote.private_key.as_deref().filter(|k| !k.is_empty()) {
        let path = exec.write_temp_file(pem).await?;
        argv.push("-i".to_string());
        argv.push(path);
    }
    if let Some(port) = remote.port {
        argv.push("-p".to_string());
        argv.push(port.to_string());
    }
    let target = match remote.user.as_deref() {
        Some(user) if !user.is_empty() => format!("{user}@{}", remote.host),
        _ => remote.host.clone(),
    };
    argv.push(target);
    Ok(argv)
}

/// Prepends the SSH prefix to `command` when `remote` names a host;
/// local probes pass through unchanged.
pub async fn wrap_remote(exec: &dyn PrivilegedExec, remote: &RemoteConfigSpec, command: Vec<String>) -> Result<Vec<String>> {
    if !remote.is_remote() {
        return Ok(command);
    }
    let mut argv = build_ssh_prefix(exec, remote).await?;
    argv.extend(command);
    Ok(argv)
}

/// Outcome of resolving the most recent common ancestor between a
/// source dataset's snapshots and a (possibly remote) target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AncestorOutcome {
    /// Target already has the source snapshot: no send needed.
    InSync,
    /// Target has an older common snapshot: incremental send from it.
    Incremental(String),
    /// No common snapshot, but the oldest matching source snapshot
    /// differs from the chosen source: full send of it followed by an
    /// incremental to the chosen source.
    FullThenIncremental(String),
    /// No common snapshot and nothing to chain from (or target is
    /// absent/empty): plain full send.
    Full,
}

fn parse_name_guid(stdout: &str) -> HashMap<String, String> {
    let mut by_guid = HashMap::new();
    for line in stdout.lines() {
        let mut cols = line.split('\t');
        if let (Some(name), Some(guid)) = (cols.next(), cols.next()) {
            by_guid.insert(guid.trim().to_string(), name.trim().to_string());
        }
    }
    by_guid
}

async fn run(exec: &dyn PrivilegedExec, remote: &RemoteConfigSpec, command: Vec<String>) -> Result<CommandOutput> {
    let argv = wrap_remote(exec, remote, command).await?;
    exec.execute_command(&argv).await
}

/// Resolves the send plan for a transfer, per the execution algorithm's
/// common-ancestor step. `source_snapshots` must be sorted newest-first
/// and carry a `guid` property; `source_snapshot_name` is the chosen
/// source (`dataset@snap`); `oldest_matching_source` is the oldest
/// snapshot under the same name-pattern regex, used only when
/// `intermediary` is set.
pub async fn resolve_send_plan(
    exec: &dyn PrivilegedExec,
    remote: &RemoteConfigSpec,
    source_dataset: &str,
    source_snapshots: &[DatasetInfo],
    source_snapshot_name: &str,
    target_dataset: &str,
    intermediary: bool,
    oldest_matching_source: Option<&DatasetInfo>,
) -> Result<AncestorOutcome> {
    let probe = run(
        exec,
        remote,
        vec!["zfs".to_string(), "list".to_string(), "-H".to_string(), "-o".to_string(), "name".to_string(), target_dataset.to_string()],
    )
    .await?;
    if !probe.success() {
        return Ok(AncestorOutcome::Full);
    }

    let target_list = run(
        exec,
        remote,
        vec![
            "zfs".to_string(),
            "list".to_string(),
            "-H".to_string(),
            "-p".to_string(),
            "-o".to_string(),
            "name,guid".to_string(),
            "-t".to_string(),
            "snap".to_string(),
            "-S".to_string(),
            "creation".to_string(),
            target_dataset.to_string(),
        ],
    )
    .await?;
    let target_by_guid = parse_name_guid(&target_list.stdout);

    let common = source_snapshots.iter().find(|snap| {
        snap.guid().map(|guid| target_by_guid.contains_key(guid)).unwrap_or(false)
    });

    if let Some(common) = common {
        if common.name == source_snapshot_name {
            return Ok(AncestorOutcome::InSync);
        }
        return Ok(AncestorOutcome::Incremental(common.name.clone()));
    }

    if intermediary {
        if let Some(oldest) = oldest_matching_source {
            if oldest.name != source_snapshot_name {
                return Ok(AncestorOutcome::FullThenIncremental(oldest.name.clone()));
            }
        }
        return Ok(AncestorOutcome::Full);
    }

    if target_by_guid.is_empty() {
        return Ok(AncestorOutcome::Full);
    }

    Err(Error::zfs_operation(format!(
        "no common snapshots found between {source_dataset} and {target_dataset}"
    )))
}
