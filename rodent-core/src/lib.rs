//! Rodent core library
//!
//! Implements the ZFS snapshot and replication automation engine: two
//! managers (`SnapshotManager`, `TransferPolicyManager`) that own policy
//! state, schedule jobs against it, and persist it to YAML. The core
//! never shells out itself — `zfs_ops` defines the collaborator traits a
//! caller wires up with a real `zfs`/`ssh` implementation.

// Config and persistence
pub mod config;
pub mod persistence;
pub mod serde_util;

// Scheduling
pub mod pattern;
pub mod schedule;
pub mod scheduler;

// External collaborator interfaces
pub mod zfs_ops;

// Policy managers
pub mod snapshot;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::CoreConfig;
pub use snapshot::SnapshotManager;
pub use transfer::TransferPolicyManager;

use std::sync::Arc;
use zfs_ops::{PrivilegedExec, TransferManager, ZfsOps};

/// Constructs both managers against a shared `CoreConfig`, per the
/// "one-time constructor, singletons keyed by config directory" design
/// note. Callers still need to `start()` each manager to load persisted
/// policies and begin scheduling.
pub fn build_managers(
    config: CoreConfig,
    zfs: Arc<dyn ZfsOps>,
    privileged: Arc<dyn PrivilegedExec>,
    transfer_manager: Arc<dyn TransferManager>,
) -> (Arc<SnapshotManager>, Arc<TransferPolicyManager>) {
    let snapshot_manager = SnapshotManager::new(config.clone(), zfs.clone());
    let transfer_policy_manager = TransferPolicyManager::new(config, snapshot_manager.clone(), transfer_manager, zfs, privileged);
    (snapshot_manager, transfer_policy_manager)
}
