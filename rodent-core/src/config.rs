//! Resolves the on-disk layout both managers persist into.

use std::path::{Path, PathBuf};

const SNAPSHOT_CONFIG_FILE: &str = "zfs.snapshots.rodent.yml";
const TRANSFER_CONFIG_RELATIVE: &str = "policies/transfers/zfs.transfer-policies.rodent.yml";
const CONFIG_DIR_ENV: &str = "RODENT_CONFIG_DIR";
const DEFAULT_CONFIG_DIR: &str = "/etc/rodent";

/// Where the core reads and writes its two YAML files. Both managers
/// are constructed against the same `CoreConfig`, per the "singletons
/// keyed by config directory" design note.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub config_dir: PathBuf,
}

impl CoreConfig {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self { config_dir: config_dir.into() }
    }

    /// Resolves `config_dir` from `RODENT_CONFIG_DIR`, falling back to
    /// `/etc/rodent`.
    pub fn from_env() -> Self {
        let dir = std::env::var(CONFIG_DIR_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());
        Self::new(dir)
    }

    pub fn snapshot_policy_path(&self) -> PathBuf {
        self.config_dir.join(SNAPSHOT_CONFIG_FILE)
    }

    pub fn transfer_policy_path(&self) -> PathBuf {
        self.config_dir.join(TRANSFER_CONFIG_RELATIVE)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}
