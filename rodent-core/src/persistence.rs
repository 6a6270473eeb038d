//! Whole-file YAML persistence for the two policy containers, shared by
//! `SnapshotManager` and `TransferPolicyManager`: load-with-corrupt-backup,
//! save-with-watchdog.

use chrono::Utc;
use rodent_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{error, warn};

const SAVE_WATCHDOG: Duration = Duration::from_secs(5);

/// `{policies: [...], monitors: {id -> monitor}}`, the shape both
/// on-disk containers share.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct PolicyFile<P, M> {
    #[serde(default)]
    pub policies: Vec<P>,
    #[serde(default)]
    pub monitors: HashMap<String, M>,
}

impl<P, M> Default for PolicyFile<P, M> {
    fn default() -> Self {
        Self { policies: Vec::new(), monitors: HashMap::new() }
    }
}

/// Loads `path`, returning an empty container if it doesn't exist yet.
/// An unparseable file is backed up alongside with an
/// `.error.<timestamp>` suffix and an empty container is returned
/// together with the parse error, so callers can decide whether to
/// treat it as fatal.
pub async fn load<P, M>(path: &Path) -> Result<PolicyFile<P, M>>
where
    P: DeserializeOwned,
    M: DeserializeOwned,
{
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(PolicyFile::default()),
        Err(err) => return Err(err.into()),
    };

    match serde_yaml::from_str::<PolicyFile<P, M>>(&contents) {
        Ok(file) => Ok(file),
        Err(err) => {
            if let Err(backup_err) = backup_corrupt_file(path, &contents, "error").await {
                error!(path = %path.display(), error = %backup_err, "failed to back up corrupt config");
            }
            Err(Error::config_parse(format!("unparseable config at {}: {err}", path.display())))
        }
    }
}

/// Writes `file` to `path` as whole-file YAML at mode `0644`, ensuring
/// the parent directory exists first. Bounded by a 5-second watchdog;
/// a timeout surfaces as `ConfigWrite`.
pub async fn save<P, M>(path: &Path, file: &PolicyFile<P, M>) -> Result<()>
where
    P: Serialize + Sync,
    M: Serialize + Sync,
{
    let path = path.to_path_buf();
    let yaml = serde_yaml::to_string(file)?;

    let write = async move {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, yaml.as_bytes()).await?;
        set_mode_0644(&path).await;
        Ok::<(), Error>(())
    };

    match tokio::time::timeout(SAVE_WATCHDOG, write).await {
        Ok(result) => result,
        Err(_) => Err(Error::config_write("save watchdog timed out after 5s")),
    }
}

#[cfg(unix)]
async fn set_mode_0644(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        let mut perms = metadata.permissions();
        perms.set_mode(0o644);
        let _ = tokio::fs::set_permissions(path, perms).await;
    }
}

#[cfg(not(unix))]
async fn set_mode_0644(_path: &Path) {}

/// Copies `path`'s current `contents` to `<path>.<tag>.<YYYY-MM-DD-HHMMSS>`.
pub async fn backup_corrupt_file(path: &Path, contents: &str, tag: &str) -> Result<()> {
    let stamp = Utc::now().format("%Y-%m-%d-%H%M%S");
    let backup_path = {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".{tag}.{stamp}"));
        std::path::PathBuf::from(name)
    };
    warn!(path = %path.display(), backup = %backup_path.display(), "backing up config before overwrite");
    tokio::fs::write(&backup_path, contents.as_bytes()).await?;
    Ok(())
}
