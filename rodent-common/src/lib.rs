//! Shared error taxonomy and small value types for the ZFS automation core.
//!
//! Mirrors the split between `horcrux-common` (shared types, no I/O) and
//! the service crate that consumes them: this crate carries nothing that
//! shells out or touches disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One error kind per failure mode the core can surface, per the engine's
/// error taxonomy. `domain` groups kinds for callers that want to branch
/// on "is this a config problem" vs "is this a ZFS problem" without
/// matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    Validation,
    Lookup,
    State,
    Config,
    Scheduler,
    Zfs,
    Transfer,
}

/// Structured error carried by every fallible operation in the core.
///
/// `code` is a stable machine-readable tag (e.g. `"NOT_FOUND"`); `message`
/// is the human-readable summary; `details` and `metadata` carry extra
/// context a caller may want to log or relay without it being baked into
/// `message`.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct Error {
    pub code: &'static str,
    pub domain: ErrorDomain,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Error {
    fn new(code: &'static str, domain: ErrorDomain, message: impl Into<String>) -> Self {
        Self {
            code,
            domain,
            message: message.into(),
            details: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn request_validation(message: impl Into<String>) -> Self {
        Self::new("REQUEST_VALIDATION", ErrorDomain::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", ErrorDomain::Lookup, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("INVALID_STATE", ErrorDomain::State, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("CONFLICT", ErrorDomain::State, message)
    }

    pub fn config_read(message: impl Into<String>) -> Self {
        Self::new("CONFIG_READ", ErrorDomain::Config, message)
    }

    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::new("CONFIG_PARSE", ErrorDomain::Config, message)
    }

    pub fn config_write(message: impl Into<String>) -> Self {
        Self::new("CONFIG_WRITE", ErrorDomain::Config, message)
    }

    pub fn scheduler(message: impl Into<String>) -> Self {
        Self::new("SCHEDULER_ERROR", ErrorDomain::Scheduler, message)
    }

    pub fn zfs_operation(message: impl Into<String>) -> Self {
        Self::new("ZFS_OPERATION", ErrorDomain::Zfs, message)
    }

    pub fn transfer_overlap(message: impl Into<String>) -> Self {
        Self::new("TRANSFER_OVERLAP", ErrorDomain::Transfer, message)
    }

    pub fn no_matching_snapshots(message: impl Into<String>) -> Self {
        Self::new("NO_MATCHING_SNAPSHOTS", ErrorDomain::Zfs, message)
    }

    pub fn snapshot_policy_in_use(message: impl Into<String>) -> Self {
        Self::new("SNAPSHOT_POLICY_IN_USE", ErrorDomain::State, message)
    }

    pub fn ssh_command_assembly(message: impl Into<String>) -> Self {
        Self::new("SSH_COMMAND_ASSEMBLY", ErrorDomain::Transfer, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::config_read(format!("I/O error: {err}"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::config_parse(format!("YAML error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Opaque identifier used for policies, transfers, and monitors. Thin
/// wrapper over `String` so call sites read `PolicyId` instead of a bare
/// `String` at every signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PolicyId(pub String);

impl PolicyId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The UUID's last hyphen-delimited group, used by the snapshot-name
    /// pattern to keep generated names short while still disambiguating
    /// by policy.
    pub fn suffix(&self) -> &str {
        self.0.rsplit('-').next().unwrap_or(&self.0)
    }
}

impl Default for PolicyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PolicyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PolicyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_carries_code_and_domain() {
        let err = Error::not_found("policy abc not found");
        assert_eq!(err.code, "NOT_FOUND");
        assert_eq!(err.domain, ErrorDomain::Lookup);
        assert_eq!(err.message, "policy abc not found");
    }

    #[test]
    fn error_builder_chains() {
        let err = Error::config_write("save failed")
            .with_details("watchdog timeout")
            .with_metadata("policy_id", "abc");
        assert_eq!(err.details, Some("watchdog timeout".to_string()));
        assert_eq!(err.metadata.get("policy_id"), Some(&"abc".to_string()));
    }

    #[test]
    fn policy_id_suffix_is_last_group() {
        let id = PolicyId::from("a1b2c3d4-e5f6-7890-abcd-ef0123456789");
        assert_eq!(id.suffix(), "ef0123456789");
    }

    #[test]
    fn policy_id_default_is_random_uuid() {
        let a = PolicyId::new();
        let b = PolicyId::new();
        assert_ne!(a, b);
        assert_eq!(a.0.split('-').count(), 5);
    }
}
