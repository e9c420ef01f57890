//! Permission modes for task credentials.
//!
//! The permission/token service computes effective scopes externally; this
//! module only names the modes and their scope tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Access level granted for one credential scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    Read,
    Write,
}

/// Credential mode attached to a task.
///
/// Each variant maps to one pure scope table; no shared mutable state and no
/// integer switching at read sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Forked or untrusted triggers: read everything, write nothing.
    ReadOnly,
    /// Trusted triggers on the home repository.
    ReadWrite,
    /// Restricted mode for approval-gated runs: metadata only.
    Restricted,
}

impl PermissionMode {
    pub fn scopes(&self) -> HashMap<&'static str, AccessLevel> {
        match self {
            PermissionMode::ReadOnly => read_only_scopes(),
            PermissionMode::ReadWrite => read_write_scopes(),
            PermissionMode::Restricted => restricted_scopes(),
        }
    }
}

fn read_only_scopes() -> HashMap<&'static str, AccessLevel> {
    HashMap::from([
        ("contents", AccessLevel::Read),
        ("metadata", AccessLevel::Read),
        ("packages", AccessLevel::Read),
        ("actions", AccessLevel::Read),
    ])
}

fn read_write_scopes() -> HashMap<&'static str, AccessLevel> {
    HashMap::from([
        ("contents", AccessLevel::Write),
        ("metadata", AccessLevel::Read),
        ("packages", AccessLevel::Write),
        ("actions", AccessLevel::Write),
    ])
}

fn restricted_scopes() -> HashMap<&'static str, AccessLevel> {
    HashMap::from([("metadata", AccessLevel::Read)])
}
