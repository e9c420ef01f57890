//! Runner types: worker identities that claim and execute tasks.

use crate::ids::{OrgId, RepoId, RunnerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered worker process.
///
/// The scheduler never mutates a runner except for heartbeats and label
/// declarations refreshed on poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub name: String,
    pub version: Option<String>,
    /// Fixed plus custom labels, merged at registration.
    pub labels: Vec<String>,
    /// Max concurrent tasks; 0 = unlimited.
    pub capacity: u32,
    pub scope: RunnerScope,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Visibility scope of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerScope {
    Global,
    Organization { owner_id: OrgId },
    Repository { repo_id: RepoId },
}

impl Runner {
    /// Whether this runner may see work belonging to the given repository.
    pub fn sees(&self, repo_id: RepoId, owner_id: OrgId) -> bool {
        match self.scope {
            RunnerScope::Global => true,
            RunnerScope::Organization { owner_id: o } => o == owner_id,
            RunnerScope::Repository { repo_id: r } => r == repo_id,
        }
    }
}
