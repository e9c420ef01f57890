//! Workflow run types.

use crate::ids::{JobId, OrgId, RepoId, RunId, UserId};
use crate::status::Status;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One execution of a workflow file.
///
/// A run's status is always derived from its jobs via
/// [`crate::status::aggregate_job_status`]; nothing sets it directly.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub id: RunId,
    pub repo_id: RepoId,
    pub owner_id: OrgId,
    /// Repository-scoped monotonic run number, assigned transactionally
    /// at insert. 0 until stored.
    pub index: u64,
    /// Workflow file name (e.g. `build.yml`).
    pub workflow_id: String,
    pub title: String,
    pub trigger_event: String,
    pub event_payload: serde_json::Value,
    pub git_ref: String,
    pub commit_sha: String,
    pub status: Status,
    pub need_approval: bool,
    pub approved_by: Option<UserId>,
    /// Set when this run was spawned by a reusable-workflow call from a job
    /// of another run. Forms a tree, never a cycle.
    pub parent_job_id: Option<JobId>,
    /// Evaluated run-level concurrency group; empty means none.
    pub concurrency_group: String,
    pub cancel_in_progress: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }
}

/// Everything the trigger collaborator supplies when inserting a run.
#[derive(Debug, Clone)]
pub struct RunTrigger {
    pub repo_id: RepoId,
    pub owner_id: OrgId,
    pub workflow_id: String,
    pub title: String,
    pub event: String,
    pub payload: serde_json::Value,
    pub git_ref: String,
    pub commit_sha: String,
    pub need_approval: bool,
    pub parent_job_id: Option<JobId>,
    /// Raw run-level concurrency-group expression; empty means none.
    pub raw_concurrency_group: String,
    pub raw_cancel_in_progress: bool,
}

impl RunTrigger {
    pub fn new(repo_id: RepoId, owner_id: OrgId, workflow_id: impl Into<String>) -> Self {
        Self {
            repo_id,
            owner_id,
            workflow_id: workflow_id.into(),
            title: String::new(),
            event: "push".to_string(),
            payload: serde_json::Value::Null,
            git_ref: String::new(),
            commit_sha: String::new(),
            need_approval: false,
            parent_job_id: None,
            raw_concurrency_group: String::new(),
            raw_cancel_in_progress: false,
        }
    }
}
