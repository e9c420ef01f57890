//! Job types: one node of a run's dependency graph.

use crate::ids::{JobId, JobKey, OrgId, RepoId, RunId, TaskId};
use crate::status::Status;
use crate::workflow::JobPayload;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One node of the workflow DAG within a run.
///
/// Matrix expansion multiplies a single definition into several rows sharing
/// the same [`JobKey`]. A job is claimed at most once: `task_id` moves from
/// `None` exactly once, enforced by a conditional update.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub repo_id: RepoId,
    pub owner_id: OrgId,
    pub key: JobKey,
    pub name: String,
    pub needs: Vec<JobKey>,
    pub runs_on: Vec<String>,
    pub status: Status,
    pub attempt: u32,
    /// 0 = unlimited concurrent siblings sharing `(run_id, key)`.
    pub max_parallel: u32,
    /// Raw job-level concurrency-group expression; empty means none.
    pub raw_concurrency_group: String,
    pub raw_cancel_in_progress: bool,
    /// Evaluated concurrency group, valid once `is_concurrency_evaluated`.
    pub concurrency_group: String,
    pub cancel_in_progress: bool,
    pub is_concurrency_evaluated: bool,
    /// Raw strategy text; a `needs.` reference defers matrix expansion.
    pub raw_strategy: String,
    pub is_matrix_evaluated: bool,
    pub if_expr: Option<String>,
    /// The live task, once claimed.
    pub task_id: Option<TaskId>,
    /// Set once, when this job calls a reusable workflow.
    pub child_run_id: Option<RunId>,
    /// Outputs recorded when the job's task finishes.
    pub outputs: HashMap<String, String>,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build the initial row for a parsed job document.
    ///
    /// Jobs with needs start `Blocked`; the dependency resolver promotes them
    /// once their needs settle. The caller decides the final initial status
    /// (approval and concurrency may force `Blocked` on need-free jobs too).
    pub fn from_payload(run_id: RunId, repo_id: RepoId, owner_id: OrgId, payload: JobPayload) -> Self {
        let now = Utc::now();
        let status = if payload.needs.is_empty() {
            Status::Waiting
        } else {
            Status::Blocked
        };
        Self {
            id: JobId::new(),
            run_id,
            repo_id,
            owner_id,
            key: payload.key.clone(),
            name: payload.name.clone(),
            needs: payload.needs.clone(),
            runs_on: payload.runs_on.clone(),
            status,
            attempt: 0,
            max_parallel: payload.max_parallel,
            raw_concurrency_group: payload.raw_concurrency_group.clone(),
            raw_cancel_in_progress: payload.raw_cancel_in_progress,
            concurrency_group: String::new(),
            cancel_in_progress: false,
            is_concurrency_evaluated: false,
            raw_strategy: payload.raw_strategy.clone(),
            // No deferred work unless the strategy references needs.* outputs.
            is_matrix_evaluated: !payload.raw_strategy.contains("needs."),
            if_expr: payload.if_expr.clone(),
            task_id: None,
            child_run_id: None,
            outputs: HashMap::new(),
            payload,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        }
    }

    /// Whether this job still waits on deferred matrix expansion.
    pub fn matrix_pending(&self) -> bool {
        !self.is_matrix_evaluated
    }

    /// Whether a runner with the given label set can execute this job.
    pub fn labels_match(&self, runner_labels: &[String]) -> bool {
        self.runs_on.iter().all(|l| runner_labels.contains(l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: &str, needs: Vec<&str>, strategy: &str) -> JobPayload {
        JobPayload {
            key: JobKey::new(key),
            name: key.to_string(),
            needs: needs.into_iter().map(JobKey::from).collect(),
            runs_on: vec!["ubuntu-latest".to_string()],
            raw_concurrency_group: String::new(),
            raw_cancel_in_progress: false,
            raw_strategy: strategy.to_string(),
            max_parallel: 0,
            if_expr: None,
            steps: vec![],
            variables: HashMap::new(),
            source: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_initial_status_from_needs() {
        let run_id = RunId::new();
        let repo_id = RepoId::new();
        let owner_id = OrgId::new();

        let free = Job::from_payload(run_id, repo_id, owner_id, payload("build", vec![], ""));
        assert_eq!(free.status, Status::Waiting);

        let gated = Job::from_payload(run_id, repo_id, owner_id, payload("test", vec!["build"], ""));
        assert_eq!(gated.status, Status::Blocked);
    }

    #[test]
    fn test_matrix_deferral_detection() {
        let run_id = RunId::new();
        let repo_id = RepoId::new();
        let owner_id = OrgId::new();

        let static_matrix = Job::from_payload(
            run_id,
            repo_id,
            owner_id,
            payload("build", vec![], "matrix:\n  os: [linux, macos]"),
        );
        assert!(!static_matrix.matrix_pending());

        let deferred = Job::from_payload(
            run_id,
            repo_id,
            owner_id,
            payload(
                "deploy",
                vec!["plan"],
                "matrix:\n  target: ${{ fromJSON(needs.plan.outputs.targets) }}",
            ),
        );
        assert!(deferred.matrix_pending());
    }

    #[test]
    fn test_labels_match_superset() {
        let job = Job::from_payload(
            RunId::new(),
            RepoId::new(),
            OrgId::new(),
            payload("build", vec![], ""),
        );
        assert!(job.labels_match(&["ubuntu-latest".to_string(), "x64".to_string()]));
        assert!(!job.labels_match(&["macos".to_string()]));
    }
}
