//! Task types: one runner's attempt at a job.

use crate::ids::{JobId, RunId, RunnerId, TaskId};
use crate::status::Status;
use crate::workflow::{JobPayload, NeedContext};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One attempt by one runner to execute a job's steps.
///
/// Created only through the task assigner. A job may accumulate several
/// tasks across reruns, but at most one non-terminal task at a time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub run_id: RunId,
    pub runner_id: RunnerId,
    pub status: Status,
    pub steps: Vec<TaskStep>,
    /// Opaque per-task credential issued by the permission service.
    pub token: String,
    /// Outputs reported by the runner on completion.
    pub outputs: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Advanced on every runner report; heartbeat silence marks a zombie.
    pub updated_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(job_id: JobId, run_id: RunId, runner_id: RunnerId, token: String, steps: Vec<TaskStep>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            job_id,
            run_id,
            runner_id,
            status: Status::Running,
            steps,
            token,
            outputs: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: now,
            stopped_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskStep {
    pub name: String,
    pub status: Status,
}

/// Scoped credential attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCredential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything a runner receives when it successfully claims a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub job_id: JobId,
    /// Repository-scoped run number, for display contexts.
    pub run_index: u64,
    /// The job's serialized workflow payload.
    pub payload: JobPayload,
    /// Resolved outcome of every needed job, keyed by job key.
    pub needs: HashMap<String, NeedContext>,
    pub token: String,
    /// Trigger metadata forwarded verbatim.
    pub trigger_event: String,
    pub git_ref: String,
    pub commit_sha: String,
    /// Declared variables handed through to step execution.
    pub variables: HashMap<String, String>,
    /// Declared secrets, already resolved by the secret collaborator.
    pub secrets: HashMap<String, String>,
}

/// A runner's out-of-band completion report for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: Status,
    pub outputs: HashMap<String, String>,
    pub steps: Vec<TaskStep>,
}
