//! Status-change events consumed by the notification layer.

use crate::ids::{JobId, JobKey, RepoId, RunId};
use crate::status::Status;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A status transition of interest to the commit-status collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusChange {
    Run(RunStatusPayload),
    Job(JobStatusPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStatusPayload {
    pub run_id: RunId,
    pub repo_id: RepoId,
    pub index: u64,
    pub workflow_id: String,
    pub commit_sha: String,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub repo_id: RepoId,
    pub key: JobKey,
    pub name: String,
    pub commit_sha: String,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

impl StatusChange {
    pub fn run(run: &crate::run::Run) -> Self {
        StatusChange::Run(RunStatusPayload {
            run_id: run.id,
            repo_id: run.repo_id,
            index: run.index,
            workflow_id: run.workflow_id.clone(),
            commit_sha: run.commit_sha.clone(),
            status: run.status,
            timestamp: Utc::now(),
        })
    }

    pub fn job(job: &crate::job::Job, commit_sha: &str) -> Self {
        StatusChange::Job(JobStatusPayload {
            run_id: job.run_id,
            job_id: job.id,
            repo_id: job.repo_id,
            key: job.key.clone(),
            name: job.name.clone(),
            commit_sha: commit_sha.to_string(),
            status: job.status,
            timestamp: Utc::now(),
        })
    }

    pub fn status(&self) -> Status {
        match self {
            StatusChange::Run(p) => p.status,
            StatusChange::Job(p) => p.status,
        }
    }
}
