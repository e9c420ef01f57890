//! Commit-status reporter implementations.

use async_trait::async_trait;
use ferrite_core::events::StatusChange;
use ferrite_core::ports::StatusReporter;
use ferrite_core::status::Status;
use ferrite_core::{Error, Result};
use tracing::{debug, info};

/// Map a scheduling status onto the commit-status vocabulary.
pub fn commit_state(status: Status) -> &'static str {
    match status {
        Status::Success => "success",
        Status::Failure => "failure",
        Status::Cancelled | Status::Skipped => "error",
        Status::Waiting | Status::Blocked => "pending",
        Status::Running => "running",
        Status::Unknown => "pending",
    }
}

/// Posts status changes to the commit-status endpoint.
pub struct CommitStatusReporter {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl CommitStatusReporter {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn build_payload(&self, change: &StatusChange) -> serde_json::Value {
        match change {
            StatusChange::Run(p) => serde_json::json!({
                "kind": "run",
                "repo_id": p.repo_id,
                "run_id": p.run_id,
                "run_number": p.index,
                "workflow": p.workflow_id,
                "sha": p.commit_sha,
                "state": commit_state(p.status),
                "timestamp": p.timestamp,
            }),
            StatusChange::Job(p) => serde_json::json!({
                "kind": "job",
                "repo_id": p.repo_id,
                "run_id": p.run_id,
                "job_id": p.job_id,
                "context": p.name,
                "sha": p.commit_sha,
                "state": commit_state(p.status),
                "timestamp": p.timestamp,
            }),
        }
    }
}

#[async_trait]
impl StatusReporter for CommitStatusReporter {
    async fn report(&self, change: &StatusChange) -> Result<()> {
        debug!(endpoint = %self.endpoint, "Delivering commit status");

        let mut request = self.client.post(&self.endpoint).json(&self.build_payload(change));
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Notification(format!(
                "commit-status endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Reporter that only logs; useful for development deployments without a
/// commit-status collaborator.
#[derive(Default)]
pub struct LogReporter;

#[async_trait]
impl StatusReporter for LogReporter {
    async fn report(&self, change: &StatusChange) -> Result<()> {
        match change {
            StatusChange::Run(p) => {
                info!(run = %p.run_id, status = %p.status, "Run status change");
            }
            StatusChange::Job(p) => {
                info!(job = %p.job_id, name = %p.name, status = %p.status, "Job status change");
            }
        }
        Ok(())
    }
}
