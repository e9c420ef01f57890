//! Error types for Ferrite CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already completed")]
    RunAlreadyCompleted,

    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Workflow has no jobs")]
    EmptyWorkflow,

    // Task errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    // Runner errors
    #[error("Runner not found: {0}")]
    RunnerNotFound(String),

    // Expression errors
    #[error("Concurrency expression failed: {0}")]
    ConcurrencyExpression(String),

    #[error("Matrix expression failed: {0}")]
    MatrixExpression(String),

    #[error("Condition expression failed: {0}")]
    ConditionExpression(String),

    #[error("Workflow parse failed: {0}")]
    WorkflowParse(String),

    // Credential errors
    #[error("Credential issue failed: {0}")]
    CredentialIssue(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
