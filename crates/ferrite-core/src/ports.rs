//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and
//! external adapters: the workflow parser, the expression evaluator, the
//! permission/token service, the commit-status layer, and persistence.
//!
//! Scheduling correctness rests on the repository contracts below: the
//! composite operations (`create_with_jobs`, `claim`,
//! `finish_matrix_expansion`) are transactional, and the `*_if` operations
//! are conditional updates that report whether a row actually changed. A
//! `false` return is never an error; it means another caller already acted.

use crate::error::Result;
use crate::events::StatusChange;
use crate::ids::{JobId, JobKey, RepoId, RunId, RunnerId, TaskId};
use crate::job::Job;
use crate::permission::PermissionMode;
use crate::run::Run;
use crate::runner::{Runner, RunnerScope};
use crate::status::Status;
use crate::task::{Task, TaskCredential};
use crate::workflow::{EvalContext, JobPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Workflow-file parser collaborator.
///
/// Splits raw workflow bytes into single-job documents, with static matrices
/// already multiplied out.
pub trait WorkflowParser: Send + Sync {
    fn parse(&self, source: &[u8], ctx: &EvalContext) -> Result<Vec<JobPayload>>;
}

/// Expression evaluator collaborator.
///
/// Pure functions over raw expression text and a variable context. Matrix
/// expansion takes the job document plus the merged `needs.*` variables and
/// returns concrete variants directly.
pub trait ExpressionEvaluator: Send + Sync {
    fn eval_string(&self, expr: &str, ctx: &EvalContext) -> Result<String>;

    fn eval_condition(&self, expr: &str, ctx: &EvalContext) -> Result<bool>;

    fn expand_matrix(&self, payload: &JobPayload, ctx: &EvalContext) -> Result<Vec<JobPayload>>;
}

/// Permission/token service collaborator.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, job: &Job, mode: PermissionMode) -> Result<TaskCredential>;
}

/// Commit-status / notification collaborator.
///
/// Call sites treat delivery as fire-and-forget: failures are logged, never
/// propagated into scheduling decisions.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, change: &StatusChange) -> Result<()>;
}

/// Repository for runs.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert a run with all its jobs in one transaction.
    ///
    /// Inside that transaction the repository assigns the repo-scoped
    /// monotonic index and applies concurrency blocking: a run whose
    /// evaluated group is occupied (and does not cancel in progress) is
    /// stored `Blocked`, as is any need-free job whose evaluated group is
    /// occupied. Returns the run as stored.
    async fn create_with_jobs(&self, run: &Run, jobs: &[Job]) -> Result<Run>;

    async fn get(&self, id: RunId) -> Result<Option<Run>>;

    async fn update_status(
        &self,
        id: RunId,
        status: Status,
        stopped_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn set_approved(&self, id: RunId, approved_by: crate::ids::UserId) -> Result<bool>;

    /// Non-terminal runs occupying a concurrency group.
    async fn list_active_in_group(
        &self,
        repo_id: RepoId,
        group: &str,
        exclude: Option<RunId>,
    ) -> Result<Vec<Run>>;

    /// Oldest run parked `Blocked` on a concurrency group, if any.
    async fn oldest_blocked_in_group(&self, repo_id: RepoId, group: &str)
    -> Result<Option<Run>>;
}

/// Repository for jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    async fn list_by_run(&self, run_id: RunId) -> Result<Vec<Job>>;

    /// Guarded status transition: `WHERE status = expected`. Returns whether
    /// a row changed; `false` means another caller acted first.
    async fn update_status_if(&self, id: JobId, expected: Status, status: Status)
    -> Result<bool>;

    /// Atomically claim a job for a task: the conditional update
    /// (`WHERE id = ? AND task_id IS NULL AND status = waiting`) and the
    /// task insert commit together or not at all.
    async fn claim(&self, id: JobId, task: &Task) -> Result<bool>;

    /// Record a finished task's outcome on its job
    /// (`WHERE status = running`).
    async fn finish(
        &self,
        id: JobId,
        status: Status,
        outputs: &HashMap<String, String>,
    ) -> Result<bool>;

    /// Force an active job (`waiting`/`blocked`/`running`) to `Cancelled`.
    async fn cancel(&self, id: JobId) -> Result<bool>;

    /// Unclaimed `Waiting` jobs visible to the given runner scope, oldest
    /// first.
    async fn list_waiting(&self, scope: &RunnerScope) -> Result<Vec<Job>>;

    /// Currently `Running` rows sharing `(run_id, key)`.
    async fn count_running_siblings(&self, run_id: RunId, key: &JobKey) -> Result<u64>;

    /// Jobs of a concurrency group in any of the given statuses.
    async fn list_in_group(
        &self,
        repo_id: RepoId,
        group: &str,
        statuses: &[Status],
        exclude: Option<JobId>,
    ) -> Result<Vec<Job>>;

    /// Oldest evaluated job parked `Blocked` on a concurrency group.
    async fn oldest_blocked_in_group(&self, repo_id: RepoId, group: &str)
    -> Result<Option<Job>>;

    /// Store an evaluated concurrency group and set the evaluated flag.
    async fn set_concurrency(
        &self,
        id: JobId,
        group: &str,
        cancel_in_progress: bool,
    ) -> Result<()>;

    /// Complete a deferred matrix expansion transactionally: rewrite the
    /// placeholder row and insert sibling cells, guarded on
    /// `is_matrix_evaluated = false` so a retry after partial failure cannot
    /// duplicate cells. Returns whether this caller performed the expansion.
    async fn finish_matrix_expansion(&self, placeholder: &Job, siblings: &[Job]) -> Result<bool>;

    /// Record the child run spawned by a reusable-workflow job.
    async fn set_child_run(&self, id: JobId, child_run_id: RunId) -> Result<()>;

    /// Jobs stuck in the given statuses and not updated since `before`.
    async fn list_stale(&self, statuses: &[Status], before: DateTime<Utc>) -> Result<Vec<Job>>;
}

/// Repository for tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get(&self, id: TaskId) -> Result<Option<Task>>;

    /// Terminal transition (`WHERE status = running`). Returns whether a row
    /// changed.
    async fn finish(
        &self,
        id: TaskId,
        status: Status,
        outputs: &HashMap<String, String>,
    ) -> Result<bool>;

    /// Advance the heartbeat timestamp.
    async fn heartbeat(&self, id: TaskId, at: DateTime<Utc>) -> Result<()>;

    async fn count_active_for_runner(&self, runner_id: RunnerId) -> Result<u64>;

    /// Running tasks whose heartbeat went silent before `updated_before`.
    async fn list_zombies(&self, updated_before: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Running tasks started before `started_before`, heartbeats or not.
    async fn list_endless(&self, started_before: DateTime<Utc>) -> Result<Vec<Task>>;
}

/// Repository for runners.
#[async_trait]
pub trait RunnerRepository: Send + Sync {
    async fn register(&self, runner: &Runner) -> Result<RunnerId>;

    async fn get(&self, id: RunnerId) -> Result<Option<Runner>>;

    /// Heartbeat and label declaration, refreshed on every poll.
    async fn heartbeat(&self, id: RunnerId, labels: Option<&[String]>) -> Result<()>;
}
