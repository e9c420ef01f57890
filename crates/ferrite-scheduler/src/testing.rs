//! In-memory repositories and stub collaborators for scheduler tests.
//!
//! The memory store honors the same contracts as the Postgres layer: one
//! mutex guards all tables, so composite operations (`create_with_jobs`,
//! `claim`, `finish_matrix_expansion`) are atomic and conditional updates
//! report whether a row actually changed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferrite_core::Result;
use ferrite_core::ids::*;
use ferrite_core::job::Job;
use ferrite_core::permission::PermissionMode;
use ferrite_core::ports::*;
use ferrite_core::run::Run;
use ferrite_core::runner::{Runner, RunnerScope};
use ferrite_core::status::{Status, aggregate_job_status};
use ferrite_core::task::{Task, TaskCredential};
use ferrite_core::workflow::{EvalContext, JobPayload};
use ferrite_core::events::StatusChange;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    runs: HashMap<RunId, Run>,
    jobs: HashMap<JobId, Job>,
    tasks: HashMap<TaskId, Task>,
    runners: HashMap<RunnerId, Runner>,
    indexes: HashMap<RepoId, u64>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, id: JobId) -> Job {
        self.state.lock().unwrap().jobs[&id].clone()
    }

    pub fn run(&self, id: RunId) -> Run {
        self.state.lock().unwrap().runs[&id].clone()
    }

    pub fn task(&self, id: TaskId) -> Task {
        self.state.lock().unwrap().tasks[&id].clone()
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    pub fn jobs_of(&self, run_id: RunId) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    pub fn put_job(&self, job: Job) {
        self.state.lock().unwrap().jobs.insert(job.id, job);
    }

    pub fn put_run(&self, run: Run) {
        self.state.lock().unwrap().runs.insert(run.id, run);
    }

    pub fn put_task(&self, task: Task) {
        self.state.lock().unwrap().tasks.insert(task.id, task);
    }
}

fn group_occupied_by_jobs(state: &State, repo_id: RepoId, group: &str) -> bool {
    state.jobs.values().any(|j| {
        j.repo_id == repo_id
            && j.is_concurrency_evaluated
            && j.concurrency_group == group
            && matches!(j.status, Status::Waiting | Status::Running)
    })
}

#[async_trait]
impl RunRepository for MemStore {
    async fn create_with_jobs(&self, run: &Run, jobs: &[Job]) -> Result<Run> {
        let mut state = self.state.lock().unwrap();
        let index = state.indexes.entry(run.repo_id).or_insert(0);
        *index += 1;

        let mut run = run.clone();
        run.index = *index;

        if !run.concurrency_group.is_empty() && !run.cancel_in_progress {
            let occupied = state.runs.values().any(|r| {
                r.repo_id == run.repo_id
                    && r.concurrency_group == run.concurrency_group
                    && !r.is_done()
                    && r.id != run.id
            });
            if occupied {
                run.status = Status::Blocked;
            }
        }

        let park_all = run.status == Status::Blocked || run.need_approval;
        let mut stored_jobs = Vec::with_capacity(jobs.len());
        for job in jobs {
            let mut job = job.clone();
            if park_all {
                job.status = Status::Blocked;
            } else if job.status == Status::Waiting
                && job.is_concurrency_evaluated
                && !job.concurrency_group.is_empty()
                && !job.cancel_in_progress
                && group_occupied_by_jobs(&state, job.repo_id, &job.concurrency_group)
            {
                job.status = Status::Blocked;
            }
            stored_jobs.push(job);
        }

        if run.status != Status::Blocked {
            let statuses: Vec<Status> = stored_jobs.iter().map(|j| j.status).collect();
            run.status = aggregate_job_status(&statuses);
        }

        for job in stored_jobs {
            state.jobs.insert(job.id, job);
        }
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.state.lock().unwrap().runs.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: RunId,
        status: Status,
        stopped_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(run) = state.runs.get_mut(&id) {
            run.status = status;
            run.updated_at = Utc::now();
            if status == Status::Running && run.started_at.is_none() {
                run.started_at = Some(Utc::now());
            }
            if stopped_at.is_some() {
                run.stopped_at = stopped_at;
            }
        }
        Ok(())
    }

    async fn set_approved(&self, id: RunId, approved_by: UserId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.runs.get_mut(&id) {
            Some(run) if run.need_approval && run.approved_by.is_none() => {
                run.approved_by = Some(approved_by);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active_in_group(
        &self,
        repo_id: RepoId,
        group: &str,
        exclude: Option<RunId>,
    ) -> Result<Vec<Run>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|r| {
                r.repo_id == repo_id
                    && r.concurrency_group == group
                    && !r.is_done()
                    && r.status != Status::Blocked
                    && Some(r.id) != exclude
            })
            .cloned()
            .collect())
    }

    async fn oldest_blocked_in_group(&self, repo_id: RepoId, group: &str) -> Result<Option<Run>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|r| {
                r.repo_id == repo_id
                    && r.concurrency_group == group
                    && r.status == Status::Blocked
            })
            .min_by_key(|r| (r.created_at, r.id))
            .cloned())
    }
}

#[async_trait]
impl JobRepository for MemStore {
    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn list_by_run(&self, run_id: RunId) -> Result<Vec<Job>> {
        Ok(self.jobs_of(run_id))
    }

    async fn update_status_if(&self, id: JobId, expected: Status, status: Status) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == expected => {
                job.status = status;
                job.updated_at = Utc::now();
                if status.is_done() {
                    job.stopped_at = Some(Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim(&self, id: JobId, task: &Task) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.task_id.is_some() || job.status != Status::Waiting {
            return Ok(false);
        }
        job.task_id = Some(task.id);
        job.status = Status::Running;
        job.attempt += 1;
        job.started_at = Some(task.started_at);
        job.updated_at = Utc::now();
        state.tasks.insert(task.id, task.clone());
        Ok(true)
    }

    async fn finish(
        &self,
        id: JobId,
        status: Status,
        outputs: &HashMap<String, String>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == Status::Running => {
                job.status = status;
                job.outputs = outputs.clone();
                job.updated_at = Utc::now();
                job.stopped_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, id: JobId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status.is_done() {
            return Ok(false);
        }
        job.status = Status::Cancelled;
        job.updated_at = Utc::now();
        job.stopped_at = Some(Utc::now());
        let task_id = job.task_id;
        if let Some(task_id) = task_id
            && let Some(task) = state.tasks.get_mut(&task_id)
            && !task.status.is_done()
        {
            task.status = Status::Cancelled;
            task.stopped_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn list_waiting(&self, scope: &RunnerScope) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == Status::Waiting && j.task_id.is_none())
            .filter(|j| match scope {
                RunnerScope::Global => true,
                RunnerScope::Organization { owner_id } => j.owner_id == *owner_id,
                RunnerScope::Repository { repo_id } => j.repo_id == *repo_id,
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn count_running_siblings(&self, run_id: RunId, key: &JobKey) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| j.run_id == run_id && j.key == *key && j.status == Status::Running)
            .count() as u64)
    }

    async fn list_in_group(
        &self,
        repo_id: RepoId,
        group: &str,
        statuses: &[Status],
        exclude: Option<JobId>,
    ) -> Result<Vec<Job>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| {
                j.repo_id == repo_id
                    && j.is_concurrency_evaluated
                    && j.concurrency_group == group
                    && statuses.contains(&j.status)
                    && Some(j.id) != exclude
            })
            .cloned()
            .collect())
    }

    async fn oldest_blocked_in_group(&self, repo_id: RepoId, group: &str) -> Result<Option<Job>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| {
                j.repo_id == repo_id
                    && j.is_concurrency_evaluated
                    && j.concurrency_group == group
                    && j.status == Status::Blocked
            })
            .min_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn set_concurrency(&self, id: JobId, group: &str, cancel_in_progress: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&id) {
            job.concurrency_group = group.to_string();
            job.cancel_in_progress = cancel_in_progress;
            job.is_concurrency_evaluated = true;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn finish_matrix_expansion(&self, placeholder: &Job, siblings: &[Job]) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get(&placeholder.id) {
            Some(existing) if !existing.is_matrix_evaluated => {}
            _ => return Ok(false),
        }
        state.jobs.insert(placeholder.id, placeholder.clone());
        for sibling in siblings {
            state.jobs.insert(sibling.id, sibling.clone());
        }
        Ok(true)
    }

    async fn set_child_run(&self, id: JobId, child_run_id: RunId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&id) {
            job.child_run_id = Some(child_run_id);
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_stale(&self, statuses: &[Status], before: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status) && j.updated_at < before)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaskRepository for MemStore {
    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.state.lock().unwrap().tasks.get(&id).cloned())
    }

    async fn finish(
        &self,
        id: TaskId,
        status: Status,
        outputs: &HashMap<String, String>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.tasks.get_mut(&id) {
            Some(task) if task.status == Status::Running => {
                task.status = status;
                task.outputs = outputs.clone();
                task.updated_at = Utc::now();
                task.stopped_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, id: TaskId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            task.updated_at = at;
        }
        Ok(())
    }

    async fn count_active_for_runner(&self, runner_id: RunnerId) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.runner_id == runner_id && !t.status.is_done())
            .count() as u64)
    }

    async fn list_zombies(&self, updated_before: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.status == Status::Running && t.updated_at < updated_before)
            .cloned()
            .collect())
    }

    async fn list_endless(&self, started_before: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.status == Status::Running && t.started_at < started_before)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RunnerRepository for MemStore {
    async fn register(&self, runner: &Runner) -> Result<RunnerId> {
        let mut state = self.state.lock().unwrap();
        state.runners.insert(runner.id, runner.clone());
        Ok(runner.id)
    }

    async fn get(&self, id: RunnerId) -> Result<Option<Runner>> {
        Ok(self.state.lock().unwrap().runners.get(&id).cloned())
    }

    async fn heartbeat(&self, id: RunnerId, labels: Option<&[String]>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(runner) = state.runners.get_mut(&id) {
            runner.last_heartbeat_at = Some(Utc::now());
            if let Some(labels) = labels {
                runner.labels = labels.to_vec();
            }
        }
        Ok(())
    }
}

/// Expression evaluator stub with canned answers.
#[derive(Default)]
pub struct StubEvaluator {
    pub condition: bool,
    pub fail_condition: bool,
    pub fail_matrix: bool,
    pub matrix_variants: Option<Vec<JobPayload>>,
}

impl StubEvaluator {
    pub fn truthy() -> Self {
        Self {
            condition: true,
            ..Self::default()
        }
    }

    pub fn with_matrix(variants: Vec<JobPayload>) -> Self {
        Self {
            matrix_variants: Some(variants),
            ..Self::default()
        }
    }
}

impl ExpressionEvaluator for StubEvaluator {
    fn eval_string(&self, expr: &str, _ctx: &EvalContext) -> Result<String> {
        Ok(expr.to_string())
    }

    fn eval_condition(&self, _expr: &str, _ctx: &EvalContext) -> Result<bool> {
        if self.fail_condition {
            return Err(ferrite_core::Error::ConditionExpression("stub".to_string()));
        }
        Ok(self.condition)
    }

    fn expand_matrix(&self, payload: &JobPayload, _ctx: &EvalContext) -> Result<Vec<JobPayload>> {
        if self.fail_matrix {
            return Err(ferrite_core::Error::MatrixExpression("stub".to_string()));
        }
        Ok(self
            .matrix_variants
            .clone()
            .unwrap_or_else(|| vec![payload.clone()]))
    }
}

/// Parser stub returning prebuilt payloads.
pub struct StubParser {
    pub payloads: Vec<JobPayload>,
}

impl WorkflowParser for StubParser {
    fn parse(&self, _source: &[u8], _ctx: &EvalContext) -> Result<Vec<JobPayload>> {
        Ok(self.payloads.clone())
    }
}

/// Credential issuer stub that counts issuances.
#[derive(Default)]
pub struct StubIssuer {
    pub issued: AtomicUsize,
}

#[async_trait]
impl CredentialIssuer for StubIssuer {
    async fn issue(&self, job: &Job, _mode: PermissionMode) -> Result<TaskCredential> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(TaskCredential {
            token: format!("tok-{}-{}", job.id, n),
            expires_at: None,
        })
    }
}

/// Reporter stub that records every status change.
#[derive(Default)]
pub struct RecordingReporter {
    pub changes: Mutex<Vec<StatusChange>>,
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, change: &StatusChange) -> Result<()> {
        self.changes.lock().unwrap().push(change.clone());
        Ok(())
    }
}

pub fn payload(key: &str, needs: &[&str]) -> JobPayload {
    JobPayload {
        key: JobKey::new(key),
        name: key.to_string(),
        needs: needs.iter().map(|n| JobKey::from(*n)).collect(),
        runs_on: vec!["ubuntu-latest".to_string()],
        raw_concurrency_group: String::new(),
        raw_cancel_in_progress: false,
        raw_strategy: String::new(),
        max_parallel: 0,
        if_expr: None,
        steps: vec![],
        variables: HashMap::new(),
        source: serde_json::Value::Null,
    }
}

pub fn job_with_needs(run: RunId, repo: RepoId, org: OrgId, key: &str, needs: &[&str]) -> Job {
    Job::from_payload(run, repo, org, payload(key, needs))
}

pub fn make_run(repo: RepoId, org: OrgId) -> Run {
    Run {
        id: RunId::new(),
        repo_id: repo,
        owner_id: org,
        index: 0,
        workflow_id: "build.yml".to_string(),
        title: "test run".to_string(),
        trigger_event: "push".to_string(),
        event_payload: serde_json::Value::Null,
        git_ref: "refs/heads/main".to_string(),
        commit_sha: "0123456789abcdef".to_string(),
        status: Status::Waiting,
        need_approval: false,
        approved_by: None,
        parent_job_id: None,
        concurrency_group: String::new(),
        cancel_in_progress: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        started_at: None,
        stopped_at: None,
    }
}

pub fn make_runner(scope: RunnerScope, labels: &[&str], capacity: u32) -> Runner {
    Runner {
        id: RunnerId::new(),
        name: "mock-runner".to_string(),
        version: Some("1.0".to_string()),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        capacity,
        scope,
        registered_at: Utc::now(),
        last_heartbeat_at: Some(Utc::now()),
    }
}
