//! Task assignment: the claim protocol executed when a runner polls.
//!
//! Any number of pollers race over the same waiting jobs; the winner is
//! decided by the repository's conditional claim, never by retry loops here.
//! A poller that loses simply reports "no work this round" and tries again
//! on its next poll.

use crate::resolver::collect_needs;
use ferrite_core::events::StatusChange;
use ferrite_core::ids::{JobId, RunnerId};
use ferrite_core::job::Job;
use ferrite_core::permission::PermissionMode;
use ferrite_core::ports::{
    CredentialIssuer, JobRepository, RunRepository, RunnerRepository, StatusReporter,
    TaskRepository,
};
use ferrite_core::run::Run;
use ferrite_core::status::Status;
use ferrite_core::task::{Task, TaskCredential, TaskDescriptor, TaskStep};
use ferrite_core::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Bounded cache of issued task credentials, keyed by job.
///
/// A poller that issues a credential but then loses the claim race keeps the
/// token around for its next attempt instead of burning another issuance.
/// Capacity comes from [`crate::config::SchedulerConfig`]; eviction is
/// oldest-first.
pub struct CredentialCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    order: VecDeque<JobId>,
    entries: HashMap<JobId, TaskCredential>,
}

impl CredentialCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, job_id: JobId) -> Option<TaskCredential> {
        self.inner.lock().unwrap().entries.get(&job_id).cloned()
    }

    pub fn put(&self, job_id: JobId, credential: TaskCredential) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(&job_id) {
            inner.order.push_back(job_id);
        }
        inner.entries.insert(job_id, credential);
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Remove and return an entry once its claim succeeded.
    pub fn take(&self, job_id: JobId) -> Option<TaskCredential> {
        let mut inner = self.inner.lock().unwrap();
        inner.order.retain(|id| *id != job_id);
        inner.entries.remove(&job_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct TaskAssigner {
    runs: Arc<dyn RunRepository>,
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    runners: Arc<dyn RunnerRepository>,
    issuer: Arc<dyn CredentialIssuer>,
    reporter: Arc<dyn StatusReporter>,
    credentials: CredentialCache,
}

impl TaskAssigner {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        runners: Arc<dyn RunnerRepository>,
        issuer: Arc<dyn CredentialIssuer>,
        reporter: Arc<dyn StatusReporter>,
        credential_cache_size: usize,
    ) -> Self {
        Self {
            runs,
            jobs,
            tasks,
            runners,
            issuer,
            reporter,
            credentials: CredentialCache::new(credential_cache_size),
        }
    }

    /// Let a runner claim at most one ready job.
    ///
    /// Returns `Ok(None)` when no job fits or another poller won the race;
    /// either way the runner just polls again later.
    pub async fn poll(&self, runner_id: RunnerId) -> Result<Option<TaskDescriptor>> {
        let runner = self
            .runners
            .get(runner_id)
            .await?
            .ok_or_else(|| Error::RunnerNotFound(runner_id.to_string()))?;
        self.runners.heartbeat(runner_id, Some(&runner.labels)).await?;

        if runner.capacity > 0 {
            let active = self.tasks.count_active_for_runner(runner_id).await?;
            if active >= runner.capacity as u64 {
                debug!(runner = %runner.id, active, "Runner at capacity");
                return Ok(None);
            }
        }

        let candidates = self.jobs.list_waiting(&runner.scope).await?;
        for job in candidates {
            if !job.labels_match(&runner.labels) {
                continue;
            }
            if job.max_parallel > 0 {
                let running = self
                    .jobs
                    .count_running_siblings(job.run_id, &job.key)
                    .await?;
                if running >= job.max_parallel as u64 {
                    continue;
                }
            }

            let Some(run) = self.runs.get(job.run_id).await? else {
                continue;
            };

            let credential = self.credential_for(&job, &run).await?;
            let steps: Vec<TaskStep> = job
                .payload
                .steps
                .iter()
                .map(|s| TaskStep {
                    name: s.name.clone(),
                    status: Status::Waiting,
                })
                .collect();
            let task = Task::new(job.id, job.run_id, runner_id, credential.token.clone(), steps);

            if !self.jobs.claim(job.id, &task).await? {
                // Another caller won; nothing claimed this round.
                debug!(job = %job.id, "Lost claim race");
                return Ok(None);
            }
            self.credentials.take(job.id);

            info!(job = %job.id, runner = %runner.id, task = %task.id, "Job claimed");
            self.report_job_running(&job, &run).await;

            return Ok(Some(self.descriptor(&job, &run, &task).await?));
        }

        Ok(None)
    }

    async fn credential_for(&self, job: &Job, run: &Run) -> Result<TaskCredential> {
        if let Some(cached) = self.credentials.get(job.id) {
            return Ok(cached);
        }
        // Untrusted triggers get a read-only credential.
        let mode = if run.trigger_event == "pull_request" {
            PermissionMode::ReadOnly
        } else {
            PermissionMode::ReadWrite
        };
        let credential = self.issuer.issue(job, mode).await?;
        self.credentials.put(job.id, credential.clone());
        Ok(credential)
    }

    async fn descriptor(&self, job: &Job, run: &Run, task: &Task) -> Result<TaskDescriptor> {
        let all_jobs = self.jobs.list_by_run(job.run_id).await?;
        let needs = collect_needs(&all_jobs, &job.needs);
        Ok(TaskDescriptor {
            task_id: task.id,
            run_id: run.id,
            job_id: job.id,
            run_index: run.index,
            payload: job.payload.clone(),
            needs,
            token: task.token.clone(),
            trigger_event: run.trigger_event.clone(),
            git_ref: run.git_ref.clone(),
            commit_sha: run.commit_sha.clone(),
            variables: job.payload.variables.clone(),
            secrets: HashMap::new(),
        })
    }

    async fn report_job_running(&self, job: &Job, run: &Run) {
        let mut running = job.clone();
        running.status = Status::Running;
        if let Err(e) = self
            .reporter
            .report(&StatusChange::job(&running, &run.commit_sha))
            .await
        {
            warn!(job = %job.id, error = %e, "Failed to deliver job status");
        }
    }
}
