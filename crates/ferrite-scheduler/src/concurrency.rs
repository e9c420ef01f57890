//! Concurrency groups: mutual exclusion across runs and jobs.
//!
//! Both mechanisms key on `(repository, group)`. Run-level groups gate whole
//! runs at insert; job-level groups are evaluated either at insert (jobs
//! without needs) or when the dependency resolver unblocks the job, since
//! the group expression may reference `needs.*`.

use crate::queue::RecheckQueue;
use crate::resolver::collect_needs;
use ferrite_core::events::StatusChange;
use ferrite_core::ids::{RepoId, RunId};
use ferrite_core::job::Job;
use ferrite_core::ports::{
    ExpressionEvaluator, JobRepository, RunRepository, StatusReporter,
};
use ferrite_core::run::RunTrigger;
use ferrite_core::status::Status;
use ferrite_core::workflow::EvalContext;
use ferrite_core::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub struct ConcurrencyController {
    runs: Arc<dyn RunRepository>,
    jobs: Arc<dyn JobRepository>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    reporter: Arc<dyn StatusReporter>,
    queue: Arc<RecheckQueue>,
}

impl ConcurrencyController {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        jobs: Arc<dyn JobRepository>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        reporter: Arc<dyn StatusReporter>,
        queue: Arc<RecheckQueue>,
    ) -> Self {
        Self {
            runs,
            jobs,
            evaluator,
            reporter,
            queue,
        }
    }

    /// Evaluate a run-level concurrency-group expression.
    ///
    /// Evaluation failure is fatal to the triggering operation: without the
    /// group name, exclusivity cannot be guaranteed.
    pub fn evaluate_run_group(&self, trigger: &RunTrigger) -> Result<(String, bool)> {
        if trigger.raw_concurrency_group.is_empty() {
            return Ok((String::new(), false));
        }
        let ctx = EvalContext {
            event: Some(trigger.payload.clone()),
            ..EvalContext::new()
        };
        let group = self
            .evaluator
            .eval_string(&trigger.raw_concurrency_group, &ctx)
            .map_err(|e| Error::ConcurrencyExpression(e.to_string()))?;
        Ok((group, trigger.raw_cancel_in_progress))
    }

    /// Evaluate a job-level concurrency-group expression. `all_jobs` supplies
    /// the `needs.*` context for jobs whose evaluation was deferred.
    pub fn evaluate_job_group(&self, job: &Job, all_jobs: &[Job]) -> Result<(String, bool)> {
        let ctx = EvalContext {
            needs: collect_needs(all_jobs, &job.needs),
            ..EvalContext::new()
        };
        let group = self
            .evaluator
            .eval_string(&job.raw_concurrency_group, &ctx)
            .map_err(|e| Error::ConcurrencyExpression(e.to_string()))?;
        Ok((group, job.raw_cancel_in_progress))
    }

    /// Apply the group policy for a job whose group was just evaluated and
    /// stored. Returns the status the job itself should take.
    ///
    /// With `cancel_in_progress`, every other active occupant of the group
    /// is cancelled (running ones included) and the new job proceeds. Without
    /// it, queued occupants are superseded but a running one keeps the group:
    /// the new job parks `Blocked` until the group frees up.
    pub async fn apply_job_policy(&self, job: &Job, group: &str, cancel: bool) -> Result<Status> {
        if group.is_empty() {
            return Ok(Status::Waiting);
        }
        let others = self
            .jobs
            .list_in_group(
                job.repo_id,
                group,
                &[Status::Waiting, Status::Blocked, Status::Running],
                Some(job.id),
            )
            .await?;

        if cancel {
            self.cancel_jobs(&others).await;
            return Ok(Status::Waiting);
        }

        let mut running = false;
        let mut superseded = Vec::new();
        for other in others {
            if other.status == Status::Running {
                running = true;
            } else {
                superseded.push(other);
            }
        }
        self.cancel_jobs(&superseded).await;
        Ok(if running { Status::Blocked } else { Status::Waiting })
    }

    /// Cancel the active runs occupying a run-level group, making way for a
    /// newly inserted run with `cancel-in-progress`.
    pub async fn apply_run_policy(&self, repo_id: RepoId, group: &str, new_run: RunId) {
        let occupants = match self.runs.list_active_in_group(repo_id, group, Some(new_run)).await {
            Ok(occupants) => occupants,
            Err(e) => {
                warn!(repo_id = %repo_id, group, error = %e, "Failed to list concurrency occupants");
                return;
            }
        };
        for run in occupants {
            self.cancel_run(run.id).await;
        }
    }

    /// Soft-cancel every active job of a run, recursing into reusable-workflow
    /// child runs. Row failures are logged and do not stop the sweep.
    pub async fn cancel_run(&self, run_id: RunId) {
        let mut pending = vec![run_id];
        while let Some(current) = pending.pop() {
            let jobs = match self.jobs.list_by_run(current).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(run_id = %current, error = %e, "Failed to load jobs for cancellation");
                    continue;
                }
            };
            for job in jobs {
                if job.status.is_done() {
                    continue;
                }
                match self.jobs.cancel(job.id).await {
                    Ok(true) => {
                        self.report_job_cancelled(&job).await;
                        if let Some(child) = job.child_run_id {
                            pending.push(child);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(job = %job.id, error = %e, "Failed to cancel job");
                    }
                }
            }
            self.queue.push(current);
        }
    }

    /// Cancel a specific set of jobs (group occupants), recursing into their
    /// child runs.
    pub async fn cancel_jobs(&self, targets: &[Job]) {
        for job in targets {
            match self.jobs.cancel(job.id).await {
                Ok(true) => {
                    info!(job = %job.id, group = %job.concurrency_group, "Cancelled superseded job");
                    self.report_job_cancelled(job).await;
                    if let Some(child) = job.child_run_id {
                        self.cancel_run(child).await;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(job = %job.id, error = %e, "Failed to cancel job");
                }
            }
            self.queue.push(job.run_id);
        }
    }

    /// Release sweep after a group member reached a terminal status: when no
    /// occupant holds the group any more, wake the oldest parked job and the
    /// oldest parked run so the group never wedges.
    pub async fn sweep_group(&self, repo_id: RepoId, group: &str) -> Result<()> {
        if group.is_empty() {
            return Ok(());
        }

        let occupants = self
            .jobs
            .list_in_group(repo_id, group, &[Status::Waiting, Status::Running], None)
            .await?;
        if occupants.is_empty()
            && let Some(parked) = self.jobs.oldest_blocked_in_group(repo_id, group).await?
            && self
                .jobs
                .update_status_if(parked.id, Status::Blocked, Status::Waiting)
                .await?
        {
            info!(job = %parked.id, group, "Promoted job out of concurrency group");
            self.queue.push(parked.run_id);
        }

        let run_occupants = self.runs.list_active_in_group(repo_id, group, None).await?;
        if run_occupants.is_empty()
            && let Some(parked) = self.runs.oldest_blocked_in_group(repo_id, group).await?
        {
            info!(run = %parked.id, group, "Promoted run out of concurrency group");
            self.runs
                .update_status(parked.id, Status::Waiting, None)
                .await?;
            self.queue.push(parked.id);
        }

        Ok(())
    }

    async fn report_job_cancelled(&self, job: &Job) {
        let sha = match self.runs.get(job.run_id).await {
            Ok(Some(run)) => run.commit_sha,
            _ => String::new(),
        };
        let mut cancelled = job.clone();
        cancelled.status = Status::Cancelled;
        if let Err(e) = self
            .reporter
            .report(&StatusChange::job(&cancelled, &sha))
            .await
        {
            warn!(job = %job.id, error = %e, "Failed to deliver job status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use ferrite_core::ids::{JobId, OrgId, RunnerId};
    use ferrite_core::task::Task;

    struct Fixture {
        store: Arc<MemStore>,
        controller: ConcurrencyController,
        queue: Arc<RecheckQueue>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let queue = Arc::new(RecheckQueue::new());
        let controller = ConcurrencyController::new(
            store.clone(),
            store.clone(),
            Arc::new(StubEvaluator::default()),
            Arc::new(RecordingReporter::default()),
            queue.clone(),
        );
        Fixture {
            store,
            controller,
            queue,
        }
    }

    fn grouped_job(repo: RepoId, org: OrgId, group: &str, status: Status) -> Job {
        let mut job = job_with_needs(RunId::new(), repo, org, "deploy", &[]);
        job.concurrency_group = group.to_string();
        job.is_concurrency_evaluated = true;
        job.status = status;
        job
    }

    #[tokio::test]
    async fn test_cancel_in_progress_cancels_running_occupant() {
        let f = fixture();
        let repo = RepoId::new();
        let org = OrgId::new();

        let mut occupant = grouped_job(repo, org, "prod", Status::Running);
        let task = Task::new(occupant.id, occupant.run_id, RunnerId::new(), "tok".into(), vec![]);
        occupant.task_id = Some(task.id);
        f.store.put_run(make_run(repo, org));
        f.store.put_task(task.clone());
        f.store.put_job(occupant.clone());

        let newcomer = grouped_job(repo, org, "prod", Status::Waiting);
        f.store.put_job(newcomer.clone());

        let status = f
            .controller
            .apply_job_policy(&newcomer, "prod", true)
            .await
            .unwrap();

        assert_eq!(status, Status::Waiting);
        assert_eq!(f.store.job(occupant.id).status, Status::Cancelled);
        assert_eq!(f.store.task(task.id).status, Status::Cancelled);
    }

    #[tokio::test]
    async fn test_without_cancel_running_occupant_blocks_newcomer() {
        let f = fixture();
        let repo = RepoId::new();
        let org = OrgId::new();

        let running = grouped_job(repo, org, "prod", Status::Running);
        let queued = grouped_job(repo, org, "prod", Status::Waiting);
        f.store.put_job(running.clone());
        f.store.put_job(queued.clone());

        let newcomer = grouped_job(repo, org, "prod", Status::Waiting);
        f.store.put_job(newcomer.clone());

        let status = f
            .controller
            .apply_job_policy(&newcomer, "prod", false)
            .await
            .unwrap();

        // The running occupant survives; the queued one is superseded.
        assert_eq!(status, Status::Blocked);
        assert_eq!(f.store.job(running.id).status, Status::Running);
        assert_eq!(f.store.job(queued.id).status, Status::Cancelled);
    }

    #[tokio::test]
    async fn test_sweep_promotes_oldest_parked_job() {
        let f = fixture();
        let repo = RepoId::new();
        let org = OrgId::new();

        let parked = grouped_job(repo, org, "prod", Status::Blocked);
        f.store.put_job(parked.clone());

        f.controller.sweep_group(repo, "prod").await.unwrap();

        assert_eq!(f.store.job(parked.id).status, Status::Waiting);
        assert_eq!(f.queue.try_pop(), Some(parked.run_id));
    }

    #[tokio::test]
    async fn test_sweep_leaves_group_held_by_running_job() {
        let f = fixture();
        let repo = RepoId::new();
        let org = OrgId::new();

        let running = grouped_job(repo, org, "prod", Status::Running);
        let parked = grouped_job(repo, org, "prod", Status::Blocked);
        f.store.put_job(running);
        f.store.put_job(parked.clone());

        f.controller.sweep_group(repo, "prod").await.unwrap();

        assert_eq!(f.store.job(parked.id).status, Status::Blocked);
    }

    #[tokio::test]
    async fn test_cancel_run_recurses_into_child_runs() {
        let f = fixture();
        let repo = RepoId::new();
        let org = OrgId::new();

        let parent_run = make_run(repo, org);
        let child_run = make_run(repo, org);
        let mut caller = job_with_needs(parent_run.id, repo, org, "call", &[]);
        caller.status = Status::Running;
        caller.child_run_id = Some(child_run.id);
        let mut inner = job_with_needs(child_run.id, repo, org, "inner", &[]);
        inner.status = Status::Waiting;

        f.store.put_run(parent_run.clone());
        f.store.put_run(child_run.clone());
        f.store.put_job(caller.clone());
        f.store.put_job(inner.clone());

        f.controller.cancel_run(parent_run.id).await;

        assert_eq!(f.store.job(caller.id).status, Status::Cancelled);
        assert_eq!(f.store.job(inner.id).status, Status::Cancelled);
    }

    #[tokio::test]
    async fn test_exclusivity_under_cancel_in_progress() {
        let f = fixture();
        let repo = RepoId::new();
        let org = OrgId::new();

        let first = grouped_job(repo, org, "deploy", Status::Running);
        f.store.put_job(first.clone());
        let second = grouped_job(repo, org, "deploy", Status::Waiting);
        f.store.put_job(second.clone());

        f.controller
            .apply_job_policy(&second, "deploy", true)
            .await
            .unwrap();

        // At most one non-cancelled occupant may be waiting or running.
        let active: Vec<JobId> = [first.id, second.id]
            .into_iter()
            .filter(|id| {
                matches!(f.store.job(*id).status, Status::Waiting | Status::Running)
            })
            .collect();
        assert_eq!(active, vec![second.id]);
    }

    #[tokio::test]
    async fn test_run_group_eval_empty_is_noop() {
        let f = fixture();
        let trigger = RunTrigger::new(RepoId::new(), OrgId::new(), "build.yml");
        let (group, cancel) = f.controller.evaluate_run_group(&trigger).unwrap();
        assert!(group.is_empty());
        assert!(!cancel);
    }
}
