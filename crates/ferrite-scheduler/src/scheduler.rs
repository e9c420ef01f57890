//! The scheduler service: run insertion, task polling, completion, and the
//! asynchronous recheck loop tying the components together.

use crate::assigner::TaskAssigner;
use crate::concurrency::ConcurrencyController;
use crate::config::SchedulerConfig;
use crate::matrix::MatrixExpander;
use crate::queue::RecheckQueue;
use crate::reaper::FailureReaper;
use crate::resolver;

use ferrite_core::events::StatusChange;
use ferrite_core::ids::{RunId, RunnerId, TaskId, UserId};
use ferrite_core::job::Job;
use ferrite_core::ports::{
    CredentialIssuer, ExpressionEvaluator, JobRepository, RunRepository, RunnerRepository,
    StatusReporter, TaskRepository, WorkflowParser,
};
use ferrite_core::run::{Run, RunTrigger};
use ferrite_core::status::{Status, aggregate_job_status};
use ferrite_core::task::{TaskDescriptor, TaskResult};
use ferrite_core::workflow::EvalContext;
use ferrite_core::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// The run-orchestration service.
///
/// All state lives behind the repository ports; any number of `Scheduler`
/// callers (runner polls, completion callbacks, sweep timers) may operate
/// concurrently on the same rows.
pub struct Scheduler {
    runs: Arc<dyn RunRepository>,
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    parser: Arc<dyn WorkflowParser>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    reporter: Arc<dyn StatusReporter>,
    controller: ConcurrencyController,
    expander: MatrixExpander,
    assigner: TaskAssigner,
    queue: Arc<RecheckQueue>,
    config: SchedulerConfig,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runs: Arc<dyn RunRepository>,
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        runners: Arc<dyn RunnerRepository>,
        parser: Arc<dyn WorkflowParser>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        issuer: Arc<dyn CredentialIssuer>,
        reporter: Arc<dyn StatusReporter>,
        config: SchedulerConfig,
    ) -> Self {
        let queue = Arc::new(RecheckQueue::new());
        let controller = ConcurrencyController::new(
            runs.clone(),
            jobs.clone(),
            evaluator.clone(),
            reporter.clone(),
            queue.clone(),
        );
        let expander = MatrixExpander::new(jobs.clone(), evaluator.clone());
        let assigner = TaskAssigner::new(
            runs.clone(),
            jobs.clone(),
            tasks.clone(),
            runners,
            issuer,
            reporter.clone(),
            config.credential_cache_size,
        );
        Self {
            runs,
            jobs,
            tasks,
            parser,
            evaluator,
            reporter,
            controller,
            expander,
            assigner,
            queue,
            config,
        }
    }

    /// Build the failure reaper sharing this scheduler's queue and config.
    pub fn reaper(&self) -> FailureReaper {
        FailureReaper::new(
            self.runs.clone(),
            self.jobs.clone(),
            self.tasks.clone(),
            self.reporter.clone(),
            self.queue.clone(),
            self.config.clone(),
        )
    }

    /// Insert a run with all its jobs.
    ///
    /// Concurrency evaluation happens before the insert and blocking
    /// decisions apply inside the insert transaction, so no caller ever
    /// observes a half-initialized run. Jobs without needs resolve inline:
    /// they are stored `Waiting` directly, leaving no pending resolver work.
    pub async fn create_run(&self, trigger: RunTrigger, source: &[u8]) -> Result<Run> {
        let ctx = EvalContext {
            event: Some(trigger.payload.clone()),
            ..EvalContext::new()
        };
        let payloads = self.parser.parse(source, &ctx)?;
        if payloads.is_empty() {
            return Err(Error::EmptyWorkflow);
        }

        let (group, cancel) = self.controller.evaluate_run_group(&trigger)?;

        let now = Utc::now();
        let run = Run {
            id: RunId::new(),
            repo_id: trigger.repo_id,
            owner_id: trigger.owner_id,
            index: 0,
            workflow_id: trigger.workflow_id.clone(),
            title: trigger.title.clone(),
            trigger_event: trigger.event.clone(),
            event_payload: trigger.payload.clone(),
            git_ref: trigger.git_ref.clone(),
            commit_sha: trigger.commit_sha.clone(),
            status: Status::Waiting,
            need_approval: trigger.need_approval,
            approved_by: None,
            parent_job_id: trigger.parent_job_id,
            concurrency_group: group,
            cancel_in_progress: cancel,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        };

        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let mut job = Job::from_payload(run.id, trigger.repo_id, trigger.owner_id, payload);
            // Job groups are evaluated inline only when the job has no needs;
            // otherwise the expression may reference needs.* and evaluation
            // waits for the resolver to unblock the job.
            if job.needs.is_empty() && !job.raw_concurrency_group.is_empty() {
                let (jgroup, jcancel) = self.controller.evaluate_job_group(&job, &[])?;
                job.concurrency_group = jgroup;
                job.cancel_in_progress = jcancel;
                job.is_concurrency_evaluated = true;
            }
            jobs.push(job);
        }

        let stored = self.runs.create_with_jobs(&run, &jobs).await?;
        info!(
            run = %stored.id,
            repo = %stored.repo_id,
            index = stored.index,
            status = %stored.status,
            "Run inserted"
        );

        if let Some(parent_id) = trigger.parent_job_id {
            self.jobs.set_child_run(parent_id, stored.id).await?;
            self.jobs
                .update_status_if(parent_id, Status::Waiting, Status::Running)
                .await?;
        }

        if stored.status != Status::Blocked && !stored.need_approval {
            if stored.cancel_in_progress && !stored.concurrency_group.is_empty() {
                self.controller
                    .apply_run_policy(stored.repo_id, &stored.concurrency_group, stored.id)
                    .await;
            }
            self.apply_inline_job_groups(&jobs).await?;
        }

        self.report(&StatusChange::run(&stored)).await;
        Ok(stored)
    }

    /// Apply group policies for jobs whose concurrency was evaluated at
    /// insert: cancel superseded occupants, park behind a running one.
    ///
    /// Newest first, so when sibling jobs share a group the younger one
    /// supersedes the older, and a job another policy already cancelled
    /// does not fire its own.
    async fn apply_inline_job_groups(&self, jobs: &[Job]) -> Result<()> {
        let mut adjusted = false;
        for job in jobs.iter().rev() {
            if !job.is_concurrency_evaluated || job.concurrency_group.is_empty() {
                continue;
            }
            match self.jobs.get(job.id).await? {
                Some(current) if !current.status.is_done() => {}
                _ => continue,
            }
            let target = self
                .controller
                .apply_job_policy(job, &job.concurrency_group, job.cancel_in_progress)
                .await?;
            let changed = match target {
                Status::Blocked => {
                    self.jobs
                        .update_status_if(job.id, Status::Waiting, Status::Blocked)
                        .await?
                }
                Status::Waiting => {
                    self.jobs
                        .update_status_if(job.id, Status::Blocked, Status::Waiting)
                        .await?
                }
                _ => false,
            };
            adjusted = adjusted || changed;
        }
        if adjusted && let Some(job) = jobs.first() {
            // Blocking decisions moved jobs after the insert aggregate.
            self.refresh_run_status(job.run_id).await?;
        }
        Ok(())
    }

    /// Let a runner claim at most one ready job.
    pub async fn poll(&self, runner_id: RunnerId) -> Result<Option<TaskDescriptor>> {
        let descriptor = self.assigner.poll(runner_id).await?;
        if let Some(ref claimed) = descriptor {
            // The job just moved to Running; fold that into the run status.
            self.queue.push(claimed.run_id);
        }
        Ok(descriptor)
    }

    /// Record a runner's heartbeat for a task it is executing.
    pub async fn heartbeat_task(&self, task_id: TaskId) -> Result<()> {
        self.tasks.heartbeat(task_id, Utc::now()).await
    }

    /// Out-of-band completion report from a runner.
    ///
    /// Idempotent: a duplicate report finds the task already terminal and
    /// returns without error.
    pub async fn complete_task(&self, result: TaskResult) -> Result<()> {
        let task = self
            .tasks
            .get(result.task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(result.task_id.to_string()))?;

        // Runners may only report terminal outcomes.
        let status = if result.status.is_done() {
            result.status
        } else {
            Status::Failure
        };

        if !self.tasks.finish(task.id, status, &result.outputs).await? {
            return Ok(());
        }
        info!(task = %task.id, job = %task.job_id, status = %status, "Task finished");

        if self.jobs.finish(task.job_id, status, &result.outputs).await?
            && let Some(job) = self.jobs.get(task.job_id).await?
        {
            self.report_job(&job).await;
            if !job.concurrency_group.is_empty()
                && let Err(e) = self
                    .controller
                    .sweep_group(job.repo_id, &job.concurrency_group)
                    .await
            {
                warn!(job = %job.id, error = %e, "Concurrency release sweep failed");
            }
        }

        self.queue.push(task.run_id);
        Ok(())
    }

    /// Approve a run held for approval and wake its resolver.
    pub async fn approve_run(&self, run_id: RunId, approved_by: UserId) -> Result<()> {
        if self.runs.set_approved(run_id, approved_by).await? {
            self.queue.push(run_id);
        }
        Ok(())
    }

    /// Re-derive the scheduling state of one run from fresh rows.
    ///
    /// Safe to repeat: every decision is a conditional update, so anything a
    /// concurrent caller already did stays done.
    pub async fn recheck_run(&self, run_id: RunId) -> Result<()> {
        let Some(run) = self.runs.get(run_id).await? else {
            return Ok(());
        };
        if run.is_done() {
            return Ok(());
        }
        // Runs parked for approval or on a run-level group stay untouched
        // until approved or promoted.
        if run.need_approval && run.approved_by.is_none() {
            return Ok(());
        }
        if run.status == Status::Blocked && !run.concurrency_group.is_empty() {
            return Ok(());
        }

        let mut jobs = self.jobs.list_by_run(run_id).await?;
        if self.expander.check_run(&run, &jobs).await? {
            jobs = self.jobs.list_by_run(run_id).await?;
        }

        let updates = resolver::resolve(&jobs, self.evaluator.as_ref());
        for (job_id, next) in &updates {
            if !self
                .jobs
                .update_status_if(*job_id, Status::Blocked, *next)
                .await?
            {
                continue;
            }
            let Some(job) = jobs.iter().find(|j| j.id == *job_id) else {
                continue;
            };
            if *next == Status::Waiting
                && !job.is_concurrency_evaluated
                && !job.raw_concurrency_group.is_empty()
            {
                self.evaluate_deferred_group(job, &jobs).await?;
            }
            if next.is_done() {
                let mut skipped = job.clone();
                skipped.status = *next;
                self.report(&StatusChange::job(&skipped, &run.commit_sha)).await;
            }
        }

        self.refresh_run_status(run_id).await
    }

    /// Deferred job-level concurrency: the group expression may reference
    /// `needs.*`, so it is evaluated only now that the job unblocked.
    async fn evaluate_deferred_group(&self, job: &Job, all_jobs: &[Job]) -> Result<()> {
        match self.controller.evaluate_job_group(job, all_jobs) {
            Ok((group, cancel)) => {
                self.jobs.set_concurrency(job.id, &group, cancel).await?;
                let target = self.controller.apply_job_policy(job, &group, cancel).await?;
                if target == Status::Blocked {
                    self.jobs
                        .update_status_if(job.id, Status::Waiting, Status::Blocked)
                        .await?;
                }
                Ok(())
            }
            Err(e) => {
                // Exclusivity cannot be guaranteed; fail the job rather than
                // let it run unguarded.
                warn!(job = %job.id, error = %e, "Concurrency expression failed, failing job");
                if self
                    .jobs
                    .update_status_if(job.id, Status::Waiting, Status::Failure)
                    .await?
                    && let Some(failed) = self.jobs.get(job.id).await?
                {
                    self.report_job(&failed).await;
                }
                Ok(())
            }
        }
    }

    /// Recompute a run's aggregate status and propagate the outcome: commit
    /// status, reusable-workflow parent, run-level group release.
    async fn refresh_run_status(&self, run_id: RunId) -> Result<()> {
        let Some(run) = self.runs.get(run_id).await? else {
            return Ok(());
        };
        if run.is_done() {
            return Ok(());
        }

        let jobs = self.jobs.list_by_run(run_id).await?;
        let statuses: Vec<Status> = jobs.iter().map(|j| j.status).collect();
        let aggregated = aggregate_job_status(&statuses);
        if aggregated == run.status {
            return Ok(());
        }

        let stopped_at = aggregated.is_done().then(Utc::now);
        self.runs.update_status(run_id, aggregated, stopped_at).await?;
        info!(run = %run_id, status = %aggregated, "Run status changed");

        let mut updated = run.clone();
        updated.status = aggregated;
        self.report(&StatusChange::run(&updated)).await;

        if !aggregated.is_done() {
            return Ok(());
        }

        if !run.concurrency_group.is_empty()
            && let Err(e) = self
                .controller
                .sweep_group(run.repo_id, &run.concurrency_group)
                .await
        {
            warn!(run = %run_id, error = %e, "Concurrency release sweep failed");
        }

        if let Some(parent_id) = run.parent_job_id
            && self
                .jobs
                .update_status_if(parent_id, Status::Running, aggregated)
                .await?
            && let Some(parent) = self.jobs.get(parent_id).await?
        {
            self.report_job(&parent).await;
            if !parent.concurrency_group.is_empty()
                && let Err(e) = self
                    .controller
                    .sweep_group(parent.repo_id, &parent.concurrency_group)
                    .await
            {
                warn!(job = %parent.id, error = %e, "Concurrency release sweep failed");
            }
            self.queue.push(parent.run_id);
        }

        Ok(())
    }

    /// Drive the deduplicating recheck queue until shutdown. A failed
    /// recheck is requeued; handlers re-derive everything from fresh rows,
    /// so at-least-once delivery is safe.
    pub async fn run_resolver_loop(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting resolver loop");
        loop {
            tokio::select! {
                run_id = self.queue.pop() => {
                    if let Err(e) = self.recheck_run(run_id).await {
                        warn!(run = %run_id, error = %e, "Recheck failed, requeueing");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        self.queue.push(run_id);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Resolver loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn report(&self, change: &StatusChange) {
        if let Err(e) = self.reporter.report(change).await {
            warn!(error = %e, "Failed to deliver status change");
        }
    }

    async fn report_job(&self, job: &Job) {
        let sha = match self.runs.get(job.run_id).await {
            Ok(Some(run)) => run.commit_sha,
            _ => String::new(),
        };
        self.report(&StatusChange::job(job, &sha)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use ferrite_core::ids::{OrgId, RepoId};
    use ferrite_core::runner::RunnerScope;
    use ferrite_core::workflow::JobPayload;
    use std::collections::HashMap;

    struct Fixture {
        store: Arc<MemStore>,
        scheduler: Scheduler,
    }

    fn fixture(payloads: Vec<JobPayload>) -> Fixture {
        fixture_with_evaluator(payloads, StubEvaluator::default())
    }

    fn fixture_with_evaluator(payloads: Vec<JobPayload>, evaluator: StubEvaluator) -> Fixture {
        let store = Arc::new(MemStore::new());
        let scheduler = Scheduler::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(StubParser { payloads }),
            Arc::new(evaluator),
            Arc::new(StubIssuer::default()),
            Arc::new(RecordingReporter::default()),
            SchedulerConfig::default(),
        );
        Fixture { store, scheduler }
    }

    async fn drain(f: &Fixture) {
        while let Some(run_id) = f.scheduler.queue.try_pop() {
            f.scheduler.recheck_run(run_id).await.unwrap();
        }
    }

    async fn register_runner(f: &Fixture, repo: RepoId) -> RunnerId {
        let runner = make_runner(RunnerScope::Repository { repo_id: repo }, &["ubuntu-latest"], 0);
        RunnerRepository::register(f.store.as_ref(), &runner)
            .await
            .unwrap()
    }

    async fn finish_job(f: &Fixture, descriptor: &TaskDescriptor, status: Status) {
        f.scheduler
            .complete_task(TaskResult {
                task_id: descriptor.task_id,
                status,
                outputs: HashMap::new(),
                steps: vec![],
            })
            .await
            .unwrap();
        drain(f).await;
    }

    #[tokio::test]
    async fn test_round_trip_without_needs() {
        let f = fixture(vec![payload("build", &[]), payload("lint", &[])]);
        let trigger = RunTrigger::new(RepoId::new(), OrgId::new(), "ci.yml");
        let run = f.scheduler.create_run(trigger, b"jobs: ...").await.unwrap();

        // Need-free jobs resolve inline: the run aggregate is immediate and
        // the resolver queue stays empty.
        assert_eq!(run.status, Status::Waiting);
        assert_eq!(run.index, 1);
        assert!(f.scheduler.queue.is_empty());
        assert!(
            f.store
                .jobs_of(run.id)
                .iter()
                .all(|j| j.status == Status::Waiting)
        );
    }

    #[tokio::test]
    async fn test_run_index_is_monotonic_per_repository() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let f = fixture(vec![payload("build", &[])]);

        let first = f
            .scheduler
            .create_run(RunTrigger::new(repo, org, "ci.yml"), b"")
            .await
            .unwrap();
        let second = f
            .scheduler
            .create_run(RunTrigger::new(repo, org, "ci.yml"), b"")
            .await
            .unwrap();
        let other_repo = f
            .scheduler
            .create_run(RunTrigger::new(RepoId::new(), org, "ci.yml"), b"")
            .await
            .unwrap();

        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        assert_eq!(other_repo.index, 1);
    }

    #[tokio::test]
    async fn test_empty_workflow_is_rejected() {
        let f = fixture(vec![]);
        let err = f
            .scheduler
            .create_run(RunTrigger::new(RepoId::new(), OrgId::new(), "ci.yml"), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyWorkflow));
    }

    #[tokio::test]
    async fn test_failure_chain_skips_dependents_and_fails_run() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let f = fixture(vec![
            payload("job1", &[]),
            payload("job2", &["job1"]),
            payload("job3", &["job2"]),
        ]);
        let run = f
            .scheduler
            .create_run(RunTrigger::new(repo, org, "ci.yml"), b"")
            .await
            .unwrap();

        let runner = register_runner(&f, repo).await;
        let descriptor = f.scheduler.poll(runner).await.unwrap().unwrap();
        finish_job(&f, &descriptor, Status::Failure).await;

        let jobs = f.store.jobs_of(run.id);
        let by_key: HashMap<&str, Status> =
            jobs.iter().map(|j| (j.key.as_str(), j.status)).collect();
        assert_eq!(by_key["job1"], Status::Failure);
        assert_eq!(by_key["job2"], Status::Skipped);
        assert_eq!(by_key["job3"], Status::Skipped);
        assert_eq!(f.store.run(run.id).status, Status::Failure);
        assert!(f.store.run(run.id).stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_success_chain_runs_to_completion() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let f = fixture(vec![
            payload("job1", &[]),
            payload("job2", &["job1"]),
            payload("job3", &["job2"]),
        ]);
        let run = f
            .scheduler
            .create_run(RunTrigger::new(repo, org, "ci.yml"), b"")
            .await
            .unwrap();

        let runner = register_runner(&f, repo).await;
        for _ in 0..3 {
            let descriptor = f.scheduler.poll(runner).await.unwrap().unwrap();
            finish_job(&f, &descriptor, Status::Success).await;
        }

        assert!(f.scheduler.poll(runner).await.unwrap().is_none());
        assert_eq!(f.store.run(run.id).status, Status::Success);
    }

    #[tokio::test]
    async fn test_completion_outputs_flow_into_descriptor() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let f = fixture(vec![payload("build", &[]), payload("release", &["build"])]);
        f.scheduler
            .create_run(RunTrigger::new(repo, org, "ci.yml"), b"")
            .await
            .unwrap();

        let runner = register_runner(&f, repo).await;
        let build = f.scheduler.poll(runner).await.unwrap().unwrap();
        f.scheduler
            .complete_task(TaskResult {
                task_id: build.task_id,
                status: Status::Success,
                outputs: HashMap::from([("artifact".to_string(), "a.tar".to_string())]),
                steps: vec![],
            })
            .await
            .unwrap();
        drain(&f).await;

        let release = f.scheduler.poll(runner).await.unwrap().unwrap();
        assert_eq!(release.needs["build"].outputs["artifact"], "a.tar");
        assert_eq!(release.needs["build"].result, Status::Success);
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_benign() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let f = fixture(vec![payload("build", &[])]);
        f.scheduler
            .create_run(RunTrigger::new(repo, org, "ci.yml"), b"")
            .await
            .unwrap();

        let runner = register_runner(&f, repo).await;
        let descriptor = f.scheduler.poll(runner).await.unwrap().unwrap();
        let result = TaskResult {
            task_id: descriptor.task_id,
            status: Status::Success,
            outputs: HashMap::new(),
            steps: vec![],
        };
        f.scheduler.complete_task(result.clone()).await.unwrap();
        let mut late = result;
        late.status = Status::Failure;
        // The late duplicate finds the task terminal and changes nothing.
        f.scheduler.complete_task(late).await.unwrap();
        drain(&f).await;

        assert_eq!(f.store.task(descriptor.task_id).status, Status::Success);
    }

    #[tokio::test]
    async fn test_approval_gates_and_releases_jobs() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let f = fixture(vec![payload("build", &[])]);
        let mut trigger = RunTrigger::new(repo, org, "ci.yml");
        trigger.need_approval = true;
        let run = f.scheduler.create_run(trigger, b"").await.unwrap();

        let jobs = f.store.jobs_of(run.id);
        assert!(jobs.iter().all(|j| j.status == Status::Blocked));

        f.scheduler
            .approve_run(run.id, UserId::new())
            .await
            .unwrap();
        drain(&f).await;

        assert!(
            f.store
                .jobs_of(run.id)
                .iter()
                .all(|j| j.status == Status::Waiting)
        );
    }

    #[tokio::test]
    async fn test_run_level_group_blocks_second_run() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let f = fixture(vec![payload("build", &[])]);

        let mut trigger = RunTrigger::new(repo, org, "ci.yml");
        trigger.raw_concurrency_group = "main".to_string();
        let first = f.scheduler.create_run(trigger.clone(), b"").await.unwrap();
        assert_eq!(first.status, Status::Waiting);

        let second = f.scheduler.create_run(trigger, b"").await.unwrap();
        assert_eq!(second.status, Status::Blocked);
        assert!(
            f.store
                .jobs_of(second.id)
                .iter()
                .all(|j| j.status == Status::Blocked)
        );

        // Finishing the first run frees the group and promotes the second.
        let runner = register_runner(&f, repo).await;
        let descriptor = f.scheduler.poll(runner).await.unwrap().unwrap();
        finish_job(&f, &descriptor, Status::Success).await;
        drain(&f).await;

        assert_eq!(f.store.run(first.id).status, Status::Success);
        let promoted = f.store.run(second.id);
        assert_ne!(promoted.status, Status::Blocked);
        assert!(
            f.store
                .jobs_of(second.id)
                .iter()
                .all(|j| j.status == Status::Waiting)
        );
    }

    #[tokio::test]
    async fn test_deferred_job_group_blocks_behind_running_occupant() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let mut gated = payload("deploy", &["build"]);
        gated.raw_concurrency_group = "prod".to_string();
        let f = fixture(vec![payload("build", &[]), gated]);
        let run = f
            .scheduler
            .create_run(RunTrigger::new(repo, org, "ci.yml"), b"")
            .await
            .unwrap();

        // An unrelated job already holds the group.
        let mut occupant = job_with_needs(RunId::new(), repo, org, "deploy", &[]);
        occupant.status = Status::Running;
        occupant.concurrency_group = "prod".to_string();
        occupant.is_concurrency_evaluated = true;
        f.store.put_job(occupant.clone());

        let runner = register_runner(&f, repo).await;
        let build = f.scheduler.poll(runner).await.unwrap().unwrap();
        finish_job(&f, &build, Status::Success).await;

        let deploy = f
            .store
            .jobs_of(run.id)
            .into_iter()
            .find(|j| j.key.as_str() == "deploy")
            .unwrap();
        assert!(deploy.is_concurrency_evaluated);
        assert_eq!(deploy.status, Status::Blocked);

        // Releasing the occupant promotes the parked job.
        JobRepository::finish(f.store.as_ref(), occupant.id, Status::Success, &HashMap::new())
            .await
            .unwrap();
        f.scheduler
            .controller
            .sweep_group(repo, "prod")
            .await
            .unwrap();
        drain(&f).await;
        assert_eq!(f.store.job(deploy.id).status, Status::Waiting);
    }

    #[tokio::test]
    async fn test_deferred_matrix_expands_after_completion() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let mut deferred = payload("deploy", &["plan"]);
        deferred.raw_strategy = "matrix: ${{ needs.plan.outputs.targets }}".to_string();

        let mut cell_one = payload("deploy", &[]);
        cell_one.name = "deploy (eu)".to_string();
        let mut cell_two = payload("deploy", &[]);
        cell_two.name = "deploy (us)".to_string();
        let evaluator = StubEvaluator::with_matrix(vec![cell_one, cell_two]);

        let f = fixture_with_evaluator(vec![payload("plan", &[]), deferred], evaluator);
        let run = f
            .scheduler
            .create_run(RunTrigger::new(repo, org, "ci.yml"), b"")
            .await
            .unwrap();

        let runner = register_runner(&f, repo).await;
        let plan = f.scheduler.poll(runner).await.unwrap().unwrap();
        finish_job(&f, &plan, Status::Success).await;

        let cells: Vec<Job> = f
            .store
            .jobs_of(run.id)
            .into_iter()
            .filter(|j| j.key.as_str() == "deploy")
            .collect();
        assert_eq!(cells.len(), 2);
        // Cells resolve to Waiting within the same recheck and are claimable.
        assert!(cells.iter().all(|c| c.status == Status::Waiting));
        assert!(f.scheduler.poll(runner).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reusable_workflow_propagates_child_result() {
        let repo = RepoId::new();
        let org = OrgId::new();
        let f = fixture(vec![payload("call", &[])]);
        let parent_run = f
            .scheduler
            .create_run(RunTrigger::new(repo, org, "parent.yml"), b"")
            .await
            .unwrap();
        let caller = f.store.jobs_of(parent_run.id).remove(0);

        let mut child_trigger = RunTrigger::new(repo, org, "child.yml");
        child_trigger.parent_job_id = Some(caller.id);
        let child_run = f.scheduler.create_run(child_trigger, b"").await.unwrap();

        assert_eq!(f.store.job(caller.id).status, Status::Running);
        assert_eq!(f.store.job(caller.id).child_run_id, Some(child_run.id));

        let runner = register_runner(&f, repo).await;
        let inner = f.scheduler.poll(runner).await.unwrap().unwrap();
        assert_eq!(inner.run_id, child_run.id);
        finish_job(&f, &inner, Status::Success).await;

        assert_eq!(f.store.run(child_run.id).status, Status::Success);
        assert_eq!(f.store.job(caller.id).status, Status::Success);
        assert_eq!(f.store.run(parent_run.id).status, Status::Success);
    }
}
