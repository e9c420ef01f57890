//! Periodic failure sweeps.
//!
//! Three independent sweeps fail state forward rather than retrying: tasks
//! whose heartbeat went silent, tasks that outlived the absolute deadline,
//! and jobs no runner ever picked up. Per-row failures are logged and never
//! abort the rest of a sweep.

use crate::config::SchedulerConfig;
use crate::queue::RecheckQueue;
use ferrite_core::events::StatusChange;
use ferrite_core::job::Job;
use ferrite_core::ports::{JobRepository, RunRepository, StatusReporter, TaskRepository};
use ferrite_core::status::Status;
use ferrite_core::task::Task;
use ferrite_core::Result;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

pub struct FailureReaper {
    runs: Arc<dyn RunRepository>,
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    reporter: Arc<dyn StatusReporter>,
    queue: Arc<RecheckQueue>,
    config: SchedulerConfig,
}

impl FailureReaper {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        reporter: Arc<dyn StatusReporter>,
        queue: Arc<RecheckQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            runs,
            jobs,
            tasks,
            reporter,
            queue,
            config,
        }
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(std::time::Duration::from_secs(self.config.reaper_interval_secs));
        info!(
            interval_secs = self.config.reaper_interval_secs,
            "Starting failure reaper"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Failure reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full pass over all three sweeps.
    pub async fn sweep(&self) {
        self.sweep_zombie_tasks().await;
        self.sweep_endless_tasks().await;
        self.sweep_abandoned_jobs().await;
    }

    /// Running tasks with silent heartbeats are forced to failure.
    pub async fn sweep_zombie_tasks(&self) {
        let cutoff = Utc::now() - Duration::seconds(self.config.zombie_timeout_secs as i64);
        let zombies = match self.tasks.list_zombies(cutoff).await {
            Ok(zombies) => zombies,
            Err(e) => {
                error!(error = %e, "Zombie sweep query failed");
                return;
            }
        };
        for task in zombies {
            warn!(task = %task.id, job = %task.job_id, "Failing zombie task");
            if let Err(e) = self.fail_task(&task).await {
                error!(task = %task.id, error = %e, "Failed to reap zombie task");
            }
        }
    }

    /// Running tasks past the absolute deadline are forced to failure, live
    /// heartbeats or not.
    pub async fn sweep_endless_tasks(&self) {
        let cutoff = Utc::now() - Duration::seconds(self.config.endless_timeout_secs as i64);
        let endless = match self.tasks.list_endless(cutoff).await {
            Ok(endless) => endless,
            Err(e) => {
                error!(error = %e, "Endless sweep query failed");
                return;
            }
        };
        for task in endless {
            warn!(task = %task.id, job = %task.job_id, "Failing endless task");
            if let Err(e) = self.fail_task(&task).await {
                error!(task = %task.id, error = %e, "Failed to reap endless task");
            }
        }
    }

    /// Waiting/blocked jobs nothing touched within the long timeout are
    /// cancelled.
    pub async fn sweep_abandoned_jobs(&self) {
        let cutoff = Utc::now() - Duration::seconds(self.config.abandoned_timeout_secs as i64);
        let abandoned = match self
            .jobs
            .list_stale(&[Status::Waiting, Status::Blocked], cutoff)
            .await
        {
            Ok(abandoned) => abandoned,
            Err(e) => {
                error!(error = %e, "Abandoned sweep query failed");
                return;
            }
        };
        for job in abandoned {
            warn!(job = %job.id, "Cancelling abandoned job");
            match self.jobs.cancel(job.id).await {
                Ok(true) => {
                    self.report_job(&job, Status::Cancelled).await;
                    self.queue.push(job.run_id);
                }
                Ok(false) => {}
                Err(e) => {
                    error!(job = %job.id, error = %e, "Failed to cancel abandoned job");
                }
            }
        }
    }

    async fn fail_task(&self, task: &Task) -> Result<()> {
        let outputs = HashMap::new();
        if !self.tasks.finish(task.id, Status::Failure, &outputs).await? {
            return Ok(());
        }
        if self.jobs.finish(task.job_id, Status::Failure, &outputs).await?
            && let Some(job) = self.jobs.get(task.job_id).await?
        {
            self.report_job(&job, Status::Failure).await;
        }
        self.queue.push(task.run_id);
        Ok(())
    }

    async fn report_job(&self, job: &Job, status: Status) {
        let sha = match self.runs.get(job.run_id).await {
            Ok(Some(run)) => run.commit_sha,
            _ => String::new(),
        };
        let mut reported = job.clone();
        reported.status = status;
        if let Err(e) = self.reporter.report(&StatusChange::job(&reported, &sha)).await {
            warn!(job = %job.id, error = %e, "Failed to deliver job status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use ferrite_core::ids::{OrgId, RepoId, RunnerId};

    struct Fixture {
        store: Arc<MemStore>,
        queue: Arc<RecheckQueue>,
        reaper: FailureReaper,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let store = Arc::new(MemStore::new());
        let queue = Arc::new(RecheckQueue::new());
        let reaper = FailureReaper::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(RecordingReporter::default()),
            queue.clone(),
            config,
        );
        Fixture {
            store,
            queue,
            reaper,
        }
    }

    fn running_pair(store: &MemStore, repo: RepoId, org: OrgId) -> (Job, Task) {
        let run = make_run(repo, org);
        let mut job = job_with_needs(run.id, repo, org, "build", &[]);
        job.status = Status::Running;
        let task = Task::new(job.id, run.id, RunnerId::new(), "tok".to_string(), vec![]);
        job.task_id = Some(task.id);
        store.put_run(run);
        store.put_job(job.clone());
        store.put_task(task.clone());
        (job, task)
    }

    #[tokio::test]
    async fn test_zombie_task_fails_forward() {
        let f = fixture(SchedulerConfig {
            zombie_timeout_secs: 0,
            ..SchedulerConfig::default()
        });
        let repo = RepoId::new();
        let org = OrgId::new();
        let (job, task) = running_pair(&f.store, repo, org);

        // Make the heartbeat unambiguously stale.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.reaper.sweep_zombie_tasks().await;

        assert_eq!(f.store.task(task.id).status, Status::Failure);
        assert_eq!(f.store.job(job.id).status, Status::Failure);
        assert_eq!(f.queue.try_pop(), Some(job.run_id));
    }

    #[tokio::test]
    async fn test_live_heartbeat_is_not_a_zombie() {
        let f = fixture(SchedulerConfig {
            zombie_timeout_secs: 3600,
            ..SchedulerConfig::default()
        });
        let repo = RepoId::new();
        let org = OrgId::new();
        let (job, task) = running_pair(&f.store, repo, org);

        f.reaper.sweep_zombie_tasks().await;

        assert_eq!(f.store.task(task.id).status, Status::Running);
        assert_eq!(f.store.job(job.id).status, Status::Running);
    }

    #[tokio::test]
    async fn test_endless_task_fails_despite_heartbeats() {
        let f = fixture(SchedulerConfig {
            zombie_timeout_secs: 3600,
            endless_timeout_secs: 0,
            ..SchedulerConfig::default()
        });
        let repo = RepoId::new();
        let org = OrgId::new();
        let (job, task) = running_pair(&f.store, repo, org);

        // Heartbeat is fresh, but the task started before the deadline.
        TaskRepository::heartbeat(f.store.as_ref(), task.id, Utc::now())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.reaper.sweep_endless_tasks().await;

        assert_eq!(f.store.task(task.id).status, Status::Failure);
        assert_eq!(f.store.job(job.id).status, Status::Failure);
    }

    #[tokio::test]
    async fn test_abandoned_jobs_are_cancelled() {
        let f = fixture(SchedulerConfig {
            abandoned_timeout_secs: 0,
            ..SchedulerConfig::default()
        });
        let repo = RepoId::new();
        let org = OrgId::new();
        let run = make_run(repo, org);
        let waiting = job_with_needs(run.id, repo, org, "build", &[]);
        let blocked = job_with_needs(run.id, repo, org, "test", &["build"]);
        f.store.put_run(run.clone());
        f.store.put_job(waiting.clone());
        f.store.put_job(blocked.clone());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.reaper.sweep_abandoned_jobs().await;

        assert_eq!(f.store.job(waiting.id).status, Status::Cancelled);
        assert_eq!(f.store.job(blocked.id).status, Status::Cancelled);
    }

    #[tokio::test]
    async fn test_terminal_rows_are_left_alone() {
        let f = fixture(SchedulerConfig {
            zombie_timeout_secs: 0,
            endless_timeout_secs: 0,
            abandoned_timeout_secs: 0,
            ..SchedulerConfig::default()
        });
        let repo = RepoId::new();
        let org = OrgId::new();
        let run = make_run(repo, org);
        let mut done = job_with_needs(run.id, repo, org, "build", &[]);
        done.status = Status::Success;
        f.store.put_run(run);
        f.store.put_job(done.clone());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.reaper.sweep().await;

        assert_eq!(f.store.job(done.id).status, Status::Success);
    }
}
