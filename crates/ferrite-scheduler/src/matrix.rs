//! Deferred matrix expansion.
//!
//! A job whose `strategy.matrix` references another job's outputs
//! (`needs.<job>.outputs.*`) cannot be expanded when the run is inserted:
//! the referenced outputs do not exist yet. Such a job stays a single
//! placeholder row until every needed job is terminal, then the evaluator is
//! fed the recorded outputs and the placeholder is rewritten into its
//! concrete cells.

use crate::resolver::collect_needs;
use ferrite_core::job::Job;
use ferrite_core::ports::{ExpressionEvaluator, JobRepository};
use ferrite_core::run::Run;
use ferrite_core::status::Status;
use ferrite_core::workflow::EvalContext;
use ferrite_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct MatrixExpander {
    jobs: Arc<dyn JobRepository>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl MatrixExpander {
    pub fn new(jobs: Arc<dyn JobRepository>, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { jobs, evaluator }
    }

    /// Expand every pending placeholder of a run whose needs have settled.
    /// Returns whether any placeholder was finalized, so the caller knows to
    /// re-read job rows.
    pub async fn check_run(&self, run: &Run, jobs: &[Job]) -> Result<bool> {
        let mut by_key: HashMap<&str, Vec<Status>> = HashMap::new();
        for job in jobs {
            by_key.entry(job.key.as_str()).or_default().push(job.status);
        }

        let mut finalized = false;
        for placeholder in jobs.iter().filter(|j| j.matrix_pending()) {
            let settled = placeholder.needs.iter().all(|need| {
                by_key
                    .get(need.as_str())
                    .is_some_and(|rows| rows.iter().all(|s| s.is_done()))
            });
            if !settled {
                continue;
            }
            if self.expand(run, placeholder, jobs).await? {
                finalized = true;
            }
        }
        Ok(finalized)
    }

    /// Materialize one placeholder. At-most-once: the evaluated flag flips in
    /// the same transaction as the sibling inserts, so a retry after partial
    /// failure cannot duplicate cells.
    async fn expand(&self, run: &Run, placeholder: &Job, jobs: &[Job]) -> Result<bool> {
        let needs = collect_needs(jobs, &placeholder.needs);

        // A failed dependency follows the ordinary skip path: mark the
        // placeholder evaluated with its needs intact and let the resolver
        // decide between Skipped and a conditional opt-in.
        if needs.values().any(|n| !n.result.is_success()) {
            return self.mark_evaluated(placeholder).await;
        }

        let ctx = EvalContext {
            needs,
            ..EvalContext::new()
        };
        let variants = match self.evaluator.expand_matrix(&placeholder.payload, &ctx) {
            Ok(variants) if !variants.is_empty() => variants,
            Ok(_) => return self.mark_evaluated(placeholder).await,
            Err(e) => {
                // Non-fatal: the job simply does not multiply.
                warn!(job = %placeholder.id, error = %e, "Matrix expansion failed, skipping expansion");
                return self.mark_evaluated(placeholder).await;
            }
        };

        let mut variants = variants.into_iter();
        let Some(first) = variants.next() else {
            return self.mark_evaluated(placeholder).await;
        };

        // The first cell rewrites the placeholder row; needs are already
        // satisfied and baked into static values, so they are stripped.
        let mut head = placeholder.clone();
        head.name = first.name.clone();
        head.needs = Vec::new();
        head.runs_on = first.runs_on.clone();
        head.max_parallel = first.max_parallel;
        head.payload = first;
        head.payload.needs = Vec::new();
        head.is_matrix_evaluated = true;

        let siblings: Vec<Job> = variants
            .map(|mut variant| {
                variant.needs = Vec::new();
                let mut cell = Job::from_payload(run.id, run.repo_id, run.owner_id, variant);
                cell.status = Status::Blocked;
                cell.is_matrix_evaluated = true;
                cell
            })
            .collect();

        let expanded = self
            .jobs
            .finish_matrix_expansion(&head, &siblings)
            .await?;
        if expanded {
            info!(
                job = %placeholder.id,
                key = %placeholder.key,
                cells = siblings.len() + 1,
                "Expanded deferred matrix"
            );
        }
        Ok(expanded)
    }

    async fn mark_evaluated(&self, placeholder: &Job) -> Result<bool> {
        let mut head = placeholder.clone();
        head.is_matrix_evaluated = true;
        self.jobs.finish_matrix_expansion(&head, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use ferrite_core::ids::{JobKey, OrgId, RepoId};

    fn deferred_payload(key: &str, needs: &[&str]) -> ferrite_core::workflow::JobPayload {
        let mut p = payload(key, needs);
        p.raw_strategy = "matrix:\n  v: ${{ fromJSON(needs.plan.outputs.vs) }}".to_string();
        p
    }

    #[tokio::test]
    async fn test_expands_once_needs_settle() {
        let store = Arc::new(MemStore::new());
        let repo = RepoId::new();
        let org = OrgId::new();
        let run = make_run(repo, org);

        let mut plan = job_with_needs(run.id, repo, org, "plan", &[]);
        plan.status = Status::Success;
        plan.outputs = HashMap::from([("vs".to_string(), "[1,2,3]".to_string())]);
        let deferred = Job::from_payload(run.id, repo, org, deferred_payload("deploy", &["plan"]));
        assert!(deferred.matrix_pending());

        store.put_run(run.clone());
        store.put_job(plan.clone());
        store.put_job(deferred.clone());

        let mut cell_one = payload("deploy", &[]);
        cell_one.name = "deploy (1)".to_string();
        let mut cell_two = payload("deploy", &[]);
        cell_two.name = "deploy (2)".to_string();
        let evaluator = Arc::new(StubEvaluator::with_matrix(vec![cell_one, cell_two]));

        let expander = MatrixExpander::new(store.clone(), evaluator);
        let jobs = store.jobs_of(run.id);
        let expanded = expander.check_run(&run, &jobs).await.unwrap();
        assert!(expanded);

        let jobs = store.jobs_of(run.id);
        let cells: Vec<&Job> = jobs
            .iter()
            .filter(|j| j.key == JobKey::new("deploy"))
            .collect();
        assert_eq!(cells.len(), 2);
        assert!(cells.iter().all(|c| c.is_matrix_evaluated));
        assert!(cells.iter().all(|c| c.needs.is_empty()));
        // The placeholder row was rewritten in place.
        assert!(cells.iter().any(|c| c.id == deferred.id));
    }

    #[tokio::test]
    async fn test_expansion_is_at_most_once() {
        let store = Arc::new(MemStore::new());
        let repo = RepoId::new();
        let org = OrgId::new();
        let run = make_run(repo, org);

        let mut plan = job_with_needs(run.id, repo, org, "plan", &[]);
        plan.status = Status::Success;
        let deferred = Job::from_payload(run.id, repo, org, deferred_payload("deploy", &["plan"]));

        store.put_run(run.clone());
        store.put_job(plan);
        store.put_job(deferred);

        let evaluator = Arc::new(StubEvaluator::with_matrix(vec![
            payload("deploy", &[]),
            payload("deploy", &[]),
        ]));
        let expander = MatrixExpander::new(store.clone(), evaluator);

        let jobs = store.jobs_of(run.id);
        assert!(expander.check_run(&run, &jobs).await.unwrap());
        // A retried recheck sees evaluated rows and inserts nothing new.
        let jobs = store.jobs_of(run.id);
        assert!(!expander.check_run(&run, &jobs).await.unwrap());
        assert_eq!(
            store
                .jobs_of(run.id)
                .iter()
                .filter(|j| j.key == JobKey::new("deploy"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_waits_while_needs_in_flight() {
        let store = Arc::new(MemStore::new());
        let repo = RepoId::new();
        let org = OrgId::new();
        let run = make_run(repo, org);

        let mut plan = job_with_needs(run.id, repo, org, "plan", &[]);
        plan.status = Status::Running;
        let deferred = Job::from_payload(run.id, repo, org, deferred_payload("deploy", &["plan"]));

        store.put_run(run.clone());
        store.put_job(plan);
        store.put_job(deferred.clone());

        let expander = MatrixExpander::new(store.clone(), Arc::new(StubEvaluator::default()));
        let jobs = store.jobs_of(run.id);
        assert!(!expander.check_run(&run, &jobs).await.unwrap());
        assert!(store.job(deferred.id).matrix_pending());
    }

    #[tokio::test]
    async fn test_evaluator_failure_is_non_fatal() {
        let store = Arc::new(MemStore::new());
        let repo = RepoId::new();
        let org = OrgId::new();
        let run = make_run(repo, org);

        let mut plan = job_with_needs(run.id, repo, org, "plan", &[]);
        plan.status = Status::Success;
        let deferred = Job::from_payload(run.id, repo, org, deferred_payload("deploy", &["plan"]));

        store.put_run(run.clone());
        store.put_job(plan);
        store.put_job(deferred.clone());

        let evaluator = Arc::new(StubEvaluator {
            fail_matrix: true,
            ..StubEvaluator::default()
        });
        let expander = MatrixExpander::new(store.clone(), evaluator);
        let jobs = store.jobs_of(run.id);
        expander.check_run(&run, &jobs).await.unwrap();

        // Marked evaluated without multiplying; the resolver takes it from
        // here on its original needs.
        let job = store.job(deferred.id);
        assert!(!job.matrix_pending());
        assert_eq!(job.needs.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_need_defers_to_skip_path() {
        let store = Arc::new(MemStore::new());
        let repo = RepoId::new();
        let org = OrgId::new();
        let run = make_run(repo, org);

        let mut plan = job_with_needs(run.id, repo, org, "plan", &[]);
        plan.status = Status::Failure;
        let deferred = Job::from_payload(run.id, repo, org, deferred_payload("deploy", &["plan"]));

        store.put_run(run.clone());
        store.put_job(plan);
        store.put_job(deferred.clone());

        let expander = MatrixExpander::new(store.clone(), Arc::new(StubEvaluator::default()));
        let jobs = store.jobs_of(run.id);
        expander.check_run(&run, &jobs).await.unwrap();

        let job = store.job(deferred.id);
        assert!(!job.matrix_pending());
        assert_eq!(job.needs, vec![JobKey::new("plan")]);
        assert_eq!(job.status, Status::Blocked);
    }
}
