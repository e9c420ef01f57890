//! Dependency resolution: promoting blocked jobs once their needs settle.

use ferrite_core::ids::{JobId, JobKey};
use ferrite_core::ports::ExpressionEvaluator;
use ferrite_core::status::{Status, aggregate_job_status};
use ferrite_core::workflow::{EvalContext, NeedContext};
use ferrite_core::job::Job;
use std::collections::HashMap;
use tracing::warn;

/// Compute status promotions for the blocked jobs of one run.
///
/// Side-effect-free over persistent state: the caller applies the returned
/// map with conditional updates (`WHERE status = blocked`) so that a row a
/// concurrent caller already moved is left alone.
///
/// Resolution iterates to a fixed point inside this single pass, so a chain
/// of blocked jobs whose head just failed cascades to `Skipped` without one
/// queue cycle per level. Cyclic needs never satisfy the all-terminal check
/// and simply produce no update.
pub fn resolve(jobs: &[Job], evaluator: &dyn ExpressionEvaluator) -> HashMap<JobId, Status> {
    let mut updates: HashMap<JobId, Status> = HashMap::new();

    // A chain can be at most `jobs.len()` levels deep.
    for _ in 0..jobs.len() {
        let by_key = statuses_by_key(jobs, &updates);
        let mut changed = false;

        for job in jobs {
            let current = updates.get(&job.id).copied().unwrap_or(job.status);
            if current != Status::Blocked {
                continue;
            }
            // Placeholders wait for the matrix expander, not for us.
            if job.matrix_pending() {
                continue;
            }
            // Jobs parked by the concurrency controller are promoted by its
            // group sweep instead.
            if job.is_concurrency_evaluated && !job.concurrency_group.is_empty() {
                continue;
            }

            if job.needs.is_empty() {
                updates.insert(job.id, Status::Waiting);
                changed = true;
                continue;
            }

            let Some(needs) = settled_needs(job, &by_key) else {
                continue;
            };

            let next = if needs.iter().all(|(_, s)| s.is_success()) {
                Status::Waiting
            } else {
                conditional_override(job, jobs, &updates, evaluator)
            };
            updates.insert(job.id, next);
            changed = true;
        }

        if !changed {
            break;
        }
    }

    updates
}

/// The statuses of every job row, grouped by symbolic key, with pending
/// updates from the current pass already applied.
fn statuses_by_key<'a>(
    jobs: &'a [Job],
    updates: &HashMap<JobId, Status>,
) -> HashMap<&'a str, Vec<Status>> {
    let mut by_key: HashMap<&str, Vec<Status>> = HashMap::new();
    for job in jobs {
        let status = updates.get(&job.id).copied().unwrap_or(job.status);
        by_key.entry(job.key.as_str()).or_default().push(status);
    }
    by_key
}

/// If every needed key is fully terminal, the per-key aggregate statuses;
/// `None` while anything is still in flight or a key is missing entirely.
fn settled_needs(
    job: &Job,
    by_key: &HashMap<&str, Vec<Status>>,
) -> Option<Vec<(JobKey, Status)>> {
    let mut settled = Vec::with_capacity(job.needs.len());
    for need in &job.needs {
        let rows = by_key.get(need.as_str())?;
        if rows.iter().any(|s| !s.is_done()) {
            return None;
        }
        settled.push((need.clone(), aggregate_job_status(rows)));
    }
    Some(settled)
}

/// A dependency did not succeed: skip the job unless its conditional
/// expression opts back in (`if: always()` and friends).
fn conditional_override(
    job: &Job,
    jobs: &[Job],
    updates: &HashMap<JobId, Status>,
    evaluator: &dyn ExpressionEvaluator,
) -> Status {
    let Some(expr) = job.if_expr.as_deref().filter(|e| !e.trim().is_empty()) else {
        return Status::Skipped;
    };

    let ctx = EvalContext {
        needs: collect_needs_with(jobs, &job.needs, updates),
        ..EvalContext::new()
    };
    match evaluator.eval_condition(expr, &ctx) {
        Ok(true) => Status::Waiting,
        Ok(false) => Status::Skipped,
        Err(e) => {
            warn!(job = %job.id, error = %e, "Conditional expression failed, skipping job");
            Status::Skipped
        }
    }
}

/// Resolve the outcome of each needed key: aggregated result plus merged
/// outputs across all rows sharing the key (matrix cells leave unset outputs
/// empty, so a non-empty value always wins the merge).
pub fn collect_needs(jobs: &[Job], needs: &[JobKey]) -> HashMap<String, NeedContext> {
    collect_needs_with(jobs, needs, &HashMap::new())
}

fn collect_needs_with(
    jobs: &[Job],
    needs: &[JobKey],
    updates: &HashMap<JobId, Status>,
) -> HashMap<String, NeedContext> {
    let mut resolved = HashMap::new();
    for need in needs {
        let mut statuses = Vec::new();
        let mut outputs: HashMap<String, String> = HashMap::new();
        for job in jobs.iter().filter(|j| j.key == *need) {
            statuses.push(updates.get(&job.id).copied().unwrap_or(job.status));
            for (name, value) in &job.outputs {
                match outputs.get(name) {
                    Some(existing) if !existing.is_empty() => {}
                    _ => {
                        outputs.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        resolved.insert(
            need.as_str().to_string(),
            NeedContext {
                result: aggregate_job_status(&statuses),
                outputs,
            },
        );
    }
    resolved
}
