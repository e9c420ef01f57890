//! PostgreSQL implementation of JobRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferrite_core::ids::{JobId, JobKey, OrgId, RepoId, RunId, TaskId};
use ferrite_core::job::Job;
use ferrite_core::ports::JobRepository;
use ferrite_core::runner::RunnerScope;
use ferrite_core::status::Status;
use ferrite_core::task::Task;
use ferrite_core::{Error, Result};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

const JOB_COLUMNS: &str = "id, run_id, repo_id, owner_id, job_key, name, needs, runs_on, status, \
     attempt, max_parallel, raw_concurrency_group, raw_cancel_in_progress, concurrency_group, \
     cancel_in_progress, is_concurrency_evaluated, raw_strategy, is_matrix_evaluated, if_expr, \
     task_id, child_run_id, outputs, payload, created_at, updated_at, started_at, stopped_at";

/// PostgreSQL implementation of JobRepository.
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn row_to_job(r: &sqlx::postgres::PgRow) -> Result<Job> {
    let needs: Vec<JobKey> = serde_json::from_value(r.get("needs"))?;
    let runs_on: Vec<String> = serde_json::from_value(r.get("runs_on"))?;
    let outputs: HashMap<String, String> = serde_json::from_value(r.get("outputs"))?;
    let payload = serde_json::from_value(r.get("payload"))?;

    Ok(Job {
        id: JobId::from_uuid(r.get("id")),
        run_id: RunId::from_uuid(r.get("run_id")),
        repo_id: RepoId::from_uuid(r.get("repo_id")),
        owner_id: OrgId::from_uuid(r.get("owner_id")),
        key: JobKey::new(r.get::<String, _>("job_key")),
        name: r.get("name"),
        needs,
        runs_on,
        status: Status::from_i32(r.get::<i32, _>("status")),
        attempt: r.get::<i32, _>("attempt") as u32,
        max_parallel: r.get::<i32, _>("max_parallel") as u32,
        raw_concurrency_group: r.get("raw_concurrency_group"),
        raw_cancel_in_progress: r.get("raw_cancel_in_progress"),
        concurrency_group: r.get("concurrency_group"),
        cancel_in_progress: r.get("cancel_in_progress"),
        is_concurrency_evaluated: r.get("is_concurrency_evaluated"),
        raw_strategy: r.get("raw_strategy"),
        is_matrix_evaluated: r.get("is_matrix_evaluated"),
        if_expr: r.get("if_expr"),
        task_id: r
            .get::<Option<uuid::Uuid>, _>("task_id")
            .map(TaskId::from_uuid),
        child_run_id: r
            .get::<Option<uuid::Uuid>, _>("child_run_id")
            .map(RunId::from_uuid),
        outputs,
        payload,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        started_at: r.get("started_at"),
        stopped_at: r.get("stopped_at"),
    })
}

pub(crate) async fn insert_job<'e, E>(executor: E, job: &Job) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    let needs = serde_json::to_value(&job.needs)?;
    let runs_on = serde_json::to_value(&job.runs_on)?;
    let outputs = serde_json::to_value(&job.outputs)?;
    let payload = serde_json::to_value(&job.payload)?;

    sqlx::query(
        r#"INSERT INTO jobs (id, run_id, repo_id, owner_id, job_key, name, needs, runs_on, status,
               attempt, max_parallel, raw_concurrency_group, raw_cancel_in_progress,
               concurrency_group, cancel_in_progress, is_concurrency_evaluated, raw_strategy,
               is_matrix_evaluated, if_expr, task_id, child_run_id, outputs, payload,
               created_at, updated_at, started_at, stopped_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
               $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)"#,
    )
    .bind(job.id.as_uuid())
    .bind(job.run_id.as_uuid())
    .bind(job.repo_id.as_uuid())
    .bind(job.owner_id.as_uuid())
    .bind(job.key.as_str())
    .bind(&job.name)
    .bind(&needs)
    .bind(&runs_on)
    .bind(job.status as i32)
    .bind(job.attempt as i32)
    .bind(job.max_parallel as i32)
    .bind(&job.raw_concurrency_group)
    .bind(job.raw_cancel_in_progress)
    .bind(&job.concurrency_group)
    .bind(job.cancel_in_progress)
    .bind(job.is_concurrency_evaluated)
    .bind(&job.raw_strategy)
    .bind(job.is_matrix_evaluated)
    .bind(&job.if_expr)
    .bind(job.task_id.map(|t| *t.as_uuid()))
    .bind(job.child_run_id.map(|r| *r.as_uuid()))
    .bind(&outputs)
    .bind(&payload)
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.stopped_at)
    .execute(executor)
    .await
    .map_err(|e| Error::Database(e.to_string()))?;

    Ok(())
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_by_run(&self, run_id: RunId) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE run_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn update_status_if(&self, id: JobId, expected: Status, status: Status) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE jobs SET status = $3, updated_at = NOW(),
                   stopped_at = CASE WHEN $4 THEN NOW() ELSE stopped_at END
               WHERE id = $1 AND status = $2"#,
        )
        .bind(id.as_uuid())
        .bind(expected as i32)
        .bind(status as i32)
        .bind(status.is_done())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim(&self, id: JobId, task: &Task) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // The claim guard: exactly one caller can move task_id off NULL.
        let result = sqlx::query(
            r#"UPDATE jobs SET task_id = $2, status = $3, attempt = attempt + 1,
                   started_at = $4, updated_at = NOW()
               WHERE id = $1 AND task_id IS NULL AND status = $5"#,
        )
        .bind(id.as_uuid())
        .bind(task.id.as_uuid())
        .bind(Status::Running as i32)
        .bind(task.started_at)
        .bind(Status::Waiting as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            return Ok(false);
        }

        let steps = serde_json::to_value(&task.steps)?;
        let outputs = serde_json::to_value(&task.outputs)?;
        sqlx::query(
            r#"INSERT INTO tasks (id, job_id, run_id, runner_id, status, steps, token, outputs,
                   created_at, updated_at, started_at, stopped_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(task.id.as_uuid())
        .bind(task.job_id.as_uuid())
        .bind(task.run_id.as_uuid())
        .bind(task.runner_id.as_uuid())
        .bind(task.status as i32)
        .bind(&steps)
        .bind(&task.token)
        .bind(&outputs)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.stopped_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(true)
    }

    async fn finish(
        &self,
        id: JobId,
        status: Status,
        outputs: &HashMap<String, String>,
    ) -> Result<bool> {
        let outputs = serde_json::to_value(outputs)?;
        let result = sqlx::query(
            r#"UPDATE jobs SET status = $2, outputs = $3, updated_at = NOW(), stopped_at = NOW()
               WHERE id = $1 AND status = $4"#,
        )
        .bind(id.as_uuid())
        .bind(status as i32)
        .bind(&outputs)
        .bind(Status::Running as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, id: JobId) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"UPDATE jobs SET status = $2, updated_at = NOW(), stopped_at = NOW()
               WHERE id = $1 AND status IN ($3, $4, $5)"#,
        )
        .bind(id.as_uuid())
        .bind(Status::Cancelled as i32)
        .bind(Status::Waiting as i32)
        .bind(Status::Blocked as i32)
        .bind(Status::Running as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            return Ok(false);
        }

        // Stop the live task alongside its job.
        sqlx::query(
            r#"UPDATE tasks SET status = $2, updated_at = NOW(), stopped_at = NOW()
               WHERE job_id = $1 AND status NOT IN ($3, $4, $5, $6)"#,
        )
        .bind(id.as_uuid())
        .bind(Status::Cancelled as i32)
        .bind(Status::Success as i32)
        .bind(Status::Failure as i32)
        .bind(Status::Cancelled as i32)
        .bind(Status::Skipped as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(true)
    }

    async fn list_waiting(&self, scope: &RunnerScope) -> Result<Vec<Job>> {
        let base = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 AND task_id IS NULL"
        );
        let rows = match scope {
            RunnerScope::Global => {
                sqlx::query(&format!("{base} ORDER BY created_at ASC, id ASC"))
                    .bind(Status::Waiting as i32)
                    .fetch_all(&self.pool)
                    .await
            }
            RunnerScope::Organization { owner_id } => {
                sqlx::query(&format!(
                    "{base} AND owner_id = $2 ORDER BY created_at ASC, id ASC"
                ))
                .bind(Status::Waiting as i32)
                .bind(owner_id.as_uuid())
                .fetch_all(&self.pool)
                .await
            }
            RunnerScope::Repository { repo_id } => {
                sqlx::query(&format!(
                    "{base} AND repo_id = $2 ORDER BY created_at ASC, id ASC"
                ))
                .bind(Status::Waiting as i32)
                .bind(repo_id.as_uuid())
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn count_running_siblings(&self, run_id: RunId, key: &JobKey) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS running FROM jobs WHERE run_id = $1 AND job_key = $2 AND status = $3",
        )
        .bind(run_id.as_uuid())
        .bind(key.as_str())
        .bind(Status::Running as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("running") as u64)
    }

    async fn list_in_group(
        &self,
        repo_id: RepoId,
        group: &str,
        statuses: &[Status],
        exclude: Option<JobId>,
    ) -> Result<Vec<Job>> {
        let status_values: Vec<i32> = statuses.iter().map(|s| *s as i32).collect();
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE repo_id = $1 AND concurrency_group = $2 AND is_concurrency_evaluated
               AND status = ANY($3) AND ($4::uuid IS NULL OR id <> $4)
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(repo_id.as_uuid())
        .bind(group)
        .bind(&status_values)
        .bind(exclude.map(|j| *j.as_uuid()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn oldest_blocked_in_group(&self, repo_id: RepoId, group: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE repo_id = $1 AND concurrency_group = $2 AND is_concurrency_evaluated
               AND status = $3
             ORDER BY created_at ASC, id ASC LIMIT 1"
        ))
        .bind(repo_id.as_uuid())
        .bind(group)
        .bind(Status::Blocked as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn set_concurrency(&self, id: JobId, group: &str, cancel_in_progress: bool) -> Result<()> {
        sqlx::query(
            r#"UPDATE jobs SET concurrency_group = $2, cancel_in_progress = $3,
                   is_concurrency_evaluated = TRUE, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id.as_uuid())
        .bind(group)
        .bind(cancel_in_progress)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn finish_matrix_expansion(&self, placeholder: &Job, siblings: &[Job]) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let needs = serde_json::to_value(&placeholder.needs)?;
        let runs_on = serde_json::to_value(&placeholder.runs_on)?;
        let payload = serde_json::to_value(&placeholder.payload)?;

        // The evaluated flag flips with the rewrite; a concurrent expander
        // sees zero rows affected and inserts nothing.
        let result = sqlx::query(
            r#"UPDATE jobs SET name = $2, needs = $3, runs_on = $4, max_parallel = $5,
                   payload = $6, is_matrix_evaluated = TRUE, updated_at = NOW()
               WHERE id = $1 AND is_matrix_evaluated = FALSE"#,
        )
        .bind(placeholder.id.as_uuid())
        .bind(&placeholder.name)
        .bind(&needs)
        .bind(&runs_on)
        .bind(placeholder.max_parallel as i32)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            return Ok(false);
        }

        for sibling in siblings {
            insert_job(&mut *tx, sibling).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(true)
    }

    async fn set_child_run(&self, id: JobId, child_run_id: RunId) -> Result<()> {
        sqlx::query("UPDATE jobs SET child_run_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(child_run_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_stale(&self, statuses: &[Status], before: DateTime<Utc>) -> Result<Vec<Job>> {
        let status_values: Vec<i32> = statuses.iter().map(|s| *s as i32).collect();
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ANY($1) AND updated_at < $2"
        ))
        .bind(&status_values)
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }
}
