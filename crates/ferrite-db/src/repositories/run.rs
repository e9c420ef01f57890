//! PostgreSQL implementation of RunRepository.

use crate::repositories::job::insert_job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferrite_core::ids::{JobId, OrgId, RepoId, RunId, UserId};
use ferrite_core::job::Job;
use ferrite_core::ports::RunRepository;
use ferrite_core::run::Run;
use ferrite_core::status::{Status, aggregate_job_status};
use ferrite_core::{Error, Result};
use sqlx::{PgPool, Row};

const RUN_COLUMNS: &str = "id, repo_id, owner_id, run_index, workflow_id, title, trigger_event, \
     event_payload, git_ref, commit_sha, status, need_approval, approved_by, parent_job_id, \
     concurrency_group, cancel_in_progress, created_at, updated_at, started_at, stopped_at";

/// PostgreSQL implementation of RunRepository.
pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_run(r: &sqlx::postgres::PgRow) -> Result<Run> {
    Ok(Run {
        id: RunId::from_uuid(r.get("id")),
        repo_id: RepoId::from_uuid(r.get("repo_id")),
        owner_id: OrgId::from_uuid(r.get("owner_id")),
        index: r.get::<i64, _>("run_index") as u64,
        workflow_id: r.get("workflow_id"),
        title: r.get("title"),
        trigger_event: r.get("trigger_event"),
        event_payload: r.get("event_payload"),
        git_ref: r.get("git_ref"),
        commit_sha: r.get("commit_sha"),
        status: Status::from_i32(r.get::<i32, _>("status")),
        need_approval: r.get("need_approval"),
        approved_by: r
            .get::<Option<uuid::Uuid>, _>("approved_by")
            .map(UserId::from_uuid),
        parent_job_id: r
            .get::<Option<uuid::Uuid>, _>("parent_job_id")
            .map(JobId::from_uuid),
        concurrency_group: r.get("concurrency_group"),
        cancel_in_progress: r.get("cancel_in_progress"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        started_at: r.get("started_at"),
        stopped_at: r.get("stopped_at"),
    })
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn create_with_jobs(&self, run: &Run, jobs: &[Job]) -> Result<Run> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // The counter upsert also serializes concurrent inserts per
        // repository, so the group-occupancy checks below race with nobody.
        let index_row = sqlx::query(
            r#"INSERT INTO run_counters (repo_id, latest) VALUES ($1, 1)
               ON CONFLICT (repo_id) DO UPDATE SET latest = run_counters.latest + 1
               RETURNING latest"#,
        )
        .bind(run.repo_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut run = run.clone();
        run.index = index_row.get::<i64, _>("latest") as u64;

        if !run.concurrency_group.is_empty() && !run.cancel_in_progress {
            let occupied = sqlx::query(
                r#"SELECT COUNT(*) AS occupants FROM runs
                   WHERE repo_id = $1 AND concurrency_group = $2
                     AND status NOT IN ($3, $4, $5, $6) AND id <> $7"#,
            )
            .bind(run.repo_id.as_uuid())
            .bind(&run.concurrency_group)
            .bind(Status::Success as i32)
            .bind(Status::Failure as i32)
            .bind(Status::Cancelled as i32)
            .bind(Status::Skipped as i32)
            .bind(run.id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            if occupied.get::<i64, _>("occupants") > 0 {
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
            {
                let occupied = sqlx::query(
                    r#"SELECT COUNT(*) AS occupants FROM jobs
                       WHERE repo_id = $1 AND concurrency_group = $2
                         AND is_concurrency_evaluated AND status IN ($3, $4)"#,
                )
                .bind(job.repo_id.as_uuid())
                .bind(&job.concurrency_group)
                .bind(Status::Waiting as i32)
                .bind(Status::Running as i32)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

                if occupied.get::<i64, _>("occupants") > 0 {
                    job.status = Status::Blocked;
                }
            }
            stored_jobs.push(job);
        }

        if run.status != Status::Blocked {
            let statuses: Vec<Status> = stored_jobs.iter().map(|j| j.status).collect();
            run.status = aggregate_job_status(&statuses);
        }

        sqlx::query(
            r#"INSERT INTO runs (id, repo_id, owner_id, run_index, workflow_id, title,
                   trigger_event, event_payload, git_ref, commit_sha, status, need_approval,
                   approved_by, parent_job_id, concurrency_group, cancel_in_progress,
                   created_at, updated_at, started_at, stopped_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                   $17, $18, $19, $20)"#,
        )
        .bind(run.id.as_uuid())
        .bind(run.repo_id.as_uuid())
        .bind(run.owner_id.as_uuid())
        .bind(run.index as i64)
        .bind(&run.workflow_id)
        .bind(&run.title)
        .bind(&run.trigger_event)
        .bind(&run.event_payload)
        .bind(&run.git_ref)
        .bind(&run.commit_sha)
        .bind(run.status as i32)
        .bind(run.need_approval)
        .bind(run.approved_by.map(|u| *u.as_uuid()))
        .bind(run.parent_job_id.map(|j| *j.as_uuid()))
        .bind(&run.concurrency_group)
        .bind(run.cancel_in_progress)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.started_at)
        .bind(run.stopped_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        for job in &stored_jobs {
            insert_job(&mut *tx, job).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(run)
    }

    async fn get(&self, id: RunId) -> Result<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        row.as_ref().map(row_to_run).transpose()
    }

    async fn update_status(
        &self,
        id: RunId,
        status: Status,
        stopped_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE runs SET status = $2, updated_at = NOW(),
                   started_at = CASE WHEN $3 AND started_at IS NULL THEN NOW() ELSE started_at END,
                   stopped_at = COALESCE($4, stopped_at)
               WHERE id = $1"#,
        )
        .bind(id.as_uuid())
        .bind(status as i32)
        .bind(status == Status::Running)
        .bind(stopped_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn set_approved(&self, id: RunId, approved_by: UserId) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE runs SET approved_by = $2, updated_at = NOW()
               WHERE id = $1 AND need_approval AND approved_by IS NULL"#,
        )
        .bind(id.as_uuid())
        .bind(approved_by.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_active_in_group(
        &self,
        repo_id: RepoId,
        group: &str,
        exclude: Option<RunId>,
    ) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE repo_id = $1 AND concurrency_group = $2
               AND status NOT IN ($3, $4, $5, $6, $7)
               AND ($8::uuid IS NULL OR id <> $8)
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(repo_id.as_uuid())
        .bind(group)
        .bind(Status::Success as i32)
        .bind(Status::Failure as i32)
        .bind(Status::Cancelled as i32)
        .bind(Status::Skipped as i32)
        .bind(Status::Blocked as i32)
        .bind(exclude.map(|r| *r.as_uuid()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(row_to_run).collect()
    }

    async fn oldest_blocked_in_group(&self, repo_id: RepoId, group: &str) -> Result<Option<Run>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE repo_id = $1 AND concurrency_group = $2 AND status = $3
             ORDER BY created_at ASC, id ASC LIMIT 1"
        ))
        .bind(repo_id.as_uuid())
        .bind(group)
        .bind(Status::Blocked as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.as_ref().map(row_to_run).transpose()
    }
}
