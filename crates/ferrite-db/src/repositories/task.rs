//! PostgreSQL implementation of TaskRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferrite_core::ids::{JobId, RunId, RunnerId, TaskId};
use ferrite_core::ports::TaskRepository;
use ferrite_core::status::Status;
use ferrite_core::task::Task;
use ferrite_core::{Error, Result};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

const TASK_COLUMNS: &str = "id, job_id, run_id, runner_id, status, steps, token, outputs, \
     created_at, updated_at, started_at, stopped_at";

/// PostgreSQL implementation of TaskRepository.
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_task(r: &sqlx::postgres::PgRow) -> Result<Task> {
    let steps = serde_json::from_value(r.get("steps"))?;
    let outputs: HashMap<String, String> = serde_json::from_value(r.get("outputs"))?;

    Ok(Task {
        id: TaskId::from_uuid(r.get("id")),
        job_id: JobId::from_uuid(r.get("job_id")),
        run_id: RunId::from_uuid(r.get("run_id")),
        runner_id: RunnerId::from_uuid(r.get("runner_id")),
        status: Status::from_i32(r.get::<i32, _>("status")),
        steps,
        token: r.get("token"),
        outputs,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        started_at: r.get("started_at"),
        stopped_at: r.get("stopped_at"),
    })
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn finish(
        &self,
        id: TaskId,
        status: Status,
        outputs: &HashMap<String, String>,
    ) -> Result<bool> {
        let outputs = serde_json::to_value(outputs)?;
        let result = sqlx::query(
            r#"UPDATE tasks SET status = $2, outputs = $3, updated_at = NOW(), stopped_at = NOW()
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

    async fn heartbeat(&self, id: TaskId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE tasks SET updated_at = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn count_active_for_runner(&self, runner_id: RunnerId) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS active FROM tasks WHERE runner_id = $1 AND status NOT IN ($2, $3, $4, $5)",
        )
        .bind(runner_id.as_uuid())
        .bind(Status::Success as i32)
        .bind(Status::Failure as i32)
        .bind(Status::Cancelled as i32)
        .bind(Status::Skipped as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("active") as u64)
    }

    async fn list_zombies(&self, updated_before: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 AND updated_at < $2"
        ))
        .bind(Status::Running as i32)
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(row_to_task).collect()
    }

    async fn list_endless(&self, started_before: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 AND started_at < $2"
        ))
        .bind(Status::Running as i32)
        .bind(started_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(row_to_task).collect()
    }
}
