//! PostgreSQL implementation of RunnerRepository.

use async_trait::async_trait;
use ferrite_core::ids::{OrgId, RepoId, RunnerId};
use ferrite_core::ports::RunnerRepository;
use ferrite_core::runner::{Runner, RunnerScope};
use ferrite_core::{Error, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of RunnerRepository.
pub struct PgRunnerRepository {
    pool: PgPool,
}

impl PgRunnerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_runner(r: &sqlx::postgres::PgRow) -> Result<Runner> {
    let labels: Vec<String> = serde_json::from_value(r.get("labels"))?;
    let scope = match (
        r.get::<Option<uuid::Uuid>, _>("repo_id"),
        r.get::<Option<uuid::Uuid>, _>("owner_id"),
    ) {
        (Some(repo), _) => RunnerScope::Repository {
            repo_id: RepoId::from_uuid(repo),
        },
        (None, Some(owner)) => RunnerScope::Organization {
            owner_id: OrgId::from_uuid(owner),
        },
        (None, None) => RunnerScope::Global,
    };

    Ok(Runner {
        id: RunnerId::from_uuid(r.get("id")),
        name: r.get("name"),
        version: r.get("version"),
        labels,
        capacity: r.get::<i32, _>("capacity") as u32,
        scope,
        registered_at: r.get("registered_at"),
        last_heartbeat_at: r.get("last_heartbeat_at"),
    })
}

#[async_trait]
impl RunnerRepository for PgRunnerRepository {
    async fn register(&self, runner: &Runner) -> Result<RunnerId> {
        let labels = serde_json::to_value(&runner.labels)?;
        let (repo_id, owner_id) = match runner.scope {
            RunnerScope::Global => (None, None),
            RunnerScope::Organization { owner_id } => (None, Some(*owner_id.as_uuid())),
            RunnerScope::Repository { repo_id } => (Some(*repo_id.as_uuid()), None),
        };

        sqlx::query(
            r#"INSERT INTO runners (id, name, version, labels, capacity, owner_id, repo_id,
                   registered_at, last_heartbeat_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(runner.id.as_uuid())
        .bind(&runner.name)
        .bind(&runner.version)
        .bind(&labels)
        .bind(runner.capacity as i32)
        .bind(owner_id)
        .bind(repo_id)
        .bind(runner.registered_at)
        .bind(runner.last_heartbeat_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(runner.id)
    }

    async fn get(&self, id: RunnerId) -> Result<Option<Runner>> {
        let row = sqlx::query(
            "SELECT id, name, version, labels, capacity, owner_id, repo_id, registered_at, last_heartbeat_at FROM runners WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.as_ref().map(row_to_runner).transpose()
    }

    async fn heartbeat(&self, id: RunnerId, labels: Option<&[String]>) -> Result<()> {
        let labels = labels.map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"UPDATE runners SET last_heartbeat_at = NOW(), labels = COALESCE($2, labels)
               WHERE id = $1"#,
        )
        .bind(id.as_uuid())
        .bind(labels)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
