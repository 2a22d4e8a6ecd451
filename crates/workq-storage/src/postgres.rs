// Postgres-backed task store
//
// Claiming locks the task row, applies the shared claim rule in process,
// and writes the runs column back in the same transaction. That keeps the
// store the single arbiter of claim conflicts: two racing claimants
// serialize on the row lock and the loser sees the winner's identity on
// the run.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use workq_core::{ClaimError, Task, TaskStore};

use crate::models::TaskRow;

const SELECT_TASK: &str = r#"
    SELECT task_id, task_queue_id, scopes, routes, retries_left,
           created, deadline, expires, payload, runs
    FROM tasks
    WHERE task_id = $1
"#;

#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store from a database URL
    pub async fn from_url(database_url: &str) -> AnyResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tasks table if it does not exist yet
    pub async fn ensure_schema(&self) -> AnyResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id UUID PRIMARY KEY,
                task_queue_id TEXT NOT NULL,
                scopes TEXT[] NOT NULL DEFAULT '{}',
                routes TEXT[] NOT NULL DEFAULT '{}',
                retries_left INT NOT NULL DEFAULT 5,
                created TIMESTAMPTZ NOT NULL,
                deadline TIMESTAMPTZ NOT NULL,
                expires TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL DEFAULT '{}',
                runs JSONB NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a task (used by seeding and tests; task creation proper is
    /// outside the claiming core)
    pub async fn insert_task(&self, task: &Task) -> AnyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, task_queue_id, scopes, routes, retries_left,
                               created, deadline, expires, payload, runs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.task_id)
        .bind(&task.task_queue_id)
        .bind(&task.scopes)
        .bind(&task.routes)
        .bind(task.retries_left as i32)
        .bind(task.created)
        .bind(task.deadline)
        .bind(task.expires)
        .bind(&task.payload)
        .bind(Json(&task.runs))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn get_task(&self, task_id: Uuid) -> workq_core::Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(SELECT_TASK)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ClaimError::store(e.to_string()))?;

        Ok(row.map(Task::from))
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        run_id: u32,
        worker_group: &str,
        worker_id: &str,
        hint_id: Uuid,
        taken_until: DateTime<Utc>,
    ) -> workq_core::Result<Option<Task>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ClaimError::store(e.to_string()))?;

        let row = sqlx::query_as::<_, TaskRow>(&format!("{SELECT_TASK} FOR UPDATE"))
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ClaimError::store(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut task = Task::from(row);
        task.apply_claim(run_id, worker_group, worker_id, hint_id, taken_until);

        sqlx::query("UPDATE tasks SET runs = $2 WHERE task_id = $1")
            .bind(task_id)
            .bind(Json(&task.runs))
            .execute(&mut *tx)
            .await
            .map_err(|e| ClaimError::store(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| ClaimError::store(e.to_string()))?;

        debug!(task_id = %task_id, run_id, "claim transaction committed");
        Ok(Some(task))
    }
}
