// Database row models (internal, converted to/from core types)

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use workq_core::{Run, Task};

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub task_id: Uuid,
    pub task_queue_id: String,
    pub scopes: Vec<String>,
    pub routes: Vec<String>,
    pub retries_left: i32,
    pub created: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub runs: Json<Vec<Run>>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            task_id: row.task_id,
            task_queue_id: row.task_queue_id,
            scopes: row.scopes,
            routes: row.routes,
            retries_left: row.retries_left.max(0) as u32,
            created: row.created,
            deadline: row.deadline,
            expires: row.expires,
            payload: row.payload,
            runs: row.runs.0,
        }
    }
}
