// In-memory task store for tests and single-process deployments
//
// Applies the same claim rule as the Postgres backend; the map mutex plays
// the role of the row lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use workq_core::{Task, TaskStore};

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<Mutex<HashMap<Uuid, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task
    pub async fn insert_task(&self, task: Task) {
        self.tasks.lock().await.insert(task.task_id, task);
    }

    pub async fn remove_task(&self, task_id: Uuid) {
        self.tasks.lock().await.remove(&task_id);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task(&self, task_id: Uuid) -> workq_core::Result<Option<Task>> {
        Ok(self.tasks.lock().await.get(&task_id).cloned())
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
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        task.apply_claim(run_id, worker_group, worker_id, hint_id, taken_until);
        Ok(Some(task.clone()))
    }
}
