// Trait seams for the external collaborators of the claiming core
//
// These traits let the claimer run against different backends:
// - Postgres store / broker-backed transport in production
// - In-memory store / in-process transport for tests and examples

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::claim::TaskRunningMessage;
use crate::error::Result;
use crate::hint::Hint;
use crate::task::Task;

// ============================================================================
// TaskStore - the authoritative task/run store
// ============================================================================

/// The authoritative source of truth for tasks and run claim state.
///
/// `claim_task` is assumed atomic and is the sole arbiter of claim
/// conflicts; no in-process locking substitutes for it.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Load a task by id
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// Atomically apply the claim rule (`Task::apply_claim`) and return the
    /// updated task, or `None` if the task no longer exists.
    ///
    /// A conflicting claim is not an error: the returned run state simply
    /// won't match the caller's identity.
    #[allow(clippy::too_many_arguments)]
    async fn claim_task(
        &self,
        task_id: Uuid,
        run_id: u32,
        worker_group: &str,
        worker_id: &str,
        hint_id: Uuid,
        taken_until: DateTime<Utc>,
    ) -> Result<Option<Task>>;
}

// ============================================================================
// HintTransport - at-least-once hint delivery
// ============================================================================

/// One pollable hint source (a single priority level of a task queue)
#[async_trait]
pub trait PendingQueue: Send + Sync {
    /// Return up to `limit` hints. An empty vec means the source is
    /// momentarily drained, not that no work is pending anywhere.
    async fn poll(&self, limit: usize) -> Result<Vec<Hint>>;
}

/// The hint-queue transport
#[async_trait]
pub trait HintTransport: Send + Sync {
    /// Poll sources for a task queue, ordered by descending priority
    async fn pending_queues(&self, task_queue_id: &str) -> Result<Vec<Box<dyn PendingQueue>>>;

    /// Schedule a claim-expiry message for `(task_id, run_id, taken_until)`.
    ///
    /// Enqueued *before* the claim transaction runs; once `taken_until`
    /// passes the message surfaces as a hint on `task_queue_id` again. If
    /// the claim never took effect the redelivered hint is simply stale.
    async fn put_claim_message(
        &self,
        task_queue_id: &str,
        task_id: Uuid,
        run_id: u32,
        taken_until: DateTime<Utc>,
    ) -> Result<()>;
}

// ============================================================================
// Publisher - claim-result notifications
// ============================================================================

/// Publishes "task running" notifications to interested consumers
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a task-running message along the task's routes
    async fn task_running(&self, message: &TaskRunningMessage, routes: &[String]) -> Result<()>;
}
