// Hints: over-approximate signals of pending work
//
// The hint transport doesn't know whether a task is still pending, it only
// stores hints. Read it this way:
//  A) if a task is pending, a hint for it exists in some queue,
//  B) if a hint exists, the task may or may not be pending.
// An if, not an only-if (think over-approximation). The task store is the
// authority; hints just tell us where to look.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// Transport-side handle behind a hint.
///
/// Both operations are idempotent and must tolerate being called after the
/// transport has already expired the underlying message.
#[async_trait]
pub trait HintHandle: Send + Sync {
    /// Make the hint visible to other pollers again
    async fn release(&self) -> Result<()>;

    /// Permanently delete the hint (it was successfully consumed)
    async fn remove(&self) -> Result<()>;
}

/// A hint that a task/run may be pending.
///
/// Ownership is transient: a hint moves poll source -> poller -> claimer and
/// must end in exactly one of delivered-then-consumed, released, or removed.
#[derive(Clone)]
pub struct Hint {
    pub task_id: Uuid,
    pub run_id: u32,
    /// Correlation token tying this hint to the claim attempt it produces
    pub hint_id: Uuid,
    handle: Arc<dyn HintHandle>,
}

impl Hint {
    pub fn new(task_id: Uuid, run_id: u32, hint_id: Uuid, handle: Arc<dyn HintHandle>) -> Self {
        Self {
            task_id,
            run_id,
            hint_id,
            handle,
        }
    }

    /// Release the hint back to the transport
    pub async fn release(&self) -> Result<()> {
        self.handle.release().await
    }

    /// Remove the hint from the transport for good
    pub async fn remove(&self) -> Result<()> {
        self.handle.remove().await
    }
}

impl fmt::Debug for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hint")
            .field("task_id", &self.task_id)
            .field("run_id", &self.run_id)
            .field("hint_id", &self.hint_id)
            .finish()
    }
}
