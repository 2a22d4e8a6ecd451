// Claim outcomes and results

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::creds::WorkCredentials;
use crate::task::{Task, TaskStatus};

/// Outcome of a single authoritative claim attempt.
///
/// Only `Claimed` carries a result; the other variants are expected, racy
/// and non-fatal - callers keep polling fresh hints.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(Box<ClaimResult>),
    /// Someone else won the race, or a stale/non-latest run was referenced
    Conflict,
    TaskNotFound,
    RunNotFound,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    pub fn into_claimed(self) -> Option<Box<ClaimResult>> {
        match self {
            ClaimOutcome::Claimed(result) => Some(result),
            _ => None,
        }
    }

    /// Short label for structured logs
    pub fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Claimed(_) => "claimed",
            ClaimOutcome::Conflict => "conflict",
            ClaimOutcome::TaskNotFound => "task-not-found",
            ClaimOutcome::RunNotFound => "run-not-found",
        }
    }
}

/// The artifact returned to a worker for a successful claim.
///
/// Immutable once constructed. `taken_until` is the value stored on the run,
/// so a retried claim returns a timestamp identical to the original.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimResult {
    pub status: TaskStatus,
    pub run_id: u32,
    pub worker_group: String,
    pub worker_id: String,
    pub taken_until: DateTime<Utc>,
    pub task: Task,
    pub credentials: WorkCredentials,
}

/// Payload of the "task running" notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunningMessage {
    pub status: TaskStatus,
    pub run_id: u32,
    pub worker_group: String,
    pub worker_id: String,
    pub taken_until: DateTime<Utc>,
}

/// Round a timestamp up to the next whole second.
///
/// Claim expiry timestamps must compare equal after a round-trip through the
/// hint transport's second-granularity serialization, so sub-second precision
/// is shed here, always in the worker's favor.
pub fn round_up_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    if at.timestamp_subsec_nanos() == 0 {
        at
    } else {
        Utc.timestamp_opt(at.timestamp() + 1, 0).single().unwrap_or(at)
    }
}

/// Claim-expiry message scheduled into the hint transport before the claim
/// transaction runs (the crash-safety ordering invariant).
///
/// Once `taken_until` passes, the transport redelivers the message as a hint
/// on `task_queue_id` so an expired claim gets another look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimMessage {
    pub task_queue_id: String,
    pub task_id: Uuid,
    pub run_id: u32,
    pub taken_until: DateTime<Utc>,
}
