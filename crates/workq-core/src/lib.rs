// Work-Claiming Core Abstractions
//
// This crate defines the store-agnostic domain of the workq claiming core:
// tasks and runs, hints, claim outcomes, credential derivation, and the
// trait seams behind which the authoritative store, the hint transport and
// the notification publisher live.
//
// Key design decisions:
// - Conflict / task-not-found / run-not-found are claim outcomes, not
//   errors; ClaimError is reserved for infrastructure failures
// - The claim-application rule (Task::apply_claim) is defined once here and
//   shared by every TaskStore backend
// - Hints carry idempotent release/remove handles as trait objects, so the
//   claimer never knows which transport produced them
// - Credential derivation is a pure function over root credentials

pub mod claim;
pub mod config;
pub mod creds;
pub mod error;
pub mod hint;
pub mod task;
pub mod traits;

pub use claim::{round_up_to_second, ClaimMessage, ClaimOutcome, ClaimResult, TaskRunningMessage};
pub use config::ClaimConfig;
pub use creds::{derive_task_credentials, RootCredentials, WorkCredentials};
pub use error::{ClaimError, Result};
pub use hint::{Hint, HintHandle};
pub use task::{Run, RunState, RunSummary, Task, TaskState, TaskStatus};
pub use traits::{HintTransport, PendingQueue, Publisher, TaskStore};
