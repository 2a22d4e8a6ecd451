// Work-Claiming Core
//
// This crate implements the protocol by which workers obtain exclusive,
// time-bounded ownership of pending tasks:
// - HintPoller: one per task queue, turns the over-approximate hint stream
//   into FIFO allocations against outstanding claim requests
// - WorkClaimer: the worker-facing surface; runs the authoritative claim
//   transaction per hint, derives credentials, publishes task-running
//
// Key design decisions:
// - The claim-expiry message is enqueued before the claim transaction runs,
//   so a crash between the two steps leaves nothing worse than an expiry
//   message that gets ignored
// - Per-hint claim attempts run concurrently and fail independently;
//   release/remove of hints are fire-and-forget with logged errors
// - Poller failures reach the owner on a broadcast channel instead of any
//   individual caller's flow

pub mod hint_poller;
pub mod inprocess;
pub mod work_claimer;

pub use hint_poller::{HintPoller, PollerFailure};
pub use work_claimer::WorkClaimer;
