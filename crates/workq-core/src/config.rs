// Claimer configuration
//
// Defaults match production behavior: 1s poll backoff, 10 polls per queue
// per pass. Tests compress the backoff to keep wall time down.

use std::time::Duration;

use crate::creds::RootCredentials;

/// Configuration for the work claimer
#[derive(Debug, Clone)]
pub struct ClaimConfig {
    /// How long a claim lasts, in seconds
    pub claim_timeout: u32,

    /// Sleep between poll passes that claimed nothing
    pub poll_backoff: Duration,

    /// Upper bound on consecutive polls against one queue within a pass,
    /// so lower-priority queues are never starved
    pub polls_per_queue: usize,

    /// Root credentials that derived work credentials are scoped down from
    pub root_credentials: RootCredentials,
}

impl ClaimConfig {
    pub fn new(claim_timeout: u32, root_credentials: RootCredentials) -> Self {
        Self {
            claim_timeout,
            poll_backoff: Duration::from_secs(1),
            polls_per_queue: 10,
            root_credentials,
        }
    }

    /// Override the empty-pass backoff interval
    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Override the per-queue poll bound
    pub fn with_polls_per_queue(mut self, polls: usize) -> Self {
        self.polls_per_queue = polls;
        self
    }
}
