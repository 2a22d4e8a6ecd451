// HintPoller: converts an over-approximate hint stream into precise
// allocations against outstanding claim requests.
//
// One poller exists per task-queue id, owning a FIFO queue of claim
// requests and a single polling loop. The loop drains hint sources in
// priority order, hands hints to requests in the order they were enqueued,
// releases anything it cannot use, and backs off when a full pass over all
// sources comes up empty. A poller whose demand drains to zero destroys
// itself and disappears from its parent's registry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch, Mutex, MutexGuard};
use tracing::{debug, error, info};

use workq_core::{ClaimError, Hint, HintTransport, Result};

/// Registry of live pollers, shared with each poller so it can deregister
/// itself on destroy without a back-reference to the owner.
pub(crate) type PollerRegistry = Arc<Mutex<HashMap<String, Arc<HintPoller>>>>;

/// Asynchronous failure event emitted when a poll loop dies.
///
/// Delivered on the owner's broadcast channel for centralized logging; the
/// failure itself is also handed to every claim request that was pending.
#[derive(Debug, Clone)]
pub struct PollerFailure {
    pub task_queue_id: String,
    pub error: ClaimError,
}

/// One outstanding claim request
struct ClaimRequest {
    id: u64,
    count: usize,
    tx: oneshot::Sender<Result<Vec<Hint>>>,
}

#[derive(Default)]
struct PollerState {
    requests: VecDeque<ClaimRequest>,
    started: bool,
    destroyed: bool,
    next_request_id: u64,
}

fn outstanding_of(state: &PollerState) -> usize {
    state.requests.iter().map(|r| r.count).sum()
}

/// Polls hint sources for one task queue and satisfies claim requests FIFO.
pub struct HintPoller {
    task_queue_id: String,
    transport: Arc<dyn HintTransport>,
    poll_backoff: Duration,
    polls_per_queue: usize,
    registry: PollerRegistry,
    failures: broadcast::Sender<PollerFailure>,
    state: Mutex<PollerState>,
}

impl HintPoller {
    pub(crate) fn new(
        task_queue_id: impl Into<String>,
        transport: Arc<dyn HintTransport>,
        poll_backoff: Duration,
        polls_per_queue: usize,
        registry: PollerRegistry,
        failures: broadcast::Sender<PollerFailure>,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_queue_id: task_queue_id.into(),
            transport,
            poll_backoff,
            polls_per_queue,
            registry,
            failures,
            state: Mutex::new(PollerState::default()),
        })
    }

    /// Request up to `count` hints.
    ///
    /// Resolves with 0..=count hints once the poll loop assigns them, with
    /// an empty vec if `aborted` fires first, or with the loop's error if
    /// polling fails. Requesting on a destroyed poller is an InvalidState
    /// error.
    pub async fn request_claim(
        self: &Arc<Self>,
        count: usize,
        aborted: watch::Receiver<bool>,
    ) -> Result<Vec<Hint>> {
        debug_assert!(count > 0, "request_claim requires count > 0");

        let (tx, mut rx) = oneshot::channel();
        let request_id = {
            let mut state = self.state.lock().await;
            if state.destroyed {
                return Err(ClaimError::invalid_state(
                    "claim requested on a destroyed hint poller",
                ));
            }
            let id = state.next_request_id;
            state.next_request_id += 1;
            state.requests.push_back(ClaimRequest { id, count, tx });
            self.start(&mut state);
            id
        };

        tokio::select! {
            outcome = &mut rx => match outcome {
                Ok(result) => result,
                // Sender dropped without an answer; treat as an empty grant
                Err(_) => Ok(Vec::new()),
            },
            _ = cancelled(aborted) => {
                // Close first: from here on a delivery attempt fails and the
                // loop re-assigns the hints. A delivery that beat the close
                // is drained below so the hints are not dropped unseen.
                rx.close();
                self.remove_request(request_id).await;
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Ok(Vec::new()),
                }
            }
        }
    }

    /// Idempotent poll-loop activation; at most one loop runs per poller.
    fn start(self: &Arc<Self>, state: &mut MutexGuard<'_, PollerState>) {
        if !state.started {
            state.started = true;
            let poller = Arc::clone(self);
            tokio::spawn(async move {
                poller.run().await;
            });
        }
    }

    async fn run(self: Arc<Self>) {
        if let Err(err) = self.poll_loop().await {
            error!(
                task_queue_id = %self.task_queue_id,
                error = %err,
                "hint poll loop failed"
            );
            self.fail_all(err).await;
        }
    }

    async fn poll_loop(&self) -> Result<()> {
        // Poll sources for this queue, ordered by descending priority
        let queues = self.transport.pending_queues(&self.task_queue_id).await?;

        loop {
            while self.outstanding().await > 0 {
                let mut claimed = 0usize;
                let mut released = 0usize;

                for queue in &queues {
                    // Bounded per source per pass so one busy queue cannot
                    // starve lower-priority ones
                    for _ in 0..self.polls_per_queue {
                        let limit = self.outstanding().await;
                        if limit == 0 {
                            break;
                        }
                        let hints = queue.poll(limit).await?;
                        if hints.is_empty() {
                            break;
                        }
                        claimed += hints.len();
                        released += self.assign(hints).await?;
                    }
                }

                // Nothing claimed across a full pass: back off before
                // re-evaluating demand
                let slept = claimed == 0;
                if slept {
                    tokio::time::sleep(self.poll_backoff).await;
                }
                info!(
                    task_queue_id = %self.task_queue_id,
                    claimed,
                    released,
                    slept,
                    "hint poller pass"
                );
            }

            // No more demand; destroy unless a request raced in
            match self.destroy().await {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    /// Hand hints to requests in FIFO order; release what nobody wants.
    ///
    /// Returns the number of hints released. A request cancelled between
    /// dequeue and delivery gives its hints to the next request in line
    /// rather than leaking them back through the visibility timeout.
    async fn assign(&self, hints: Vec<Hint>) -> Result<usize> {
        let mut hints = VecDeque::from(hints);

        {
            let mut state = self.state.lock().await;
            while !hints.is_empty() {
                let Some(request) = state.requests.pop_front() else {
                    break;
                };
                let take = request.count.min(hints.len());
                let grant: Vec<Hint> = hints.drain(..take).collect();
                if let Err(Ok(grant)) = request.tx.send(Ok(grant)) {
                    debug!(
                        task_queue_id = %self.task_queue_id,
                        request_id = request.id,
                        "request gone before delivery, re-assigning hints"
                    );
                    for hint in grant.into_iter().rev() {
                        hints.push_front(hint);
                    }
                }
            }
        }

        // Surplus hints: momentarily more supply than demand. Release them
        // outside the state lock. (This shouldn't happen often!)
        let released = hints.len();
        for hint in hints {
            hint.release().await?;
        }
        Ok(released)
    }

    async fn outstanding(&self) -> usize {
        outstanding_of(&*self.state.lock().await)
    }

    /// Drop a request from the queue; no-op if it was already satisfied.
    async fn remove_request(&self, request_id: u64) {
        let mut state = self.state.lock().await;
        state.requests.retain(|request| request.id != request_id);
    }

    /// Destroy the poller and deregister it from the parent registry.
    ///
    /// Rejected with InvalidState while demand is outstanding; the caller
    /// (the poll loop) treats that as "new demand raced in, keep polling".
    pub(crate) async fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if outstanding_of(&state) > 0 {
                return Err(ClaimError::invalid_state(
                    "refusing to destroy a hint poller with outstanding demand",
                ));
            }
            state.destroyed = true;
        }
        self.registry.lock().await.remove(&self.task_queue_id);
        debug!(task_queue_id = %self.task_queue_id, "hint poller destroyed");
        Ok(())
    }

    /// Fail every pending request with `err`, destroy the poller, and emit
    /// one failure event to the owner's channel.
    async fn fail_all(&self, err: ClaimError) {
        let requests = {
            let mut state = self.state.lock().await;
            state.started = false;
            state.destroyed = true;
            std::mem::take(&mut state.requests)
        };
        self.registry.lock().await.remove(&self.task_queue_id);

        for request in requests {
            let _ = request.tx.send(Err(err.clone()));
        }
        let _ = self.failures.send(PollerFailure {
            task_queue_id: self.task_queue_id.clone(),
            error: err,
        });
    }
}

/// Resolve when the cancellation signal fires.
///
/// A dropped sender means "never cancelled", not "cancelled": the future
/// then stays pending forever.
pub(crate) async fn cancelled(mut aborted: watch::Receiver<bool>) {
    loop {
        if *aborted.borrow() {
            return;
        }
        if aborted.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
