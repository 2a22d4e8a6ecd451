// WorkClaimer: the worker-facing claim surface.
//
// Mediates between over-approximate hints and the authoritative claim
// transaction: routes claim requests to per-queue HintPollers (created
// lazily, destroyed on drain), attempts the claim for every hint it gets
// back, issues scoped credentials on success, and publishes the
// task-running notification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use workq_core::{
    derive_task_credentials, round_up_to_second, ClaimConfig, ClaimError, ClaimOutcome,
    ClaimResult, Hint, HintTransport, Publisher, Result, TaskRunningMessage, TaskStore,
};

use crate::hint_poller::{HintPoller, PollerFailure, PollerRegistry};

/// Claims work from hint queues on behalf of workers.
pub struct WorkClaimer {
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn HintTransport>,
    publisher: Arc<dyn Publisher>,
    config: ClaimConfig,
    pollers: PollerRegistry,
    failures: broadcast::Sender<PollerFailure>,
}

impl WorkClaimer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn HintTransport>,
        publisher: Arc<dyn Publisher>,
        config: ClaimConfig,
    ) -> Self {
        let (failures, _) = broadcast::channel(32);
        Self {
            store,
            transport,
            publisher,
            config,
            pollers: Arc::new(Mutex::new(HashMap::new())),
            failures,
        }
    }

    /// Subscribe to asynchronous poller failures for centralized logging.
    ///
    /// Failures are also delivered to every claim call that was pending on
    /// the failing poller; this channel exists so a supervisor can observe
    /// them without being in any caller's flow.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PollerFailure> {
        self.failures.subscribe()
    }

    /// Number of live hint pollers (drained pollers deregister themselves)
    pub async fn active_pollers(&self) -> usize {
        self.pollers.lock().await.len()
    }

    /// Claim up to `count` tasks from `task_queue_id`.
    ///
    /// Returns as soon as at least one claim succeeds rather than holding
    /// out for the full count: a worker that already has work should start
    /// it instead of waiting out a server crash with unstarted claims.
    /// Returns an empty vec if `aborted` fires before any claim succeeds.
    pub async fn claim(
        &self,
        task_queue_id: &str,
        worker_group: &str,
        worker_id: &str,
        count: usize,
        aborted: watch::Receiver<bool>,
    ) -> Result<Vec<ClaimResult>> {
        debug_assert!(count > 0, "claim requires count > 0");

        let mut claims = Vec::new();
        while claims.is_empty() && !*aborted.borrow() {
            // Single authoritative mutation point for the registry: lookup
            // and lazy create under one lock
            let poller = {
                let mut pollers = self.pollers.lock().await;
                pollers
                    .entry(task_queue_id.to_string())
                    .or_insert_with(|| {
                        HintPoller::new(
                            task_queue_id,
                            self.transport.clone(),
                            self.config.poll_backoff,
                            self.config.polls_per_queue,
                            self.pollers.clone(),
                            self.failures.clone(),
                        )
                    })
                    .clone()
            };

            let hints = match poller.request_claim(count, aborted.clone()).await {
                Ok(hints) => hints,
                // The poller drained and destroyed itself between registry
                // lookup and enqueue; the next iteration creates a fresh one
                Err(ClaimError::InvalidState(_)) => {
                    debug!(task_queue_id, "hint poller raced away, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            };

            // Attempt the authoritative claim for every hint concurrently;
            // one hint's failure never blocks its siblings
            let attempts = hints
                .into_iter()
                .map(|hint| self.claim_hint(hint, worker_group, worker_id));
            claims = join_all(attempts).await.into_iter().flatten().collect();
        }
        Ok(claims)
    }

    /// Claim one hint; returns None for any outcome but a successful claim.
    async fn claim_hint(
        &self,
        hint: Hint,
        worker_group: &str,
        worker_id: &str,
    ) -> Option<ClaimResult> {
        let started = Instant::now();
        let attempt = self
            .claim_task(hint.task_id, hint.run_id, worker_group, worker_id, hint.hint_id)
            .await;

        match attempt {
            Ok(outcome) => {
                debug!(
                    task_id = %hint.task_id,
                    run_id = hint.run_id,
                    outcome = outcome.label(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "claim attempt finished"
                );
                // The hint is consumed either way: a conflict or missing
                // task means it was stale, and redelivery won't change that
                let consumed = hint.clone();
                tokio::spawn(async move {
                    if let Err(err) = consumed.remove().await {
                        warn!(error = %err, "hint remove failed, ignored");
                    }
                });
                match outcome {
                    ClaimOutcome::Claimed(result) => Some(*result),
                    other => {
                        info!(
                            task_id = %hint.task_id,
                            run_id = hint.run_id,
                            outcome = other.label(),
                            "task no longer claimable"
                        );
                        None
                    }
                }
            }
            Err(err) => {
                error!(
                    task_id = %hint.task_id,
                    run_id = hint.run_id,
                    error = %err,
                    "claim from hint failed"
                );
                // Make the hint visible to other pollers again
                tokio::spawn(async move {
                    if let Err(err) = hint.release().await {
                        warn!(error = %err, "hint release failed, ignored");
                    }
                });
                None
            }
        }
    }

    /// Authoritatively claim `(task_id, run_id)` for a worker.
    ///
    /// The step ordering is load-bearing: the claim-expiry message goes
    /// into the transport *before* the claim transaction, so a crash right
    /// after the transaction leaves a claim whose expiry safety net already
    /// exists. The reverse order would risk a claim with no net. An expiry
    /// message for a claim that never took effect is ignored when it fires.
    pub async fn claim_task(
        &self,
        task_id: Uuid,
        run_id: u32,
        worker_group: &str,
        worker_id: &str,
        hint_id: Uuid,
    ) -> Result<ClaimOutcome> {
        let Some(pending) = self.store.get_task(task_id).await? else {
            return Ok(ClaimOutcome::TaskNotFound);
        };

        // Rounded up so the timestamp survives the transport's
        // second-granularity serialization unchanged
        let taken_until = round_up_to_second(
            Utc::now() + Duration::seconds(i64::from(self.config.claim_timeout)),
        );

        self.transport
            .put_claim_message(&pending.task_queue_id, task_id, run_id, taken_until)
            .await?;

        let Some(task) = self
            .store
            .claim_task(task_id, run_id, worker_group, worker_id, hint_id, taken_until)
            .await?
        else {
            return Ok(ClaimOutcome::TaskNotFound);
        };

        let Some(run) = task.run(run_id) else {
            return Ok(ClaimOutcome::RunNotFound);
        };

        // Not the current run, not running, or claimed under a different
        // identity: someone else won, or the hint was stale
        if !task.is_current_run(run_id) || !run.claimed_by(worker_group, worker_id, hint_id) {
            return Ok(ClaimOutcome::Conflict);
        }
        let Some(taken_until) = run.taken_until else {
            return Ok(ClaimOutcome::Conflict);
        };

        let status = task.status();
        let message = TaskRunningMessage {
            status: status.clone(),
            run_id,
            worker_group: worker_group.to_string(),
            worker_id: worker_id.to_string(),
            taken_until,
        };

        // Published even when this was a retry that changed nothing;
        // consumers must not miss a running message to de-duplication
        self.publisher.task_running(&message, &task.routes).await?;
        info!(task_id = %task_id, run_id, "task running");

        let credentials = derive_task_credentials(
            task_id,
            run_id,
            worker_group,
            worker_id,
            taken_until,
            &task.scopes,
            &self.config.root_credentials,
        );

        Ok(ClaimOutcome::Claimed(Box::new(ClaimResult {
            status,
            run_id,
            worker_group: worker_group.to_string(),
            worker_id: worker_id.to_string(),
            taken_until,
            task,
            credentials,
        })))
    }
}
