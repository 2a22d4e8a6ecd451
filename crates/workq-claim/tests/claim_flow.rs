// Integration tests for the claim flow: WorkClaimer + HintPoller against
// the in-memory store and in-process transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use workq_claim::inprocess::{HintPriority, InProcessHintTransport, InProcessPublisher};
use workq_claim::WorkClaimer;
use workq_core::{
    ClaimConfig, ClaimError, ClaimOutcome, Hint, HintHandle, HintTransport, PendingQueue,
    Result, RootCredentials, Task, TaskStore,
};
use workq_storage::InMemoryTaskStore;

const QUEUE: &str = "proj/test-queue";

fn test_config() -> ClaimConfig {
    ClaimConfig::new(
        1200,
        RootCredentials {
            client_id: "queue-root".to_string(),
            access_token: "root-token".to_string(),
        },
    )
    .with_poll_backoff(Duration::from_millis(20))
}

fn claimer_with(
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn HintTransport>,
    publisher: InProcessPublisher,
) -> WorkClaimer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    WorkClaimer::new(store, transport, Arc::new(publisher), test_config())
}

async fn seed_task(store: &InMemoryTaskStore, scopes: Vec<String>) -> (Uuid, u32) {
    let mut task = Task::new(QUEUE, serde_json::json!({"cmd": "true"})).with_scopes(scopes);
    let run_id = task.schedule();
    let task_id = task.task_id;
    store.insert_task(task).await;
    (task_id, run_id)
}

fn abort_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Wait until the claimer has no live pollers, or fail after ~1s
async fn wait_for_drain(claimer: &WorkClaimer) {
    for _ in 0..100 {
        if claimer.active_pollers().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("poller did not drain");
}

#[tokio::test]
async fn test_claim_returns_claimed_task() {
    let store = InMemoryTaskStore::new();
    let transport = InProcessHintTransport::new();
    let publisher = InProcessPublisher::new();
    let (task_id, run_id) = seed_task(&store, vec!["secrets:get:proj".to_string()]).await;
    transport
        .put_hint(QUEUE, HintPriority::Normal, task_id, run_id)
        .await;

    let claimer = claimer_with(
        Arc::new(store),
        Arc::new(transport.clone()),
        publisher.clone(),
    );
    let (_abort_tx, aborted) = abort_signal();
    let claims = claimer
        .claim(QUEUE, "g1", "w1", 1, aborted)
        .await
        .unwrap();

    assert_eq!(claims.len(), 1);
    let claim = &claims[0];
    assert_eq!(claim.task.task_id, task_id);
    assert_eq!(claim.run_id, run_id);
    assert_eq!(claim.worker_group, "g1");
    assert_eq!(claim.worker_id, "w1");

    // taken_until is whole-second and in the future
    assert_eq!(claim.taken_until.timestamp_subsec_nanos(), 0);
    assert!(claim.taken_until > Utc::now());

    // Credentials are bounded by the claim and identify the worker
    assert_eq!(claim.credentials.expiry, claim.taken_until);
    assert!(claim.credentials.client_id.contains("w1"));

    // The running notification went out once, and the expiry message was
    // scheduled with the same timestamp the claim was taken with
    let published = publisher.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0.run_id, run_id);
    let messages = transport.claim_messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].taken_until, claim.taken_until);

    // The consumed hint is removed, not released
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.visible_hints(QUEUE).await, 0);

    wait_for_drain(&claimer).await;
}

#[tokio::test]
async fn test_claim_task_retry_is_idempotent_and_other_worker_conflicts() {
    let store = InMemoryTaskStore::new();
    let transport = InProcessHintTransport::new();
    let publisher = InProcessPublisher::new();
    let (task_id, run_id) = seed_task(&store, vec![]).await;

    let claimer = claimer_with(
        Arc::new(store),
        Arc::new(transport),
        publisher.clone(),
    );
    let hint_id = Uuid::now_v7();

    let ClaimOutcome::Claimed(first) = claimer
        .claim_task(task_id, run_id, "g1", "w1", hint_id)
        .await
        .unwrap()
    else {
        panic!("expected first claim to succeed");
    };

    // Same identity and hint: claimed again, identical taken_until
    let ClaimOutcome::Claimed(retry) = claimer
        .claim_task(task_id, run_id, "g1", "w1", hint_id)
        .await
        .unwrap()
    else {
        panic!("expected retried claim to succeed");
    };
    assert_eq!(retry.taken_until, first.taken_until);
    // Retried credentials cover the original window, never a longer one
    assert_eq!(retry.credentials.expiry, first.taken_until);

    // A different worker loses the race
    let other = claimer
        .claim_task(task_id, run_id, "g1", "w2", Uuid::now_v7())
        .await
        .unwrap();
    assert!(matches!(other, ClaimOutcome::Conflict));

    // Running is published on the retry too; consumers must not miss it
    assert_eq!(publisher.published().await.len(), 2);
}

#[tokio::test]
async fn test_claim_task_missing_task() {
    let store = InMemoryTaskStore::new();
    let transport = InProcessHintTransport::new();
    let claimer = claimer_with(
        Arc::new(store),
        Arc::new(transport.clone()),
        InProcessPublisher::new(),
    );

    let outcome = claimer
        .claim_task(Uuid::now_v7(), 0, "g1", "w1", Uuid::now_v7())
        .await
        .unwrap();

    assert!(matches!(outcome, ClaimOutcome::TaskNotFound));
    // No expiry message for a task that was never there
    assert!(transport.claim_messages().await.is_empty());
}

#[tokio::test]
async fn test_claim_task_run_not_found() {
    let store = InMemoryTaskStore::new();
    let task = Task::new(QUEUE, serde_json::json!({}));
    let task_id = task.task_id;
    store.insert_task(task).await;

    let claimer = claimer_with(
        Arc::new(store),
        Arc::new(InProcessHintTransport::new()),
        InProcessPublisher::new(),
    );

    let outcome = claimer
        .claim_task(task_id, 0, "g1", "w1", Uuid::now_v7())
        .await
        .unwrap();
    assert!(matches!(outcome, ClaimOutcome::RunNotFound));
}

#[tokio::test]
async fn test_stale_hints_are_filtered_and_removed() {
    let store = InMemoryTaskStore::new();
    let transport = InProcessHintTransport::new();

    // One task already claimed by someone else, one genuinely pending
    let (stale_id, stale_run) = seed_task(&store, vec![]).await;
    store
        .claim_task(
            stale_id,
            stale_run,
            "g9",
            "w9",
            Uuid::now_v7(),
            Utc::now() + chrono::Duration::seconds(600),
        )
        .await
        .unwrap();
    let (fresh_id, fresh_run) = seed_task(&store, vec![]).await;

    transport
        .put_hint(QUEUE, HintPriority::Normal, stale_id, stale_run)
        .await;
    transport
        .put_hint(QUEUE, HintPriority::Normal, fresh_id, fresh_run)
        .await;

    let claimer = claimer_with(
        Arc::new(store),
        Arc::new(transport.clone()),
        InProcessPublisher::new(),
    );
    let (_abort_tx, aborted) = abort_signal();
    let claims = claimer
        .claim(QUEUE, "g1", "w1", 2, aborted)
        .await
        .unwrap();

    // The conflict is swallowed; only the real claim comes back
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].task.task_id, fresh_id);

    // The stale hint was consumed (removed), not released for redelivery
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.visible_hints(QUEUE).await, 0);
}

#[tokio::test]
async fn test_claim_resolves_empty_on_abort() {
    let store = InMemoryTaskStore::new();
    let claimer = claimer_with(
        Arc::new(store),
        Arc::new(InProcessHintTransport::new()),
        InProcessPublisher::new(),
    );

    let claimer = Arc::new(claimer);
    let (abort_tx, aborted) = abort_signal();
    let call = {
        let claimer = claimer.clone();
        tokio::spawn(async move { claimer.claim(QUEUE, "g1", "w1", 3, aborted).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    abort_tx.send(true).unwrap();

    let claims = call.await.unwrap().unwrap();
    assert!(claims.is_empty());
    wait_for_drain(&claimer).await;
}

#[tokio::test]
async fn test_requests_satisfied_fifo() {
    let store = InMemoryTaskStore::new();
    let transport = InProcessHintTransport::new();
    let (first_id, _) = seed_task(&store, vec![]).await;
    let (second_id, _) = seed_task(&store, vec![]).await;

    let claimer = Arc::new(claimer_with(
        Arc::new(store),
        Arc::new(transport.clone()),
        InProcessPublisher::new(),
    ));

    let (_abort_tx, aborted) = abort_signal();
    let r1 = {
        let claimer = claimer.clone();
        let aborted = aborted.clone();
        tokio::spawn(async move { claimer.claim(QUEUE, "g1", "w1", 1, aborted).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let r2 = {
        let claimer = claimer.clone();
        tokio::spawn(async move { claimer.claim(QUEUE, "g1", "w2", 1, aborted).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Hints arrive in task order; the earlier request gets the earlier hint
    transport
        .put_hint(QUEUE, HintPriority::Normal, first_id, 0)
        .await;
    transport
        .put_hint(QUEUE, HintPriority::Normal, second_id, 0)
        .await;

    let first = r1.await.unwrap().unwrap();
    let second = r2.await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].task.task_id, first_id);
    assert_eq!(second[0].task.task_id, second_id);
}

#[tokio::test]
async fn test_high_priority_hints_claimed_first() {
    let store = InMemoryTaskStore::new();
    let transport = InProcessHintTransport::new();
    let (normal_id, _) = seed_task(&store, vec![]).await;
    let (high_id, _) = seed_task(&store, vec![]).await;

    transport
        .put_hint(QUEUE, HintPriority::Normal, normal_id, 0)
        .await;
    transport
        .put_hint(QUEUE, HintPriority::High, high_id, 0)
        .await;

    let claimer = claimer_with(
        Arc::new(store),
        Arc::new(transport),
        InProcessPublisher::new(),
    );
    let (_abort_tx, aborted) = abort_signal();
    let claims = claimer
        .claim(QUEUE, "g1", "w1", 2, aborted.clone())
        .await
        .unwrap();

    // The high-priority queue is drained first; its single hint satisfies
    // the request before the normal queue is even polled
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].task.task_id, high_id);

    // The normal hint is still there for the next call
    let claims = claimer.claim(QUEUE, "g1", "w1", 1, aborted).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].task.task_id, normal_id);
}

#[tokio::test]
async fn test_poller_destroyed_after_demand_drains() {
    let store = InMemoryTaskStore::new();
    let transport = InProcessHintTransport::new();
    let (task_id, run_id) = seed_task(&store, vec![]).await;
    transport
        .put_hint(QUEUE, HintPriority::Normal, task_id, run_id)
        .await;

    let claimer = claimer_with(
        Arc::new(store),
        Arc::new(transport),
        InProcessPublisher::new(),
    );
    let (_abort_tx, aborted) = abort_signal();
    let claims = claimer.claim(QUEUE, "g1", "w1", 1, aborted).await.unwrap();
    assert_eq!(claims.len(), 1);

    wait_for_drain(&claimer).await;
    assert_eq!(claimer.active_pollers().await, 0);
}

// ============================================================================
// Failure-path doubles
// ============================================================================

struct NoopHandle;

#[async_trait]
impl HintHandle for NoopHandle {
    async fn release(&self) -> Result<()> {
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        Ok(())
    }
}

/// Counts polls, comes up empty a fixed number of times, then delivers one
/// hint
struct DeliverAfterQueue {
    polls: Arc<AtomicUsize>,
    empty_polls: usize,
    hint: std::sync::Mutex<Option<Hint>>,
}

#[async_trait]
impl PendingQueue for DeliverAfterQueue {
    async fn poll(&self, _limit: usize) -> Result<Vec<Hint>> {
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        if seen < self.empty_polls {
            return Ok(Vec::new());
        }
        Ok(self.hint.lock().unwrap().take().into_iter().collect())
    }
}

/// Hands out its single queue on the first pending_queues call
struct OneShotTransport {
    queue: std::sync::Mutex<Option<Box<dyn PendingQueue>>>,
}

#[async_trait]
impl HintTransport for OneShotTransport {
    async fn pending_queues(&self, _task_queue_id: &str) -> Result<Vec<Box<dyn PendingQueue>>> {
        Ok(self.queue.lock().unwrap().take().into_iter().collect())
    }

    async fn put_claim_message(
        &self,
        _task_queue_id: &str,
        _task_id: Uuid,
        _run_id: u32,
        _taken_until: chrono::DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Transport whose polls always fail
struct BrokenTransport;

struct BrokenQueue;

#[async_trait]
impl PendingQueue for BrokenQueue {
    async fn poll(&self, _limit: usize) -> Result<Vec<Hint>> {
        Err(ClaimError::transport("connection reset"))
    }
}

#[async_trait]
impl HintTransport for BrokenTransport {
    async fn pending_queues(&self, _task_queue_id: &str) -> Result<Vec<Box<dyn PendingQueue>>> {
        Ok(vec![Box::new(BrokenQueue)])
    }

    async fn put_claim_message(
        &self,
        _task_queue_id: &str,
        _task_id: Uuid,
        _run_id: u32,
        _taken_until: chrono::DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Store whose claim transaction always fails (the task itself loads fine)
struct BrokenClaimStore {
    task: Task,
}

#[async_trait]
impl TaskStore for BrokenClaimStore {
    async fn get_task(&self, _task_id: Uuid) -> Result<Option<Task>> {
        Ok(Some(self.task.clone()))
    }

    async fn claim_task(
        &self,
        _task_id: Uuid,
        _run_id: u32,
        _worker_group: &str,
        _worker_id: &str,
        _hint_id: Uuid,
        _taken_until: chrono::DateTime<Utc>,
    ) -> Result<Option<Task>> {
        Err(ClaimError::store("claim transaction aborted"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_sleeps_once_per_empty_pass() {
    let store = InMemoryTaskStore::new();
    let (task_id, run_id) = seed_task(&store, vec![]).await;
    let polls = Arc::new(AtomicUsize::new(0));
    let hint = Hint::new(task_id, run_id, Uuid::now_v7(), Arc::new(NoopHandle));
    let claimer = claimer_with(
        Arc::new(store),
        Arc::new(OneShotTransport {
            queue: std::sync::Mutex::new(Some(Box::new(DeliverAfterQueue {
                polls: polls.clone(),
                empty_polls: 3,
                hint: std::sync::Mutex::new(Some(hint)),
            }))),
        }),
        InProcessPublisher::new(),
    );

    let (_abort_tx, aborted) = abort_signal();
    let start = tokio::time::Instant::now();
    let claims = claimer.claim(QUEUE, "g1", "w1", 1, aborted).await.unwrap();

    assert_eq!(claims.len(), 1);
    // One poll per empty pass plus the delivering one; no hot spinning
    assert_eq!(polls.load(Ordering::SeqCst), 4);
    // Each of the three empty passes slept the backoff interval exactly
    // once, and the delivering pass did not sleep at all
    assert_eq!(start.elapsed(), 3 * test_config().poll_backoff);
}

#[tokio::test]
async fn test_transport_failure_fails_callers_and_reaches_failure_channel() {
    let claimer = Arc::new(claimer_with(
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(BrokenTransport),
        InProcessPublisher::new(),
    ));
    let mut failures = claimer.subscribe_failures();

    let (_abort_tx, aborted) = abort_signal();
    let a = {
        let claimer = claimer.clone();
        let aborted = aborted.clone();
        tokio::spawn(async move { claimer.claim(QUEUE, "g1", "w1", 1, aborted).await })
    };
    let b = {
        let claimer = claimer.clone();
        tokio::spawn(async move { claimer.claim(QUEUE, "g1", "w2", 1, aborted).await })
    };

    // Every caller pending on the poller gets the same failure
    assert!(matches!(
        a.await.unwrap(),
        Err(ClaimError::Transport(_))
    ));
    assert!(matches!(
        b.await.unwrap(),
        Err(ClaimError::Transport(_))
    ));

    // And the owner observes it once, asynchronously
    let event = failures.recv().await.unwrap();
    assert_eq!(event.task_queue_id, QUEUE);
    assert!(matches!(event.error, ClaimError::Transport(_)));

    // The dead poller is gone; a later claim builds a fresh one
    wait_for_drain(&claimer).await;
}

#[tokio::test]
async fn test_expiry_message_enqueued_before_claim_transaction() {
    let mut task = Task::new(QUEUE, serde_json::json!({}));
    let run_id = task.schedule();
    let task_id = task.task_id;

    let transport = InProcessHintTransport::new();
    let claimer = claimer_with(
        Arc::new(BrokenClaimStore { task }),
        Arc::new(transport.clone()),
        InProcessPublisher::new(),
    );

    let err = claimer
        .claim_task(task_id, run_id, "g1", "w1", Uuid::now_v7())
        .await
        .unwrap_err();
    assert!(matches!(err, ClaimError::Store(_)));

    // The expiry safety net was scheduled even though the claim failed; it
    // will be ignored when it fires, which is the safe direction
    let messages = transport.claim_messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].task_id, task_id);
    assert_eq!(messages[0].run_id, run_id);
    assert_eq!(messages[0].task_queue_id, QUEUE);
}
