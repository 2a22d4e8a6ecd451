// In-process hint transport and publisher
//
// Single-process stand-ins for the broker-backed collaborators, with the
// semantics the claimer depends on: at-least-once delivery, visibility
// timeout on polled hints, idempotent release/remove, and priority-ordered
// pending queues. Doubles as the integration-test harness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use workq_core::{
    ClaimMessage, Hint, HintHandle, HintTransport, PendingQueue, Publisher, Result,
    TaskRunningMessage,
};

/// Priority level of an in-process pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintPriority {
    High,
    Normal,
}

enum SlotState {
    Visible,
    Invisible { until: DateTime<Utc> },
    Removed,
}

/// One hint message held by the transport
struct Slot {
    task_id: Uuid,
    run_id: u32,
    hint_id: Uuid,
    state: Mutex<SlotState>,
}

impl Slot {
    async fn deliverable(&self, now: DateTime<Utc>) -> bool {
        match *self.state.lock().await {
            SlotState::Visible => true,
            SlotState::Invisible { until } => until <= now,
            SlotState::Removed => false,
        }
    }
}

/// Handle given out with each delivered hint
struct SlotHandle {
    slot: Arc<Slot>,
}

#[async_trait]
impl HintHandle for SlotHandle {
    async fn release(&self) -> Result<()> {
        let mut state = self.slot.state.lock().await;
        // Releasing a removed hint is a tolerated no-op
        if !matches!(*state, SlotState::Removed) {
            *state = SlotState::Visible;
        }
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        *self.slot.state.lock().await = SlotState::Removed;
        Ok(())
    }
}

#[derive(Default)]
struct SlotQueue {
    slots: Mutex<Vec<Arc<Slot>>>,
}

/// Poll view of one priority level
struct InProcessQueue {
    queue: Arc<SlotQueue>,
    visibility: Duration,
    /// Expired claim messages feed back in through the normal-priority
    /// queue; the high-priority view carries no feed
    expired_claims: Option<ExpiredClaimFeed>,
}

struct ExpiredClaimFeed {
    inner: Arc<TransportInner>,
    task_queue_id: String,
}

#[async_trait]
impl PendingQueue for InProcessQueue {
    async fn poll(&self, limit: usize) -> Result<Vec<Hint>> {
        if let Some(feed) = &self.expired_claims {
            feed.inner
                .materialize_expired(&feed.task_queue_id, &self.queue)
                .await;
        }
        let slots = self.queue.slots.lock().await.clone();
        let now = Utc::now();
        let mut hints = Vec::new();

        for slot in slots {
            if hints.len() == limit {
                break;
            }
            if slot.deliverable(now).await {
                *slot.state.lock().await = SlotState::Invisible {
                    until: now
                        + chrono::Duration::from_std(self.visibility)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30)),
                };
                hints.push(Hint::new(
                    slot.task_id,
                    slot.run_id,
                    slot.hint_id,
                    Arc::new(SlotHandle { slot: slot.clone() }),
                ));
            }
        }
        Ok(hints)
    }
}

struct ClaimEntry {
    message: ClaimMessage,
    expired: bool,
}

struct TransportInner {
    visibility: Duration,
    queues: Mutex<HashMap<String, [Arc<SlotQueue>; 2]>>,
    claim_messages: Mutex<Vec<ClaimEntry>>,
}

impl TransportInner {
    /// Turn claim messages whose taken_until has passed into fresh hints on
    /// the given queue. Each message materializes at most once.
    async fn materialize_expired(&self, task_queue_id: &str, queue: &SlotQueue) {
        let now = Utc::now();
        let mut slots = Vec::new();
        {
            let mut entries = self.claim_messages.lock().await;
            for entry in entries.iter_mut() {
                if !entry.expired
                    && entry.message.task_queue_id == task_queue_id
                    && entry.message.taken_until <= now
                {
                    entry.expired = true;
                    slots.push(Arc::new(Slot {
                        task_id: entry.message.task_id,
                        run_id: entry.message.run_id,
                        hint_id: Uuid::now_v7(),
                        state: Mutex::new(SlotState::Visible),
                    }));
                }
            }
        }
        if !slots.is_empty() {
            queue.slots.lock().await.extend(slots);
        }
    }
}

/// In-process implementation of the hint transport
#[derive(Clone)]
pub struct InProcessHintTransport {
    inner: Arc<TransportInner>,
}

impl Default for InProcessHintTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessHintTransport {
    pub fn new() -> Self {
        Self::with_visibility(Duration::from_secs(30))
    }

    /// Use a custom visibility timeout for polled hints
    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                visibility,
                queues: Mutex::new(HashMap::new()),
                claim_messages: Mutex::new(Vec::new()),
            }),
        }
    }

    async fn queue_pair(&self, task_queue_id: &str) -> [Arc<SlotQueue>; 2] {
        let mut queues = self.inner.queues.lock().await;
        queues
            .entry(task_queue_id.to_string())
            .or_insert_with(|| [Arc::new(SlotQueue::default()), Arc::new(SlotQueue::default())])
            .clone()
    }

    /// Enqueue a hint for a task/run, returning its hint id
    pub async fn put_hint(
        &self,
        task_queue_id: &str,
        priority: HintPriority,
        task_id: Uuid,
        run_id: u32,
    ) -> Uuid {
        let hint_id = Uuid::now_v7();
        let pair = self.queue_pair(task_queue_id).await;
        let queue = match priority {
            HintPriority::High => &pair[0],
            HintPriority::Normal => &pair[1],
        };
        queue.slots.lock().await.push(Arc::new(Slot {
            task_id,
            run_id,
            hint_id,
            state: Mutex::new(SlotState::Visible),
        }));
        hint_id
    }

    /// Claim-expiry messages scheduled so far, in enqueue order (including
    /// those already redelivered as hints)
    pub async fn claim_messages(&self) -> Vec<ClaimMessage> {
        self.inner
            .claim_messages
            .lock()
            .await
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    /// Number of hints a poll could deliver right now, across priorities
    pub async fn visible_hints(&self, task_queue_id: &str) -> usize {
        let pair = self.queue_pair(task_queue_id).await;
        let now = Utc::now();
        let mut visible = 0;
        for queue in &pair {
            for slot in queue.slots.lock().await.iter() {
                if slot.deliverable(now).await {
                    visible += 1;
                }
            }
        }
        visible
    }
}

#[async_trait]
impl HintTransport for InProcessHintTransport {
    async fn pending_queues(&self, task_queue_id: &str) -> Result<Vec<Box<dyn PendingQueue>>> {
        let [high, normal] = self.queue_pair(task_queue_id).await;
        let visibility = self.inner.visibility;
        Ok(vec![
            Box::new(InProcessQueue {
                queue: high,
                visibility,
                expired_claims: None,
            }),
            Box::new(InProcessQueue {
                queue: normal,
                visibility,
                expired_claims: Some(ExpiredClaimFeed {
                    inner: self.inner.clone(),
                    task_queue_id: task_queue_id.to_string(),
                }),
            }),
        ])
    }

    async fn put_claim_message(
        &self,
        task_queue_id: &str,
        task_id: Uuid,
        run_id: u32,
        taken_until: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.claim_messages.lock().await.push(ClaimEntry {
            message: ClaimMessage {
                task_queue_id: task_queue_id.to_string(),
                task_id,
                run_id,
                taken_until,
            },
            expired: false,
        });
        Ok(())
    }
}

/// Publisher that captures task-running messages for inspection
#[derive(Clone, Default)]
pub struct InProcessPublisher {
    messages: Arc<Mutex<Vec<(TaskRunningMessage, Vec<String>)>>>,
}

impl InProcessPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in publish order
    pub async fn published(&self) -> Vec<(TaskRunningMessage, Vec<String>)> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for InProcessPublisher {
    async fn task_running(&self, message: &TaskRunningMessage, routes: &[String]) -> Result<()> {
        self.messages
            .lock()
            .await
            .push((message.clone(), routes.to_vec()));
        Ok(())
    }
}
