// Task and run domain types
//
// A task carries an append-only list of runs; only the last run can ever be
// claimed. The claim transaction is arbitrated by the task store, but the
// rule it applies (`Task::apply_claim`) is defined here so the Postgres and
// in-memory backends agree bit-for-bit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
}

/// Overall task state, derived from the last run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Unscheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
}

/// A single execution attempt of a task.
///
/// `worker_group` / `worker_id` / `hint_id` identify the claimant once the
/// run is running; `taken_until` bounds the claim in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub state: RunState,
    pub reason_created: String,
    #[serde(default)]
    pub worker_group: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub hint_id: Option<Uuid>,
    #[serde(default)]
    pub taken_until: Option<DateTime<Utc>>,
    pub scheduled: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a fresh pending run
    pub fn pending(reason_created: impl Into<String>) -> Self {
        Self {
            state: RunState::Pending,
            reason_created: reason_created.into(),
            worker_group: None,
            worker_id: None,
            hint_id: None,
            taken_until: None,
            scheduled: Utc::now(),
            started: None,
            resolved: None,
        }
    }

    /// Whether this run is claimed by exactly this identity
    pub fn claimed_by(&self, worker_group: &str, worker_id: &str, hint_id: Uuid) -> bool {
        self.state == RunState::Running
            && self.worker_group.as_deref() == Some(worker_group)
            && self.worker_id.as_deref() == Some(worker_id)
            && self.hint_id == Some(hint_id)
    }
}

/// A task in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub task_queue_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub routes: Vec<String>,
    pub retries_left: u32,
    pub created: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub runs: Vec<Run>,
}

impl Task {
    /// Create a task on the given queue with default lifetimes
    pub fn new(task_queue_id: impl Into<String>, payload: serde_json::Value) -> Self {
        let created = Utc::now();
        Self {
            task_id: Uuid::now_v7(),
            task_queue_id: task_queue_id.into(),
            scopes: Vec::new(),
            routes: Vec::new(),
            retries_left: 5,
            created,
            deadline: created + Duration::days(1),
            expires: created + Duration::days(365),
            payload,
            runs: Vec::new(),
        }
    }

    /// Set the scopes granted to whoever runs the task
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Set the notification routes
    pub fn with_routes(mut self, routes: Vec<String>) -> Self {
        self.routes = routes;
        self
    }

    /// Append a pending run, returning its run id
    pub fn schedule(&mut self) -> u32 {
        self.runs.push(Run::pending("scheduled"));
        (self.runs.len() - 1) as u32
    }

    /// Look up a run by id
    pub fn run(&self, run_id: u32) -> Option<&Run> {
        self.runs.get(run_id as usize)
    }

    /// Whether `run_id` refers to the task's current (last) run
    pub fn is_current_run(&self, run_id: u32) -> bool {
        !self.runs.is_empty() && (self.runs.len() - 1) as u32 == run_id
    }

    /// Derived task state
    pub fn state(&self) -> TaskState {
        match self.runs.last().map(|run| run.state) {
            None => TaskState::Unscheduled,
            Some(RunState::Pending) => TaskState::Pending,
            Some(RunState::Running) => TaskState::Running,
            Some(RunState::Completed) => TaskState::Completed,
            Some(RunState::Failed) => TaskState::Failed,
            Some(RunState::Exception) => TaskState::Exception,
        }
    }

    /// The claim-transaction rule.
    ///
    /// Claims the run only when it is the current run and still pending.
    /// A run already running under the same (worker_group, worker_id,
    /// hint_id) triple is left untouched so that a retried claim returns the
    /// originally stored `taken_until`. Any other situation is left for the
    /// caller to classify as a conflict by inspecting the run afterwards.
    pub fn apply_claim(
        &mut self,
        run_id: u32,
        worker_group: &str,
        worker_id: &str,
        hint_id: Uuid,
        taken_until: DateTime<Utc>,
    ) {
        let current = self.is_current_run(run_id);
        let Some(run) = self.runs.get_mut(run_id as usize) else {
            return;
        };
        if current && run.state == RunState::Pending {
            run.state = RunState::Running;
            run.worker_group = Some(worker_group.to_string());
            run.worker_id = Some(worker_id.to_string());
            run.hint_id = Some(hint_id);
            run.taken_until = Some(taken_until);
            run.started = Some(Utc::now());
        }
    }

    /// Serializable status view used in notifications and claim results
    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            task_id: self.task_id,
            task_queue_id: self.task_queue_id.clone(),
            state: self.state(),
            retries_left: self.retries_left,
            runs: self
                .runs
                .iter()
                .enumerate()
                .map(|(run_id, run)| RunSummary {
                    run_id: run_id as u32,
                    state: run.state,
                    reason_created: run.reason_created.clone(),
                    worker_group: run.worker_group.clone(),
                    worker_id: run.worker_id.clone(),
                    taken_until: run.taken_until,
                })
                .collect(),
        }
    }
}

/// Status view of a task (what notification consumers see)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub task_queue_id: String,
    pub state: TaskState,
    pub retries_left: u32,
    pub runs: Vec<RunSummary>,
}

/// Per-run slice of a task status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: u32,
    pub state: RunState,
    pub reason_created: String,
    pub worker_group: Option<String>,
    pub worker_id: Option<String>,
    pub taken_until: Option<DateTime<Utc>>,
}
