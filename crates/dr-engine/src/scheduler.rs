use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use dr_core::events::{AuditEntry, AuditKind};
use dr_core::sanitize::sanitize_goal;
use dr_core::types::{
    Budgets, RepoRef, Task, TaskSpec, TaskState, TaskStatus,
};
use dr_overlay::{SubscribeFrom, Subscription};

use crate::cancel::CancelToken;
use crate::driver::{EngineDeps, TaskDriver, TaskSlot};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid task spec: {0}")]
    InvalidSpec(String),
    #[error("task id already exists: {0}")]
    DuplicateId(String),
    #[error("unknown policy profile: {0}")]
    UnknownProfile(String),
    #[error("unknown acceptance predicate: {0}")]
    UnknownPredicate(String),
    #[error("no adapter coverage for mode {0}")]
    NoAdapterCoverage(String),
    #[error("audit store unavailable: {0}")]
    Audit(#[from] dr_audit::AuditError),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("overlay error: {0}")]
    Overlay(#[from] dr_overlay::OverlayError),
}

// ---------------------------------------------------------------------------
// Admission queue
// ---------------------------------------------------------------------------

struct QueueEntry {
    priority: i32,
    seq: u64,
    task_id: String,
    resume_from: TaskState,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap order: higher priority first, FIFO within a priority.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Inner {
    tasks: Mutex<HashMap<String, Arc<TaskSlot>>>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    queue_signal: Notify,
    gate: Arc<Semaphore>,
    shutdown: CancelToken,
    submit_counter: AtomicU64,
    drivers: Mutex<Vec<JoinHandle<TaskState>>>,
}

/// Owns task admission, lifetimes, concurrency bounds, cancellation
/// propagation, and graceful shutdown. One per process.
#[derive(Clone)]
pub struct Scheduler {
    deps: EngineDeps,
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(deps: EngineDeps) -> Self {
        let max = deps.config.engine.max_concurrent.max(1) as usize;
        Self {
            deps,
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                queue_signal: Notify::new(),
                gate: Arc::new(Semaphore::new(max)),
                shutdown: CancelToken::new(),
                submit_counter: AtomicU64::new(0),
                drivers: Mutex::new(Vec::new()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Validate and accept a task. The CREATED audit record is durable
    /// before this returns. Never blocks on capacity: at the concurrency
    /// ceiling the task simply queues in PENDING.
    pub fn submit(&self, spec: TaskSpec) -> Result<String, SubmitError> {
        let goal = sanitize_goal(spec.goal.trim());
        if goal.is_empty() {
            return Err(SubmitError::InvalidSpec("goal is empty".into()));
        }
        if spec.repo_url.trim().is_empty() {
            return Err(SubmitError::InvalidSpec("repo_url is empty".into()));
        }
        if spec.budgets.wall_time_secs == 0 {
            return Err(SubmitError::InvalidSpec("wall_time budget is zero".into()));
        }
        if spec.budgets.cost_usd < 0.0 {
            return Err(SubmitError::InvalidSpec("cost budget is negative".into()));
        }

        let profile = self
            .deps
            .config
            .profile(&spec.policy_profile)
            .ok_or_else(|| SubmitError::UnknownProfile(spec.policy_profile.clone()))?;

        if !self.deps.registry.covers(spec.mode, spec.deploy) {
            return Err(SubmitError::NoAdapterCoverage(format!("{:?}", spec.mode)));
        }
        self.deps
            .predicates
            .resolve(&spec.acceptance_criteria)
            .map_err(|e| SubmitError::UnknownPredicate(e.to_string()))?;

        let task_id = match &spec.id {
            Some(id) => {
                if self.known(id) {
                    return Err(SubmitError::DuplicateId(id.clone()));
                }
                id.clone()
            }
            None => Uuid::new_v4().to_string(),
        };

        let task = Task {
            id: task_id.clone(),
            goal,
            repo: RepoRef {
                url: spec.repo_url.clone(),
                branch: spec.branch.clone(),
                commit_sha: spec.commit_sha.clone().unwrap_or_default(),
            },
            mode: spec.mode,
            acceptance: spec.acceptance_criteria.clone(),
            profile: profile.name.clone(),
            profile_version: profile.version,
            budgets: spec.budgets,
            spent: Default::default(),
            deploy: spec.deploy,
            priority: spec.priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            terminal_at: None,
            terminal_reason: None,
        };

        let entry = AuditEntry::new(&task_id, AuditKind::TaskCreated)
            .with_payload(serde_json::to_value(&task).unwrap_or_default());
        self.deps.store.append(entry)?;

        self.enqueue(task, TaskState::Pending);
        info!(task_id = %task_id, "task submitted");
        Ok(task_id)
    }

    fn known(&self, task_id: &str) -> bool {
        if self
            .inner
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .contains_key(task_id)
        {
            return true;
        }
        self.deps
            .store
            .known_tasks()
            .map(|ids| ids.iter().any(|id| id == task_id))
            .unwrap_or(false)
    }

    fn enqueue(&self, task: Task, resume_from: TaskState) {
        let task_id = task.id.clone();
        let priority = task.priority;
        let slot = Arc::new(TaskSlot::new(task));
        self.inner
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .insert(task_id.clone(), slot);
        let seq = self
            .inner
            .submit_counter
            .fetch_add(1, AtomicOrdering::SeqCst);
        self.inner
            .queue
            .lock()
            .expect("queue lock poisoned")
            .push(QueueEntry {
                priority,
                seq,
                task_id,
                resume_from,
            });
        self.inner.queue_signal.notify_one();
    }

    // -----------------------------------------------------------------------
    // Admission loop
    // -----------------------------------------------------------------------

    /// Run admission until shutdown. Spawn this once.
    pub async fn run(&self) {
        info!(
            max_concurrent = self.deps.config.engine.max_concurrent,
            "scheduler admission loop starting"
        );
        loop {
            self.drain_queue().await;
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = self.inner.queue_signal.notified() => {}
            }
        }
        info!("scheduler admission loop stopped");
    }

    async fn drain_queue(&self) {
        loop {
            let entry = {
                let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
                queue.pop()
            };
            let Some(entry) = entry else { return };

            let slot = {
                let tasks = self.inner.tasks.lock().expect("tasks lock poisoned");
                tasks.get(&entry.task_id).cloned()
            };
            let Some(slot) = slot else { continue };

            // Stale entries (already terminal) are dropped silently.
            if slot.snapshot().status.is_terminal() {
                continue;
            }

            // Cancelled-before-admission tasks finalize without occupying
            // a concurrency slot.
            let permit = if slot.cancel.is_cancelled() {
                None
            } else {
                let permit = tokio::select! {
                    permit = Arc::clone(&self.inner.gate).acquire_owned() => permit,
                    _ = self.inner.shutdown.cancelled() => {
                        self.inner
                            .queue
                            .lock()
                            .expect("queue lock poisoned")
                            .push(entry);
                        return;
                    }
                };
                match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                }
            };

            let driver = TaskDriver::new(self.deps.clone(), Arc::clone(&slot), entry.resume_from);
            let task_id = entry.task_id.clone();
            let handle = tokio::spawn(async move {
                let state = driver.drive().await;
                drop(permit);
                state
            });
            info!(task_id = %task_id, "task admitted");
            self.inner
                .drivers
                .lock()
                .expect("drivers lock poisoned")
                .push(handle);
        }
    }

    // -----------------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------------

    /// Idempotent cancellation; only effective on non-terminal tasks.
    pub fn cancel(&self, task_id: &str, reason: impl Into<String>) -> Result<(), SchedulerError> {
        let slot = self
            .slot(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if slot.snapshot().status.is_terminal() {
            return Ok(());
        }
        slot.cancel.trigger(reason);
        // A still-queued task needs the admission loop to notice.
        self.inner.queue_signal.notify_one();
        Ok(())
    }

    /// Operator top-up for a SUSPENDED task: raise budgets and wake the
    /// driver.
    pub fn resume(&self, task_id: &str, extra: Budgets) -> Result<(), SchedulerError> {
        let slot = self
            .slot(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        slot.with_task(|t| {
            t.budgets.cost_usd += extra.cost_usd;
            t.budgets.max_iterations += extra.max_iterations;
            t.budgets.wall_time_secs += extra.wall_time_secs;
        });
        slot.resume.notify_one();
        Ok(())
    }

    pub fn status(&self, task_id: &str) -> Option<Task> {
        self.slot(task_id).map(|slot| slot.snapshot())
    }

    pub fn list(&self, filter: Option<TaskStatus>) -> Vec<Task> {
        let tasks = self.inner.tasks.lock().expect("tasks lock poisoned");
        let mut out: Vec<Task> = tasks
            .values()
            .map(|slot| slot.snapshot())
            .filter(|t| filter.map(|f| t.status == f).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn stream_overlay(
        &self,
        task_id: &str,
        from: SubscribeFrom,
    ) -> Result<Subscription, SchedulerError> {
        Ok(self.deps.broker.subscribe(task_id, from)?)
    }

    pub fn workspaces(&self) -> &Arc<dr_core::workspace::WorkspaceManager> {
        &self.deps.workspaces
    }

    fn slot(&self, task_id: &str) -> Option<Arc<TaskSlot>> {
        self.inner
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .get(task_id)
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop admitting, cancel everything still running, and wait (up to
    /// `grace` plus a drain allowance) for drivers to reach terminal
    /// states.
    pub async fn shutdown(&self, grace: Duration) {
        info!(?grace, "scheduler shutting down");
        self.inner.shutdown.trigger("shutdown");

        let slots: Vec<Arc<TaskSlot>> = {
            let tasks = self.inner.tasks.lock().expect("tasks lock poisoned");
            tasks.values().cloned().collect()
        };
        for slot in slots {
            if !slot.snapshot().status.is_terminal() {
                slot.cancel.trigger("shutdown");
            }
        }

        let handles: Vec<JoinHandle<TaskState>> = {
            let mut drivers = self.inner.drivers.lock().expect("drivers lock poisoned");
            drivers.drain(..).collect()
        };
        let drain = grace + Duration::from_secs(5);
        for handle in handles {
            match tokio::time::timeout(drain, handle).await {
                Ok(Ok(state)) => {
                    if !state.is_terminal() {
                        warn!(%state, "driver stopped in a non-terminal state");
                    }
                }
                Ok(Err(e)) => error!(error = %e, "driver panicked"),
                Err(_) => warn!("driver did not drain within the shutdown window"),
            }
        }
        info!("scheduler shutdown complete");
    }

    // -----------------------------------------------------------------------
    // Restart recovery
    // -----------------------------------------------------------------------

    /// Rebuild non-terminal tasks from the audit log and re-enqueue them at
    /// their latest durable state. Returns the recovered task ids.
    pub fn recover(&self) -> Vec<String> {
        let known = match self.deps.store.known_tasks() {
            Ok(known) => known,
            Err(e) => {
                error!(error = %e, "recovery scan failed");
                return Vec::new();
            }
        };

        let mut recovered = Vec::new();
        for task_id in known {
            if self.slot(&task_id).is_some() {
                continue;
            }
            let entries = match self.deps.store.scan(&task_id, 0) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(task_id, error = %e, "skipping unreadable audit log");
                    continue;
                }
            };

            let Some(mut task) = entries
                .iter()
                .find(|e| e.kind == AuditKind::TaskCreated)
                .and_then(|e| serde_json::from_value::<Task>(e.payload.clone()).ok())
            else {
                warn!(task_id, "no recoverable creation record");
                continue;
            };

            let latest = entries
                .iter()
                .rev()
                .find_map(|e| e.next_state)
                .unwrap_or(TaskState::Pending);
            if latest.is_terminal() {
                continue;
            }

            // Reconstruct spent dimensions from the persisted phase runs.
            let mut cost = 0.0;
            let mut iterations = 0;
            for entry in &entries {
                if entry.kind != AuditKind::PhaseRun {
                    continue;
                }
                if let Ok(run) =
                    serde_json::from_value::<dr_core::types::PhaseRun>(entry.payload.clone())
                {
                    cost += run.cost_usd;
                    if run.phase == dr_core::types::Phase::Code {
                        iterations += 1;
                    }
                }
            }
            task.spent.cost_usd = cost.min(task.budgets.cost_usd);
            task.spent.iterations = iterations.min(task.budgets.max_iterations);
            task.status = latest.status();

            info!(task_id = %task.id, state = %latest, "recovering task");
            recovered.push(task.id.clone());
            self.enqueue(task, latest);
        }
        recovered
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
