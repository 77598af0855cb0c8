use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use plume_model::{StepId, StepStatus, TaskId, TaskResult, TaskStatus};
use tokio::sync::watch;
use tracing::trace;

/// In-memory per-step bookkeeping of a backend scheduler.
///
/// Cheap to clone; clones share the same state. Every read is a consistent snapshot taken under a
/// single read lock, so queries are safe to issue while tasks execute.
#[derive(Clone)]
pub struct StepTable {
    inner: Arc<RwLock<StepTableInner>>,
    /// Bumped after every recorded result.
    completions: Arc<watch::Sender<u64>>,
}

struct StepTableInner {
    steps: HashMap<StepId, StepEntry>,
}

struct StepEntry {
    status: StepStatus,
    /// Status of every task submitted for the step.
    tasks: HashMap<TaskId, TaskStatus>,
    results: Vec<TaskResult>,
}

impl StepEntry {
    fn new(step_id: StepId) -> Self {
        Self {
            status: StepStatus::empty(step_id),
            tasks: HashMap::new(),
            results: Vec::new(),
        }
    }
}

impl StepTable {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(StepTableInner {
                steps: HashMap::new(),
            })),
            completions: Arc::new(tx),
        }
    }

    /// Register a submitted task.
    ///
    /// Returns `false` if the task is already known for this step.
    pub fn submitted(&self, step: &StepId, task: TaskId) -> bool {
        let mut inner = self.inner.write().unwrap();

        let entry = inner
            .steps
            .entry(step.clone())
            .or_insert_with(|| StepEntry::new(step.clone()));
        if entry.tasks.contains_key(&task) {
            return false;
        }
        entry.status.submitted += 1;
        entry.tasks.insert(task, TaskStatus::Pending);
        trace!(step = %step, task = %task, "task submitted");
        true
    }

    /// Mark a task as started.
    pub fn started(&self, step: &StepId, task: TaskId) {
        let mut inner = self.inner.write().unwrap();

        if let Some(entry) = inner.steps.get_mut(step)
            && let Some(status) = entry.tasks.get_mut(&task)
            && *status == TaskStatus::Pending
        {
            *status = TaskStatus::Running;
            entry.status.running += 1;
        }
    }

    /// Record the result of a task and wake up waiters.
    ///
    /// A task that finishes without having started (cancelled in the queue) is counted as started
    /// too, so `done <= running` keeps holding. A second result for the same task is ignored.
    pub fn finished(&self, result: TaskResult) {
        {
            let mut inner = self.inner.write().unwrap();

            let Some(entry) = inner.steps.get_mut(&result.step_id) else {
                return;
            };
            let Some(status) = entry.tasks.get_mut(&result.task_id) else {
                return;
            };
            if status.is_terminal() {
                return;
            }
            if *status == TaskStatus::Pending {
                entry.status.running += 1;
            }
            *status = if result.is_success() {
                TaskStatus::Succeeded
            } else {
                entry.status.failed += 1;
                TaskStatus::Failed
            };
            entry.status.done += 1;
            trace!(step = %result.step_id, task = %result.task_id, success = result.is_success(), "task finished");
            entry.results.push(result);
        }
        self.completions.send_modify(|n| *n += 1);
    }

    /// Counters for a step; all zero for an unknown step.
    pub fn status(&self, step: &StepId) -> StepStatus {
        let inner = self.inner.read().unwrap();
        inner
            .steps
            .get(step)
            .map(|e| e.status.clone())
            .unwrap_or_else(|| StepStatus::empty(step.clone()))
    }

    /// Results recorded so far for a step, in completion order.
    pub fn results(&self, step: &StepId) -> Vec<TaskResult> {
        let inner = self.inner.read().unwrap();
        inner
            .steps
            .get(step)
            .map(|e| e.results.clone())
            .unwrap_or_default()
    }

    pub fn task_status(&self, step: &StepId, task: TaskId) -> Option<TaskStatus> {
        let inner = self.inner.read().unwrap();
        inner.steps.get(step)?.tasks.get(&task).copied()
    }

    /// Steps known to this table.
    pub fn steps(&self) -> Vec<StepId> {
        let inner = self.inner.read().unwrap();
        inner.steps.keys().cloned().collect()
    }

    /// Wait until every task submitted so far for `step` has a result.
    pub async fn wait_done(&self, step: &StepId) {
        let mut rx = self.completions.subscribe();
        loop {
            if self.status(step).is_complete() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for StepTable {
    fn default() -> Self {
        Self::new()
    }
}
