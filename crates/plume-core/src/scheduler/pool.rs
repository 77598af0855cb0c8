use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use plume_model::{
    ScheduledTask, SchedulerState, Step, StepId, StepStatus, TaskContext, TaskResult, now_ms,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::PoolConfig, error::CoreError, lifecycle::Lifecycle, pool::PausablePool,
    runner::TaskExecution, scheduler::Scheduler, state::StepTable,
};

const DEFAULT_NAME: &str = "pool";

/// Runs tasks concurrently on a [`PausablePool`].
///
/// Generic over the execution strategy, so the same scheduler drives in-process tasks, external
/// processes and batch jobs.
pub struct PoolScheduler<E> {
    name: &'static str,
    lifecycle: Lifecycle,
    table: StepTable,
    pool: PausablePool,
    exec: Arc<E>,
    handle: OnceLock<Handle>,
    shutdown_timeout: Duration,
}

impl<E> PoolScheduler<E>
where
    E: TaskExecution,
{
    pub fn new(exec: E, config: &PoolConfig) -> Self {
        Self {
            name: DEFAULT_NAME,
            lifecycle: Lifecycle::new(DEFAULT_NAME),
            table: StepTable::new(),
            pool: PausablePool::new(config.threads),
            exec: Arc::new(exec),
            handle: OnceLock::new(),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Rename the backend (the name shows up in results and logs).
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self.lifecycle = Lifecycle::new(name);
        self
    }

    pub fn execution(&self) -> &E {
        &self.exec
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }
}

#[async_trait]
impl<E> Scheduler for PoolScheduler<E>
where
    E: TaskExecution,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> SchedulerState {
        self.lifecycle.state()
    }

    fn start(&self) -> Result<(), CoreError> {
        let handle = Handle::try_current().map_err(|e| CoreError::Runtime(e.to_string()))?;
        self.lifecycle.start()?;
        let _ = self.handle.set(handle);
        info!(scheduler = self.name, threads = self.pool.threads(), "scheduler started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        if !self.lifecycle.stop() {
            return Ok(());
        }
        let drained = self.pool.shutdown(self.shutdown_timeout).await;
        info!(scheduler = self.name, drained, "scheduler stopped");
        Ok(())
    }

    fn pause(&self) -> Result<(), CoreError> {
        self.lifecycle.pause()?;
        self.pool.pause();
        Ok(())
    }

    fn resume(&self) -> Result<(), CoreError> {
        self.lifecycle.resume()?;
        self.pool.resume();
        Ok(())
    }

    #[instrument(level = "debug", skip(self, step, task), fields(scheduler = self.name, step = %step.id, task = %task.id))]
    fn submit(&self, step: &Step, task: TaskContext) -> Result<(), CoreError> {
        self.lifecycle.check_submit()?;
        let handle = self.handle.get().ok_or(CoreError::NotStarted {
            scheduler: self.name,
        })?;

        let task = ScheduledTask::new(task, self.name);
        let id = task.id();
        if !self.table.submitted(&step.id, id) {
            return Err(CoreError::DuplicateTask {
                step: step.id.to_string(),
                task: id.get(),
            });
        }

        let name = self.name;
        let on_start = {
            let table = self.table.clone();
            let step_id = step.id.clone();
            move || table.started(&step_id, id)
        };
        let job = {
            let table = self.table.clone();
            let exec = Arc::clone(&self.exec);
            let step = step.clone();
            move |cancel: CancellationToken| async move {
                let result = exec.execute(&step, &task, cancel).await;
                table.finished(result);
            }
        };
        let on_cancel = {
            let table = self.table.clone();
            let step_id = step.id.clone();
            move || {
                debug!(scheduler = name, step = %step_id, task = %id, "task cancelled before start");
                table.finished(TaskResult::failure(
                    id,
                    step_id,
                    name,
                    "cancelled: scheduler stopped before the task started",
                    now_ms(),
                ));
            }
        };

        if !self.pool.spawn(handle, on_start, job, on_cancel) {
            warn!(scheduler = name, "pool already shut down; task rejected");
            self.table.finished(TaskResult::failure(
                id,
                step.id.clone(),
                name,
                "rejected: scheduler stopped",
                now_ms(),
            ));
            return Err(CoreError::Stopped { scheduler: name });
        }
        Ok(())
    }

    fn status(&self, step: &StepId) -> StepStatus {
        self.table.status(step)
    }

    fn results(&self, step: &StepId) -> Vec<TaskResult> {
        self.table.results(step)
    }

    async fn wait_end_of_tasks(&self, step: &StepId) {
        self.table.wait_done(step).await
    }
}
