use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use plume_model::{
    ScheduledTask, SchedulerState, Step, StepId, StepStatus, TaskContext, TaskResult, now_ms,
};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::SequentialConfig, error::CoreError, lifecycle::Lifecycle, runner::TaskExecution,
    scheduler::Scheduler, state::StepTable,
};

const NAME: &str = "sequential";

/// Runs tasks one at a time, in submission order, on a single worker loop.
///
/// The loop checks the pause flag before every dequeue and sleeps `idle_poll` while the queue is
/// empty or the scheduler is paused.
pub struct SequentialScheduler<E> {
    inner: Arc<Inner<E>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner<E> {
    lifecycle: Lifecycle,
    table: StepTable,
    queue: Mutex<VecDeque<(Step, ScheduledTask)>>,
    exec: E,
    cancel: CancellationToken,
    idle_poll: Duration,
}

impl<E> SequentialScheduler<E>
where
    E: TaskExecution,
{
    pub fn new(exec: E, config: &SequentialConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle: Lifecycle::new(NAME),
                table: StepTable::new(),
                queue: Mutex::new(VecDeque::new()),
                exec,
                cancel: CancellationToken::new(),
                idle_poll: config.idle_poll,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Number of tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

impl<E> Inner<E>
where
    E: TaskExecution,
{
    async fn run(self: Arc<Self>) {
        debug!(scheduler = NAME, "worker loop started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let next = if self.lifecycle.is_paused() {
                None
            } else {
                self.queue.lock().unwrap().pop_front()
            };
            let Some((step, task)) = next else {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_poll) => {}
                }
                continue;
            };

            self.table.started(&step.id, task.id());
            trace!(scheduler = NAME, step = %step.id, task = %task.id(), "running task");
            let result = self
                .exec
                .execute(&step, &task, self.cancel.child_token())
                .await;
            self.table.finished(result);
        }
        debug!(scheduler = NAME, "worker loop exited");
    }
}

#[async_trait]
impl<E> Scheduler for SequentialScheduler<E>
where
    E: TaskExecution,
{
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> SchedulerState {
        self.inner.lifecycle.state()
    }

    fn start(&self) -> Result<(), CoreError> {
        let handle = Handle::try_current().map_err(|e| CoreError::Runtime(e.to_string()))?;
        self.inner.lifecycle.start()?;

        let worker = handle.spawn(Arc::clone(&self.inner).run());
        *self.worker.lock().unwrap() = Some(worker);
        info!(scheduler = NAME, "scheduler started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        if !self.inner.lifecycle.stop() {
            return Ok(());
        }
        self.inner.cancel.cancel();

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            warn!(scheduler = NAME, error = %e, "worker loop ended abnormally");
        }

        let pending: Vec<_> = self.inner.queue.lock().unwrap().drain(..).collect();
        let dropped = pending.len();
        for (step, task) in pending {
            self.inner.table.finished(TaskResult::failure(
                task.id(),
                step.id,
                NAME,
                "cancelled: scheduler stopped before the task started",
                now_ms(),
            ));
        }
        info!(scheduler = NAME, dropped, "scheduler stopped");
        Ok(())
    }

    fn pause(&self) -> Result<(), CoreError> {
        self.inner.lifecycle.pause()
    }

    fn resume(&self) -> Result<(), CoreError> {
        self.inner.lifecycle.resume()
    }

    fn submit(&self, step: &Step, task: TaskContext) -> Result<(), CoreError> {
        // State check and enqueue happen under the queue lock so `stop` drains every accepted task.
        let mut queue = self.inner.queue.lock().unwrap();
        self.inner.lifecycle.check_submit()?;

        let task = ScheduledTask::new(task, NAME);
        if !self.inner.table.submitted(&step.id, task.id()) {
            return Err(CoreError::DuplicateTask {
                step: step.id.to_string(),
                task: task.id().get(),
            });
        }
        queue.push_back((step.clone(), task));
        Ok(())
    }

    fn status(&self, step: &StepId) -> StepStatus {
        self.inner.table.status(step)
    }

    fn results(&self, step: &StepId) -> Vec<TaskResult> {
        self.inner.table.results(step)
    }

    async fn wait_end_of_tasks(&self, step: &StepId) {
        self.inner.table.wait_done(step).await
    }
}

#[cfg(test)]
mod tests {
    use plume_model::{TaskId, TaskOutput};

    use super::*;
    use crate::runner::InProcess;

    fn scheduler(
        runner: impl Fn(&TaskContext) -> Result<TaskOutput, String> + Send + Sync + 'static,
    ) -> SequentialScheduler<InProcess> {
        let config = SequentialConfig {
            idle_poll: Duration::from_millis(5),
        };
        SequentialScheduler::new(InProcess::new(Arc::new(runner)), &config)
    }

    fn ok(_: &TaskContext) -> Result<TaskOutput, String> {
        Ok(TaskOutput::default())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completion_order_matches_submission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let s = scheduler(move |t| {
            // later tasks are faster; order must still hold
            std::thread::sleep(Duration::from_millis(20 - t.id.get()));
            log.lock().unwrap().push(t.id.get());
            Ok(TaskOutput::default())
        });
        s.start().unwrap();

        let step = Step::new("s", "m");
        let order = [3, 1, 4, 15, 9, 2, 6, 5];
        for id in order {
            s.submit(&step, TaskContext::new(id, "s", "c")).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), s.wait_end_of_tasks(&step.id))
            .await
            .expect("queue should drain");

        assert_eq!(*seen.lock().unwrap(), order);
        let completed: Vec<_> = s.results(&step.id).iter().map(|r| r.task_id).collect();
        let expected: Vec<_> = order.iter().copied().map(TaskId::from).collect();
        assert_eq!(completed, expected);
        s.stop().await.unwrap();
    }

    #[tokio::test]
    async fn paused_queue_is_not_consumed() {
        let s = scheduler(ok);
        s.start().unwrap();
        s.pause().unwrap();

        let step = Step::new("s", "m");
        for id in 0..3 {
            s.submit(&step, TaskContext::new(id, "s", "c")).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.queued(), 3);
        assert_eq!(s.running_count(&step.id), 0);

        s.resume().unwrap();
        tokio::time::timeout(Duration::from_secs(5), s.wait_end_of_tasks(&step.id))
            .await
            .expect("queue should drain after resume");
        assert_eq!(s.done_count(&step.id), 3);
        s.stop().await.unwrap();
    }

    #[tokio::test]
    async fn submit_outside_started_states_fails() {
        let s = scheduler(ok);
        let step = Step::new("s", "m");

        let err = s.submit(&step, TaskContext::new(1, "s", "c")).unwrap_err();
        assert!(matches!(err, CoreError::NotStarted { .. }));

        s.start().unwrap();
        s.stop().await.unwrap();
        let err = s.submit(&step, TaskContext::new(1, "s", "c")).unwrap_err();
        assert!(matches!(err, CoreError::Stopped { .. }));
        assert!(matches!(s.start(), Err(CoreError::Stopped { .. })));
    }

    #[tokio::test]
    async fn stop_fails_queued_tasks() {
        let s = scheduler(ok);
        s.start().unwrap();
        s.pause().unwrap();

        let step = Step::new("s", "m");
        s.submit(&step, TaskContext::new(1, "s", "c")).unwrap();
        s.submit(&step, TaskContext::new(2, "s", "c")).unwrap();
        s.stop().await.unwrap();

        let status = s.status(&step.id);
        assert_eq!((status.done, status.failed), (2, 2));
        assert!(s.status(&step.id).is_complete());
    }

    #[tokio::test]
    async fn failing_task_does_not_stop_the_loop() {
        let s = scheduler(|t| {
            if t.id.get() == 1 {
                Err("boom".into())
            } else {
                Ok(TaskOutput::default())
            }
        });
        s.start().unwrap();

        let step = Step::new("s", "m");
        s.submit_all(
            &step,
            vec![TaskContext::new(1, "s", "c"), TaskContext::new(2, "s", "c")],
        )
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), s.wait_end_of_tasks(&step.id))
            .await
            .unwrap();

        let results = s.results(&step.id);
        assert_eq!(results[0].cause(), Some("boom"));
        assert!(results[1].is_success());
        s.stop().await.unwrap();
    }
}
