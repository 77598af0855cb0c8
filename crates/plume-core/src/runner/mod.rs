use std::sync::Arc;

use async_trait::async_trait;
use plume_model::{ScheduledTask, Step, TaskContext, TaskOutput, TaskResult, now_ms};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Step-side code executing one task descriptor.
///
/// Implemented by the step catalogue; blocking by nature (steps are CPU and I/O heavy).
pub trait TaskRunner: Send + Sync + 'static {
    fn run(&self, task: &TaskContext) -> Result<TaskOutput, String>;
}

impl<F> TaskRunner for F
where
    F: Fn(&TaskContext) -> Result<TaskOutput, String> + Send + Sync + 'static,
{
    fn run(&self, task: &TaskContext) -> Result<TaskOutput, String> {
        self(task)
    }
}

/// How a backend scheduler turns a task into a result.
///
/// Implementations never fail: every problem is reported as a failure `TaskResult`.
/// `cancel` fires when the owning scheduler stops.
#[async_trait]
pub trait TaskExecution: Send + Sync + 'static {
    async fn execute(&self, step: &Step, task: &ScheduledTask, cancel: CancellationToken)
    -> TaskResult;
}

/// Runs tasks inside the current process, on the blocking thread pool.
pub struct InProcess {
    runner: Arc<dyn TaskRunner>,
}

impl InProcess {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TaskExecution for InProcess {
    #[instrument(level = "debug", skip_all, fields(step = %step.id, task = %task.id()))]
    async fn execute(
        &self,
        step: &Step,
        task: &ScheduledTask,
        cancel: CancellationToken,
    ) -> TaskResult {
        let started_at = now_ms();
        let runner = Arc::clone(&self.runner);
        let ctx = task.context.clone();
        let handle = tokio::task::spawn_blocking(move || runner.run(&ctx));

        let id = task.id();
        let step_id = step.id.clone();
        tokio::select! {
            joined = handle => match joined {
                Ok(Ok(output)) => TaskResult::success(id, step_id, &task.backend, output, started_at),
                Ok(Err(cause)) => TaskResult::failure(id, step_id, &task.backend, cause, started_at),
                Err(e) if e.is_panic() => {
                    TaskResult::failure(id, step_id, &task.backend, format!("task panicked: {e}"), started_at)
                }
                Err(e) => TaskResult::failure(id, step_id, &task.backend, format!("task aborted: {e}"), started_at),
            },
            _ = cancel.cancelled() => {
                // The blocking closure cannot be interrupted; it finishes in the background.
                debug!("cancelled while running");
                TaskResult::failure(id, step_id, &task.backend, "cancelled: scheduler stopped", started_at)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(
        f: impl Fn(&TaskContext) -> Result<TaskOutput, String> + Send + Sync + 'static,
    ) -> Arc<dyn TaskRunner> {
        Arc::new(f)
    }

    fn scheduled(id: u64) -> (Step, ScheduledTask) {
        let step = Step::new("s", "test");
        let task = ScheduledTask::new(TaskContext::new(id, "s", "ctx"), "pool");
        (step, task)
    }

    #[tokio::test]
    async fn success_carries_output() {
        let exec = InProcess::new(runner(|t| {
            Ok(TaskOutput {
                data: serde_json::json!({"id": t.id.get()}),
                ..Default::default()
            })
        }));
        let (step, task) = scheduled(4);

        let result = exec.execute(&step, &task, CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(result.data, serde_json::json!({"id": 4}));
        assert_eq!(result.backend, "pool");
    }

    #[tokio::test]
    async fn runner_error_becomes_failure() {
        let exec = InProcess::new(runner(|_| Err("bad input".to_string())));
        let (step, task) = scheduled(1);

        let result = exec.execute(&step, &task, CancellationToken::new()).await;
        assert_eq!(result.cause(), Some("bad input"));
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let exec = InProcess::new(runner(|_| panic!("step exploded")));
        let (step, task) = scheduled(1);

        let result = exec.execute(&step, &task, CancellationToken::new()).await;
        assert!(result.cause().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn cancelled_token_reports_failure() {
        let exec = InProcess::new(runner(|_| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            Ok(TaskOutput::default())
        }));
        let (step, task) = scheduled(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = exec.execute(&step, &task, cancel).await;
        assert!(result.cause().unwrap().starts_with("cancelled"));
    }
}
