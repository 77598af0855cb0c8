mod pool;
pub use pool::PoolScheduler;

mod sequential;
pub use sequential::SequentialScheduler;

use async_trait::async_trait;
use plume_model::{SchedulerState, Step, StepId, StepStatus, TaskContext, TaskResult};

use crate::error::CoreError;

/// Contract shared by every backend scheduler and by the dispatcher.
///
/// `submit` only fails on contract violations (not started, stopped, duplicate task); task failures
/// end up in the results. Queries are snapshots and may be called at any time.
#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Short backend name, recorded in every `TaskResult`.
    fn name(&self) -> &'static str;

    fn state(&self) -> SchedulerState;

    fn start(&self) -> Result<(), CoreError>;

    /// Stop the scheduler, interrupting in-flight work. Stopping twice is a no-op.
    async fn stop(&self) -> Result<(), CoreError>;

    /// Stop starting new tasks; running tasks carry on.
    fn pause(&self) -> Result<(), CoreError>;

    fn resume(&self) -> Result<(), CoreError>;

    fn submit(&self, step: &Step, task: TaskContext) -> Result<(), CoreError>;

    fn submit_all(&self, step: &Step, tasks: Vec<TaskContext>) -> Result<(), CoreError> {
        for task in tasks {
            self.submit(step, task)?;
        }
        Ok(())
    }

    fn status(&self, step: &StepId) -> StepStatus;

    fn results(&self, step: &StepId) -> Vec<TaskResult>;

    fn submitted_count(&self, step: &StepId) -> usize {
        self.status(step).submitted
    }

    fn running_count(&self, step: &StepId) -> usize {
        self.status(step).running
    }

    fn done_count(&self, step: &StepId) -> usize {
        self.status(step).done
    }

    /// Wait until every task submitted so far for `step` has a result.
    async fn wait_end_of_tasks(&self, step: &StepId);
}
