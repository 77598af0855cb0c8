mod ids;
pub use ids::{StepId, TaskId};

mod step;
pub use step::{Parallelization, Step, StepKind};

mod task_context;
pub use task_context::{ScheduledTask, TaskContext};

mod task_result;
pub use task_result::{Counters, TaskOutcome, TaskOutput, TaskReport, TaskResult};

mod task_status;
pub use task_status::TaskStatus;

mod step_status;
pub use step_status::StepStatus;

mod scheduler_state;
pub use scheduler_state::SchedulerState;

/// Milliseconds since the unix epoch.
pub type EpochMs = u64;

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn now_ms() -> EpochMs {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
