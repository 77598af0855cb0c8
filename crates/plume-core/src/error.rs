use plume_model::SchedulerState;
use thiserror::Error;

/// Precondition violations of the scheduler contract.
///
/// Task failures never show up here: they are captured in the task's `TaskResult`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("scheduler '{scheduler}' has not been started")]
    NotStarted { scheduler: &'static str },

    #[error("scheduler '{scheduler}' is stopped")]
    Stopped { scheduler: &'static str },

    #[error("scheduler '{scheduler}' cannot {action} while {state}")]
    InvalidState {
        scheduler: &'static str,
        action: &'static str,
        state: SchedulerState,
    },

    #[error("task {task} already submitted for step '{step}'")]
    DuplicateTask { step: String, task: u64 },

    #[error("no scheduler registered under '{0}'")]
    UnknownScheduler(String),

    #[error("no backend for step '{step}': {reason}")]
    NoBackend { step: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no tokio runtime available: {0}")]
    Runtime(String),
}
