use plume_model::ModelError;
use thiserror::Error;

/// Why an external task did not produce a usable result.
///
/// Executions turn these into the failure cause of the task's `TaskResult`.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("missing program")]
    MissingProgram,
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("non-zero exit code: {code}")]
    NonZeroExit { code: i32 },
    #[error("killed by signal")]
    KilledBySignal,
    #[error("no done marker for task #{task}")]
    NoDoneMarker { task: u64 },
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("batch job {job} for step '{step}' failed: {reason}")]
    JobFailed {
        job: String,
        step: String,
        reason: String,
    },
    #[error("unknown batch job {0}")]
    UnknownJob(String),
    #[error("task file: {0}")]
    Model(#[from] ModelError),
    #[error("io error: {0}")]
    Io(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
