use std::{fmt, path::PathBuf};

use async_trait::async_trait;
use plume_model::Counters;

use crate::error::ExecResult;

/// Identifier assigned by a batch runtime to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job to submit.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Display name, for operators.
    pub name: String,
    /// Text input; every line is one record and gets its own worker.
    pub input: PathBuf,
    /// Working directory of the job's workers.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Succeeded,
    Failed { reason: String },
    Killed,
}

impl JobState {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Succeeded)
    }
}

/// A batch system able to run jobs made of one worker per input record.
#[async_trait]
pub trait BatchRuntime: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn submit(&self, job: JobSpec) -> ExecResult<JobId>;

    /// Block until the job reaches a final state.
    async fn wait(&self, job: &JobId) -> ExecResult<JobState>;

    /// Kill a running job. Killing a finished job is a no-op.
    async fn kill(&self, job: &JobId) -> ExecResult<()>;

    /// Counters aggregated over every worker of the job.
    async fn counters(&self, job: &JobId) -> ExecResult<Counters>;

    /// Drop what the runtime keeps about a finished job.
    async fn forget(&self, _job: &JobId) {}
}
