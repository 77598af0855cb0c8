mod runtime;
pub use runtime::{BatchRuntime, JobId, JobSpec, JobState};

mod local;
pub use local::{LocalBatchConfig, LocalBatchRuntime};

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use plume_core::{PoolConfig, PoolScheduler, TaskExecution};
use plume_model::{ScheduledTask, Step, TaskContext, TaskOutput, TaskResult, now_ms};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    error::{ExecError, ExecResult},
    files::TaskFiles,
};

pub const BATCH_SCHEDULER: &str = "batch";

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Root of the per-task file sets; must be visible to the batch workers.
    pub work_dir: PathBuf,
    /// First component of every job name.
    pub job_prefix: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("plume"),
            job_prefix: "plume".into(),
        }
    }
}

/// One batch job per task.
///
/// The job input holds a single record (the descriptor path), so the runtime starts exactly one
/// worker for the task.
pub struct BatchExecution {
    runtime: Arc<dyn BatchRuntime>,
    cfg: BatchConfig,
}

impl BatchExecution {
    pub fn new(runtime: Arc<dyn BatchRuntime>, cfg: BatchConfig) -> Self {
        Self { runtime, cfg }
    }

    /// `{prefix}-{context}-{step}-task-{id}`
    pub fn job_name(&self, task: &TaskContext) -> String {
        format!(
            "{}-{}-{}-task-{}",
            self.cfg.job_prefix, task.context_name, task.step_id, task.id
        )
    }

    async fn run(
        &self,
        step: &Step,
        task: &ScheduledTask,
        cancel: CancellationToken,
    ) -> ExecResult<TaskOutput> {
        let files = TaskFiles::for_task(&self.cfg.work_dir, &task.context);
        files.stage(&task.context).await?;

        let input = files.dir().join("records.txt");
        tokio::fs::write(&input, format!("{}\n", files.context().display())).await?;

        let job = self
            .runtime
            .submit(JobSpec {
                name: self.job_name(&task.context),
                input,
                work_dir: files.dir().to_path_buf(),
            })
            .await?;
        debug!(job = %job, runtime = self.runtime.name(), "job submitted");

        let state = tokio::select! {
            state = self.runtime.wait(&job) => state,
            _ = cancel.cancelled() => {
                debug!(job = %job, "cancelled; killing job");
                match self.runtime.kill(&job).await {
                    Ok(()) => {
                        let _ = self.runtime.wait(&job).await;
                    }
                    Err(e) => warn!(job = %job, error = %e, "failed to kill job"),
                }
                self.runtime.forget(&job).await;
                return Err(ExecError::Cancelled);
            }
        };

        let outcome = match state {
            Ok(JobState::Succeeded) => self.collect(&files, task, &job).await,
            Ok(JobState::Failed { reason }) => Err(ExecError::JobFailed {
                job: job.to_string(),
                step: step.id.to_string(),
                reason,
            }),
            Ok(JobState::Killed) => Err(ExecError::JobFailed {
                job: job.to_string(),
                step: step.id.to_string(),
                reason: "killed".into(),
            }),
            Err(e) => Err(e),
        };
        self.runtime.forget(&job).await;
        outcome
    }

    async fn collect(
        &self,
        files: &TaskFiles,
        task: &ScheduledTask,
        job: &JobId,
    ) -> ExecResult<TaskOutput> {
        let mut output = files.collect_output(task.id()).await?;
        // Streamed counters are authoritative over the ones repeated in the result file.
        output.counters.extend(self.runtime.counters(job).await?);
        Ok(output)
    }
}

#[async_trait]
impl TaskExecution for BatchExecution {
    #[instrument(level = "debug", skip_all, fields(step = %step.id, task = %task.id()))]
    async fn execute(
        &self,
        step: &Step,
        task: &ScheduledTask,
        cancel: CancellationToken,
    ) -> TaskResult {
        let started_at = now_ms();
        match self.run(step, task, cancel).await {
            Ok(output) => {
                TaskResult::success(task.id(), step.id.clone(), &task.backend, output, started_at)
            }
            Err(e) => {
                debug!(error = %e, "batch task failed");
                TaskResult::failure(
                    task.id(),
                    step.id.clone(),
                    &task.backend,
                    e.to_string(),
                    started_at,
                )
            }
        }
    }
}

/// Pool scheduler submitting one job per task to `runtime`.
///
/// The pool size bounds the number of jobs in flight.
pub fn batch_scheduler(
    runtime: Arc<dyn BatchRuntime>,
    cfg: BatchConfig,
    pool: &PoolConfig,
) -> PoolScheduler<BatchExecution> {
    PoolScheduler::new(BatchExecution::new(runtime, cfg), pool).with_name(BATCH_SCHEDULER)
}
