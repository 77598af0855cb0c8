use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use plume_core::{PoolConfig, PoolScheduler, TaskExecution};
use plume_model::{ScheduledTask, Step, TaskOutput, TaskResult, now_ms};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    error::{ExecError, ExecResult},
    files::TaskFiles,
    limits::{RlimitConfig, attach_rlimits},
    util::{cmd_program, kill_graceful},
};

pub const PROCESS_SCHEDULER: &str = "process";

/// How task child processes are launched.
///
/// The child is started as `program args... <descriptor path>`.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Root of the per-task file sets.
    pub work_dir: PathBuf,
    pub rlimits: RlimitConfig,
    /// Time between SIGTERM and SIGKILL when a running task is cancelled.
    pub kill_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            work_dir: std::env::temp_dir().join("plume"),
            rlimits: RlimitConfig::default(),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// One child process per task.
pub struct ProcessExecution {
    cfg: ProcessConfig,
}

impl ProcessExecution {
    pub fn new(cfg: ProcessConfig) -> ExecResult<Self> {
        if cfg.program.is_empty() {
            return Err(ExecError::MissingProgram);
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.cfg
    }

    async fn run(&self, task: &ScheduledTask, cancel: CancellationToken) -> ExecResult<TaskOutput> {
        let files = TaskFiles::for_task(&self.cfg.work_dir, &task.context);
        files.stage(&task.context).await?;

        let mut cmd = cmd_program(&self.cfg.program, &self.cfg.args, &files.context());
        if let Some(cwd) = &self.cfg.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.cfg.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(File::create(files.stdout()).await?.into_std().await));
        cmd.stderr(Stdio::from(File::create(files.stderr()).await?.into_std().await));
        cmd.kill_on_drop(true);
        attach_rlimits(&mut cmd, &self.cfg.rlimits);

        trace!(program = %self.cfg.program, args = ?self.cfg.args, "spawn");
        let mut child = cmd.spawn().map_err(|e| ExecError::Spawn(e.to_string()))?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                debug!("cancelled; killing child");
                if let Err(e) = kill_graceful(&mut child, self.cfg.kill_grace).await {
                    warn!(error = %e, "failed to kill task process");
                }
                return Err(ExecError::Cancelled);
            }
        };

        if !status.success() {
            return Err(match status.code() {
                Some(code) => ExecError::NonZeroExit { code },
                None => ExecError::KilledBySignal,
            });
        }
        files.collect_output(task.id()).await
    }
}

#[async_trait]
impl TaskExecution for ProcessExecution {
    #[instrument(level = "debug", skip_all, fields(step = %step.id, task = %task.id()))]
    async fn execute(
        &self,
        step: &Step,
        task: &ScheduledTask,
        cancel: CancellationToken,
    ) -> TaskResult {
        let started_at = now_ms();
        match self.run(task, cancel).await {
            Ok(output) => {
                TaskResult::success(task.id(), step.id.clone(), &task.backend, output, started_at)
            }
            Err(e) => {
                debug!(error = %e, "task process failed");
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

/// Pool scheduler running every task in its own child process.
pub fn process_scheduler(
    cfg: ProcessConfig,
    pool: &PoolConfig,
) -> ExecResult<PoolScheduler<ProcessExecution>> {
    let exec = ProcessExecution::new(cfg)?;
    Ok(PoolScheduler::new(exec, pool).with_name(PROCESS_SCHEDULER))
}
