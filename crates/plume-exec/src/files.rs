//! The file set shared by a scheduler and the child running one task.
//!
//! All six files live in one per-task directory and share a prefix:
//!
//! | file              | written by | content                              |
//! |-------------------|------------|--------------------------------------|
//! | `{prefix}.ctx`    | scheduler  | serialized `TaskContext`             |
//! | `{prefix}.data`   | worker     | output data (JSON)                   |
//! | `{prefix}.result` | worker     | `TaskReport` (JSON)                  |
//! | `{prefix}.done`   | worker     | empty; created last                  |
//! | `{prefix}.out`    | child      | redirected standard output           |
//! | `{prefix}.err`    | child      | redirected standard error            |
//!
//! The presence of the done marker is the only completion signal.

use std::{
    fs,
    path::{Path, PathBuf},
};

use plume_model::{ModelError, TaskContext, TaskId, TaskOutput, TaskReport};
use tracing::trace;

use crate::error::{ExecError, ExecResult};

const CONTEXT_EXT: &str = "ctx";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFiles {
    dir: PathBuf,
    prefix: String,
}

impl TaskFiles {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// `{work_dir}/{step}/task-{id}/task-{id}.*`
    pub fn for_task(work_dir: &Path, task: &TaskContext) -> Self {
        let prefix = format!("task-{}", task.id);
        Self::new(work_dir.join(task.step_id.as_str()).join(&prefix), prefix)
    }

    /// Recover the file set from the descriptor path handed to a worker.
    pub fn from_context_path(path: &Path) -> ExecResult<Self> {
        let bad = || ExecError::Io(format!("not a task descriptor path: {}", path.display()));
        if path.extension().and_then(|e| e.to_str()) != Some(CONTEXT_EXT) {
            return Err(bad());
        }
        let prefix = path.file_stem().and_then(|s| s.to_str()).ok_or_else(bad)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::new(dir, prefix))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.prefix))
    }

    pub fn context(&self) -> PathBuf {
        self.file(CONTEXT_EXT)
    }

    pub fn data(&self) -> PathBuf {
        self.file("data")
    }

    pub fn done(&self) -> PathBuf {
        self.file("done")
    }

    pub fn result(&self) -> PathBuf {
        self.file("result")
    }

    pub fn stdout(&self) -> PathBuf {
        self.file("out")
    }

    pub fn stderr(&self) -> PathBuf {
        self.file("err")
    }

    /// Create the directory and drop the leftovers of a previous run.
    pub fn prepare(&self) -> ExecResult<()> {
        fs::create_dir_all(&self.dir)?;
        for stale in [self.done(), self.result(), self.data()] {
            match fs::remove_file(&stale) {
                Ok(()) => trace!(path = %stale.display(), "removed stale task file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn write_context(&self, task: &TaskContext) -> ExecResult<()> {
        Ok(task.write_to(&self.context())?)
    }

    pub fn read_context(&self) -> ExecResult<TaskContext> {
        Ok(TaskContext::read_from(&self.context())?)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done().exists()
    }

    /// Worker side: write the outcome, then the done marker.
    pub fn write_outcome(&self, outcome: &Result<TaskOutput, String>) -> ExecResult<()> {
        let report = match outcome {
            Ok(output) => {
                let data = serde_json::to_vec(&output.data).map_err(ModelError::from)?;
                fs::write(self.data(), data)?;
                TaskReport {
                    success: true,
                    error: None,
                    counters: output.counters.clone(),
                }
            }
            Err(cause) => TaskReport {
                success: false,
                error: Some(cause.clone()),
                counters: Default::default(),
            },
        };
        let report = serde_json::to_vec(&report).map_err(ModelError::from)?;
        fs::write(self.result(), report)?;
        fs::File::create(self.done())?;
        Ok(())
    }

    /// Scheduler side: [`TaskFiles::prepare`] then [`TaskFiles::write_context`], on the blocking pool.
    pub async fn stage(&self, task: &TaskContext) -> ExecResult<()> {
        let task = task.clone();
        self.blocking(move |files| {
            files.prepare()?;
            files.write_context(&task)
        })
        .await
    }

    /// [`TaskFiles::collect`] on the blocking pool.
    pub async fn collect_output(&self, task: TaskId) -> ExecResult<TaskOutput> {
        self.blocking(move |files| files.collect(task)).await
    }

    async fn blocking<T, F>(&self, f: F) -> ExecResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskFiles) -> ExecResult<T> + Send + 'static,
    {
        let files = self.clone();
        tokio::task::spawn_blocking(move || f(&files))
            .await
            .map_err(|e| ExecError::Io(format!("task file job aborted: {e}")))?
    }

    /// Scheduler side: read back what the worker left once the child has exited.
    pub fn collect(&self, task: TaskId) -> ExecResult<TaskOutput> {
        if !self.is_done() {
            return Err(ExecError::NoDoneMarker { task: task.get() });
        }

        let report: TaskReport = match fs::read(self.result()) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(ModelError::from)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecError::TaskFailed("done marker without result file".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if !report.success {
            return Err(ExecError::TaskFailed(
                report.error.unwrap_or_else(|| "no cause reported".into()),
            ));
        }

        let data = match fs::read(self.data()) {
            Ok(raw) if raw.is_empty() => serde_json::Value::Null,
            Ok(raw) => serde_json::from_slice(&raw).map_err(ModelError::from)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Value::Null,
            Err(e) => return Err(e.into()),
        };
        Ok(TaskOutput {
            data,
            counters: report.counters,
        })
    }
}
