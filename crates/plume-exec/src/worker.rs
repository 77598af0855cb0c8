//! Child-side entry point of the process and batch backends.
//!
//! A worker binary receives the descriptor path, runs the task through a [`TaskRunner`] and leaves
//! its outcome in the task file set. Counters can also be streamed on stderr with
//! [`report_counter`]; the batch runtime aggregates them per job.

use std::{
    io::Write,
    panic::{AssertUnwindSafe, catch_unwind},
    path::Path,
};

use plume_core::TaskRunner;
use tracing::{debug, info, warn};

use crate::{error::ExecResult, files::TaskFiles};

/// Prefix of a counter line on the worker's stderr: `reporter:counter:<group>,<name>,<amount>`.
pub const COUNTER_PREFIX: &str = "reporter:counter:";

/// Run the task described by `files` and record its outcome.
///
/// Returns whether the task succeeded. An `Err` means the file set itself could not be read or
/// written; in that case no done marker is left behind and the scheduler reports the task as failed.
pub fn run_task(files: &TaskFiles, runner: &dyn TaskRunner) -> ExecResult<bool> {
    let task = files.read_context()?;
    debug!(step = %task.step_id, task = %task.id, "running task");

    let outcome = match catch_unwind(AssertUnwindSafe(|| runner.run(&task))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("task panicked: {msg}"))
        }
    };

    match &outcome {
        Ok(_) => info!(step = %task.step_id, task = %task.id, "task succeeded"),
        Err(cause) => warn!(step = %task.step_id, task = %task.id, %cause, "task failed"),
    }
    files.write_outcome(&outcome)?;
    Ok(outcome.is_ok())
}

/// [`run_task`] for the descriptor path a scheduler passes on the command line.
pub fn run_descriptor(path: &Path, runner: &dyn TaskRunner) -> ExecResult<bool> {
    run_task(&TaskFiles::from_context_path(path)?, runner)
}

/// Emit a counter increment on stderr for the batch runtime.
pub fn report_counter(group: &str, name: &str, amount: u64) {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{COUNTER_PREFIX}{group},{name},{amount}");
}

/// Parse one stderr line written by [`report_counter`] into `("group.name", amount)`.
pub fn parse_counter_line(line: &str) -> Option<(String, u64)> {
    let rest = line.trim_end().strip_prefix(COUNTER_PREFIX)?;
    let mut parts = rest.splitn(3, ',');
    let group = parts.next()?;
    let name = parts.next()?;
    let amount = parts.next()?.trim().parse().ok()?;
    Some((format!("{group}.{name}"), amount))
}
