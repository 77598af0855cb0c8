//! Child program of the `process` and `batch` backends.
//!
//! Invoked as `worker <task>.ctx`: reads the task descriptor, echoes its payload as the task
//! output and reports one counter per task.

use std::path::PathBuf;

use anyhow::{Context, bail};
use tracing::info;

use plume_exec::worker::{report_counter, run_descriptor};
use plume_model::{TaskContext, TaskOutput};
use plume_observe::{LoggerConfig, logger_init};

fn echo(task: &TaskContext) -> Result<TaskOutput, String> {
    if task.payload.get("fail").and_then(|v| v.as_bool()) == Some(true) {
        return Err(format!("task #{} asked to fail", task.id));
    }
    report_counter("worker", "tasks", 1);

    let mut output = TaskOutput {
        data: serde_json::json!({
            "step": task.step_id.as_str(),
            "context": task.context_name,
            "payload": task.payload,
        }),
        ..Default::default()
    };
    output.counters.insert("worker.echoed".to_string(), 1);
    Ok(output)
}

fn main() -> anyhow::Result<()> {
    // stdout/stderr belong to the task; keep logs on the default writer at warn.
    let mut cfg = LoggerConfig::from_env()?;
    if std::env::var(plume_observe::ENV_LEVEL).is_err() {
        cfg.level = "warn".into();
    }
    logger_init(&cfg)?;

    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        bail!("usage: worker <task descriptor>");
    };
    let ok = run_descriptor(&path, &echo)
        .with_context(|| format!("running task {}", path.display()))?;
    info!(task = %path.display(), ok, "task finished");
    Ok(())
}
