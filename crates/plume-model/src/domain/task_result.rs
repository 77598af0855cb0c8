use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{EpochMs, StepId, TaskId};

/// Named counters reported by a task (`group.name -> value`).
pub type Counters = BTreeMap<String, u64>;

/// What a task produces on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: Counters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum TaskOutcome {
    Success,
    Failure { cause: String },
}

/// Outcome of one submitted task. Produced exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub backend: String,
    pub outcome: TaskOutcome,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: Counters,
    pub started_at: EpochMs,
    pub finished_at: EpochMs,
}

impl TaskResult {
    pub fn success(
        task_id: TaskId,
        step_id: StepId,
        backend: &str,
        output: TaskOutput,
        started_at: EpochMs,
    ) -> Self {
        Self {
            task_id,
            step_id,
            backend: backend.to_string(),
            outcome: TaskOutcome::Success,
            data: output.data,
            counters: output.counters,
            started_at,
            finished_at: crate::now_ms(),
        }
    }

    pub fn failure(
        task_id: TaskId,
        step_id: StepId,
        backend: &str,
        cause: impl Into<String>,
        started_at: EpochMs,
    ) -> Self {
        Self {
            task_id,
            step_id,
            backend: backend.to_string(),
            outcome: TaskOutcome::Failure {
                cause: cause.into(),
            },
            data: serde_json::Value::Null,
            counters: Counters::new(),
            started_at,
            finished_at: crate::now_ms(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Success)
    }

    pub fn cause(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Success => None,
            TaskOutcome::Failure { cause } => Some(cause),
        }
    }
}

/// Result file written by a worker process next to the "done" marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: Counters,
}
