use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{EpochMs, ModelError, StepId, TaskId};

/// Opaque, serializable unit of work.
///
/// The `payload` belongs to the step implementation; schedulers only move it around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub id: TaskId,
    pub step_id: StepId,
    /// Name of the context inside the step (sample name, chunk name...).
    pub context_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskContext {
    pub fn new(id: u64, step_id: impl Into<StepId>, context_name: impl Into<String>) -> Self {
        Self {
            id: TaskId::from(id),
            step_id: step_id.into(),
            context_name: context_name.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Serialize the descriptor into `path`.
    pub fn write_to(&self, path: &Path) -> Result<(), ModelError> {
        let json = self.to_json()?;
        fs::write(path, json).map_err(|e| ModelError::io(path, e))
    }

    /// Reconstruct a descriptor written by [`TaskContext::write_to`].
    pub fn read_from(path: &Path) -> Result<Self, ModelError> {
        let json = fs::read_to_string(path).map_err(|e| ModelError::io(path, e))?;
        Self::from_json(&json)
    }
}

/// A task descriptor wrapped with the execution metadata added by a scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub context: TaskContext,
    pub submitted_at: EpochMs,
    /// Name of the backend scheduler that accepted the task.
    pub backend: String,
}

impl ScheduledTask {
    pub fn new(context: TaskContext, backend: &str) -> Self {
        Self {
            context,
            submitted_at: crate::now_ms(),
            backend: backend.to_string(),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.context.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_file_roundtrip_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.ctx");

        let ctx = TaskContext::new(7, "filterreads", "sample-1")
            .with_payload(serde_json::json!({"input": "reads.fq"}));
        ctx.write_to(&path).unwrap();

        let back = TaskContext::read_from(&path).unwrap();
        assert_eq!(back.id, ctx.id);
        assert_eq!(back.step_id, ctx.step_id);
        assert_eq!(back, ctx);
    }

    #[test]
    fn read_missing_descriptor_reports_path() {
        let err = TaskContext::read_from(Path::new("/nonexistent/plume/task.ctx")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/plume/task.ctx"));
    }

    #[test]
    fn scheduled_task_records_backend() {
        let task = ScheduledTask::new(TaskContext::new(1, "s", "c"), "pool");
        assert_eq!(task.backend, "pool");
        assert_eq!(task.id(), TaskId::from(1));
        assert!(task.submitted_at > 0);
    }
}
