use serde::{Deserialize, Serialize};

use crate::StepId;

/// Declared execution requirement of a step.
///
/// The dispatcher uses it to pick a backend scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Parallelization {
    /// Tasks are cheap or must run one after another.
    NotNeeded,
    /// Tasks may run side by side.
    #[default]
    Standard,
    /// Each task manages its own threads.
    OwnParallelization,
}

/// Role of a step in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    /// A regular module step.
    #[default]
    Module,
    /// A step producing data from nothing (always run on the local pool).
    Generator,
}

/// The step side of a task: what the schedulers need to know about the owner of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    /// Name of the module implementing the step.
    pub module: String,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default)]
    pub parallelization: Parallelization,
}

impl Step {
    pub fn new(id: impl Into<StepId>, module: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            module: module.into(),
            kind: StepKind::Module,
            parallelization: Parallelization::Standard,
        }
    }

    pub fn with_parallelization(mut self, p: Parallelization) -> Self {
        self.parallelization = p;
        self
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    #[inline]
    pub fn is_generator(&self) -> bool {
        self.kind == StepKind::Generator
    }
}
