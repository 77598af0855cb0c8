use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a scheduler: `Created -> Started -> [Paused <-> Started] -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SchedulerState {
    Created,
    Started,
    Paused,
    /// Terminal.
    Stopped,
}

impl SchedulerState {
    /// Whether `submit` is accepted in this state.
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, SchedulerState::Started | SchedulerState::Paused)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Created => "created",
            SchedulerState::Started => "started",
            SchedulerState::Paused => "paused",
            SchedulerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
