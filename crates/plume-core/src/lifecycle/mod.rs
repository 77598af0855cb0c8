use std::sync::Mutex;

use plume_model::SchedulerState;
use tracing::debug;

use crate::error::CoreError;

/// Guards the `Created -> Started -> [Paused <-> Started] -> Stopped` state machine of a scheduler.
#[derive(Debug)]
pub struct Lifecycle {
    scheduler: &'static str,
    state: Mutex<SchedulerState>,
}

impl Lifecycle {
    pub fn new(scheduler: &'static str) -> Self {
        Self {
            scheduler,
            state: Mutex::new(SchedulerState::Created),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap()
    }

    /// `Created -> Started`. A stopped scheduler can never be restarted.
    pub fn start(&self) -> Result<(), CoreError> {
        self.transition("start", |s| match s {
            SchedulerState::Created => Some(SchedulerState::Started),
            _ => None,
        })
    }

    /// Move to `Stopped` from any state.
    ///
    /// Returns `false` if the scheduler was already stopped.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == SchedulerState::Stopped {
            return false;
        }
        debug!(scheduler = self.scheduler, from = %*state, "stopping");
        *state = SchedulerState::Stopped;
        true
    }

    /// `Started -> Paused`. Pausing an already paused scheduler is a no-op.
    pub fn pause(&self) -> Result<(), CoreError> {
        self.transition("pause", |s| match s {
            SchedulerState::Started | SchedulerState::Paused => Some(SchedulerState::Paused),
            _ => None,
        })
    }

    /// `Paused -> Started`. Resuming a running scheduler is a no-op.
    pub fn resume(&self) -> Result<(), CoreError> {
        self.transition("resume", |s| match s {
            SchedulerState::Started | SchedulerState::Paused => Some(SchedulerState::Started),
            _ => None,
        })
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.state() == SchedulerState::Paused
    }

    /// Fails unless tasks may be submitted in the current state.
    pub fn check_submit(&self) -> Result<(), CoreError> {
        match self.state() {
            SchedulerState::Created => Err(CoreError::NotStarted {
                scheduler: self.scheduler,
            }),
            SchedulerState::Stopped => Err(CoreError::Stopped {
                scheduler: self.scheduler,
            }),
            SchedulerState::Started | SchedulerState::Paused => Ok(()),
        }
    }

    fn transition(
        &self,
        action: &'static str,
        next: impl FnOnce(SchedulerState) -> Option<SchedulerState>,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        let current = *state;
        match next(current) {
            Some(to) => {
                *state = to;
                Ok(())
            }
            None if current == SchedulerState::Stopped => Err(CoreError::Stopped {
                scheduler: self.scheduler,
            }),
            None => Err(CoreError::InvalidState {
                scheduler: self.scheduler,
                action,
                state: current,
            }),
        }
    }
}
