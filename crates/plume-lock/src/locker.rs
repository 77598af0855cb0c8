use std::{fmt, str::FromStr, sync::Mutex};

use async_trait::async_trait;

use crate::error::LockError;

/// Mutual exclusion on one named resource.
///
/// `lock` waits until the caller owns the resource; calling it again while held is a no-op, and
/// calling it while another `lock` of the same instance is still waiting fails with
/// [`LockError::AcquireInProgress`]. `unlock` releases it; calling it again, or without holding
/// the lock, is a no-op.
#[async_trait]
pub trait Locker: Send + Sync + 'static {
    /// Name of the locked resource.
    fn name(&self) -> &str;

    fn kind(&self) -> LockerKind;

    async fn lock(&self) -> Result<(), LockError>;

    async fn unlock(&self) -> Result<(), LockError>;
}

/// The locker families, keyed by name in a [`crate::LockerFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockerKind {
    /// Advisory OS lock on a file (one host).
    File,
    /// Oldest live pid marker wins (one host, no coordinator).
    Pid,
    /// Fair lock arbitrated by a ticket registry (many hosts).
    Ticket,
    /// Ephemeral nodes on a coordination service (many hosts).
    Coordination,
}

impl LockerKind {
    pub const ALL: [LockerKind; 4] = [
        LockerKind::File,
        LockerKind::Pid,
        LockerKind::Ticket,
        LockerKind::Coordination,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LockerKind::File => "file",
            LockerKind::Pid => "pid",
            LockerKind::Ticket => "ticket",
            LockerKind::Coordination => "coordination",
        }
    }
}

impl fmt::Display for LockerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockerKind {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LockerKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LockError::UnknownLocker(s.to_string()))
    }
}

enum SlotState<H> {
    Free,
    Acquiring,
    Held(H),
}

/// What a locker instance owns: nothing, a pending acquisition, or the lock.
pub(crate) struct Slot<H> {
    state: Mutex<SlotState<H>>,
}

impl<H> Slot<H> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Free),
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        matches!(*self.state.lock().unwrap(), SlotState::Held(_))
    }

    pub(crate) fn with_held<R>(&self, f: impl FnOnce(&H) -> R) -> Option<R> {
        match &*self.state.lock().unwrap() {
            SlotState::Held(h) => Some(f(h)),
            _ => None,
        }
    }

    /// Reserve the slot for an acquisition. `None` when the lock is already held.
    pub(crate) fn begin(&self, lock: &str) -> Result<Option<Acquiring<'_, H>>, LockError> {
        let mut state = self.state.lock().unwrap();
        match *state {
            SlotState::Held(_) => Ok(None),
            SlotState::Acquiring => Err(LockError::AcquireInProgress(lock.to_string())),
            SlotState::Free => {
                *state = SlotState::Acquiring;
                Ok(Some(Acquiring {
                    slot: self,
                    done: false,
                }))
            }
        }
    }

    /// Release a held lock, handing back what it held.
    pub(crate) fn take(&self) -> Option<H> {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, SlotState::Held(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, SlotState::Free) {
            SlotState::Held(h) => Some(h),
            _ => None,
        }
    }
}

/// A reserved slot. Dropping it without [`Acquiring::hold`] frees the slot again.
pub(crate) struct Acquiring<'a, H> {
    slot: &'a Slot<H>,
    done: bool,
}

impl<H> Acquiring<'_, H> {
    pub(crate) fn hold(mut self, held: H) {
        *self.slot.state.lock().unwrap() = SlotState::Held(held);
        self.done = true;
    }
}

impl<H> Drop for Acquiring<'_, H> {
    fn drop(&mut self) {
        if !self.done {
            *self.slot.state.lock().unwrap() = SlotState::Free;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_their_names() {
        for kind in LockerKind::ALL {
            assert_eq!(kind.as_str().parse::<LockerKind>().unwrap(), kind);
        }
        assert_eq!(" PID ".parse::<LockerKind>().unwrap(), LockerKind::Pid);
        assert!(matches!(
            "zookeeper".parse::<LockerKind>(),
            Err(LockError::UnknownLocker(_))
        ));
    }

    #[test]
    fn slot_rejects_a_second_acquisition() {
        let slot: Slot<u32> = Slot::new();
        let first = slot.begin("ingest").unwrap().unwrap();
        assert!(matches!(
            slot.begin("ingest"),
            Err(LockError::AcquireInProgress(name)) if name == "ingest"
        ));

        first.hold(7);
        assert!(slot.is_held());
        assert!(slot.begin("ingest").unwrap().is_none());
        assert_eq!(slot.take(), Some(7));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn abandoned_acquisition_frees_the_slot() {
        let slot: Slot<()> = Slot::new();
        drop(slot.begin("ingest").unwrap());
        assert!(!slot.is_held());
        assert!(slot.begin("ingest").unwrap().is_some());
    }
}
