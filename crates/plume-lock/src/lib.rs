//! Mutual exclusion on named resources across processes and hosts.
//!
//! Every locker implements [`Locker`]:
//! - [`FileLocker`]: advisory file lock, one host;
//! - [`PidLocker`]: oldest live competitor wins, one host, no coordinator;
//! - [`TicketLocker`]: fair lock served by a [`TicketRegistry`] over HTTP, many hosts;
//! - [`CoordinationLocker`]: ephemeral nodes on a [`Coordinator`], many hosts.
//!
//! [`LockerFactory`] builds them by [`LockerKind`] name.

mod error;
pub use error::LockError;

mod locker;
pub use locker::{Locker, LockerKind};

pub mod file;
pub use file::FileLocker;

pub mod pid;
pub use pid::{PidLockConfig, PidLocker, ProcessTable, StaticProcesses, SystemProcesses};

pub mod ticket;
pub use ticket::{
    RegistryClient, RegistryConfig, RegistryServer, RegistryService, TicketLockConfig,
    TicketLocker, TicketRegistry,
};

pub mod coord;
pub use coord::{
    ChildrenWatch, CoordinationLockConfig, CoordinationLocker, CoordinationSession, Coordinator,
    CreateMode, MemoryCoordinator,
};

mod factory;
pub use factory::{LockerCtor, LockerFactory};

pub mod prelude {
    pub use crate::{LockError, Locker, LockerFactory, LockerKind};
}
