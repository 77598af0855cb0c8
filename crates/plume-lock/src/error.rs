use std::path::Path;

use thiserror::Error;

/// Failure to acquire or release a lock.
///
/// Lockers clean up what they created before returning one of these.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot bind ticket registry on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ticket registry unreachable at {addr}: {reason}")]
    RegistryUnreachable { addr: String, reason: String },

    #[error("ticket registry request failed: {0}")]
    Registry(String),

    #[error("coordination session lost: {0}")]
    SessionLost(String),

    #[error("coordination error: {0}")]
    Coordination(String),

    #[error("process table unavailable: {0}")]
    ProcessTable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lock '{0}' is already being acquired through this locker")]
    AcquireInProgress(String),

    #[error("no locker registered under '{0}'")]
    UnknownLocker(String),
}

impl LockError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        LockError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
