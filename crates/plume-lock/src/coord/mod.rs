//! Lock on a hierarchical coordination service.
//!
//! The service keeps a tree of nodes. Ephemeral nodes belong to the session that created them
//! and vanish with it, so a crashed holder releases its lock once its session expires.

mod locker;
mod memory;

pub use locker::{CoordinationLockConfig, CoordinationLocker};
pub use memory::MemoryCoordinator;

use std::{fmt, future::Future, pin::Pin};

use async_trait::async_trait;

use crate::error::LockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    /// Ephemeral, with a per-parent counter appended to the name.
    EphemeralSequential,
}

/// Fires once, on the first change of a node's children after it was set.
pub struct ChildrenWatch(Pin<Box<dyn Future<Output = ()> + Send + 'static>>);

impl ChildrenWatch {
    pub fn new(fired: impl Future<Output = ()> + Send + 'static) -> Self {
        Self(Box::pin(fired))
    }

    pub async fn fired(self) {
        self.0.await
    }
}

impl fmt::Debug for ChildrenWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChildrenWatch")
    }
}

/// One client session. Paths are absolute and `/`-separated.
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    fn id(&self) -> u64;

    /// Create `path` and its missing ancestors as persistent nodes.
    async fn ensure_path(&self, path: &str) -> Result<(), LockError>;

    /// Create a node and return its actual path.
    async fn create(&self, path: &str, mode: CreateMode) -> Result<String, LockError>;

    /// Names of the children of `path`, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, LockError>;

    /// Like [`CoordinationSession::children`], also setting a watch on the listing.
    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, ChildrenWatch), LockError>;

    async fn delete(&self, path: &str) -> Result<(), LockError>;

    /// End the session, dropping its ephemeral nodes.
    async fn close(&self) -> Result<(), LockError>;
}

#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn CoordinationSession>, LockError>;
}
