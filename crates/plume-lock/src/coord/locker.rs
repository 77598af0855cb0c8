use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, trace, warn};

use super::{CoordinationSession, Coordinator, CreateMode};
use crate::{
    error::LockError,
    locker::{Locker, LockerKind, Slot},
};

#[derive(Debug, Clone)]
pub struct CoordinationLockConfig {
    pub base_path: String,
    pub lock_name: String,
    /// Name competitor nodes with a service-assigned sequence number.
    pub sequential: bool,
}

impl Default for CoordinationLockConfig {
    fn default() -> Self {
        Self {
            base_path: "/plume/locks".into(),
            lock_name: "plume".into(),
            sequential: false,
        }
    }
}

struct Held {
    session: Box<dyn CoordinationSession>,
    node: String,
}

/// Holder is the competitor whose ephemeral node sorts first under `{base_path}/{lock_name}`.
pub struct CoordinationLocker {
    cfg: CoordinationLockConfig,
    coordinator: Arc<dyn Coordinator>,
    held: Slot<Held>,
}

impl CoordinationLocker {
    pub fn new(cfg: CoordinationLockConfig, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            cfg,
            coordinator,
            held: Slot::new(),
        }
    }

    /// Queue recipe: competitors are served in the order they created their nodes.
    pub fn distributed(mut cfg: CoordinationLockConfig, coordinator: Arc<dyn Coordinator>) -> Self {
        cfg.sequential = true;
        Self::new(cfg, coordinator)
    }

    pub fn parent_path(&self) -> String {
        format!("{}/{}", self.cfg.base_path.trim_end_matches('/'), self.cfg.lock_name)
    }

    /// Session of the current holder.
    pub fn session_id(&self) -> Option<u64> {
        self.held.with_held(|h| h.session.id())
    }

    pub fn is_held(&self) -> bool {
        self.held.is_held()
    }

    async fn acquire(&self, session: &dyn CoordinationSession) -> Result<String, LockError> {
        let parent = self.parent_path();
        session.ensure_path(&parent).await?;

        let node = if self.cfg.sequential {
            session
                .create(&format!("{parent}/lock-"), CreateMode::EphemeralSequential)
                .await?
        } else {
            session
                .create(&format!("{parent}/lock-{:010}", session.id()), CreateMode::Ephemeral)
                .await?
        };
        let mine = node.rsplit('/').next().unwrap_or(&node).to_string();

        loop {
            let (children, watch) = session.children_watch(&parent).await?;
            if !children.contains(&mine) {
                return Err(LockError::SessionLost(format!("lock node '{node}' disappeared")));
            }
            if children.first() == Some(&mine) {
                return Ok(node);
            }
            trace!(node = %mine, ahead = ?children.first(), "waiting for lock node to come first");
            watch.fired().await;
        }
    }
}

#[async_trait]
impl Locker for CoordinationLocker {
    fn name(&self) -> &str {
        &self.cfg.lock_name
    }

    fn kind(&self) -> LockerKind {
        LockerKind::Coordination
    }

    #[instrument(level = "debug", skip(self), fields(lock = %self.cfg.lock_name))]
    async fn lock(&self) -> Result<(), LockError> {
        let Some(acquiring) = self.held.begin(&self.cfg.lock_name)? else {
            return Ok(());
        };

        let session = self.coordinator.connect().await?;
        match self.acquire(session.as_ref()).await {
            Ok(node) => {
                debug!(%node, session = session.id(), "coordination lock acquired");
                acquiring.hold(Held { session, node });
                Ok(())
            }
            Err(e) => {
                if let Err(close) = session.close().await {
                    warn!(error = %close, "failed to close coordination session");
                }
                Err(e)
            }
        }
    }

    async fn unlock(&self) -> Result<(), LockError> {
        let Some(Held { session, node }) = self.held.take() else {
            return Ok(());
        };
        let deleted = session.delete(&node).await;
        let closed = session.close().await;
        debug!(lock = %self.cfg.lock_name, %node, "coordination lock released");
        deleted.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::coord::MemoryCoordinator;

    fn config() -> CoordinationLockConfig {
        CoordinationLockConfig {
            lock_name: "merge".into(),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lockers_take_turns() {
        let coord = Arc::new(MemoryCoordinator::new());
        let inside = Arc::new(AtomicBool::new(false));
        let served = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let locker = CoordinationLocker::distributed(config(), coord.clone());
            let (inside, served) = (Arc::clone(&inside), Arc::clone(&served));
            tasks.push(tokio::spawn(async move {
                locker.lock().await.unwrap();
                assert!(!inside.swap(true, Ordering::SeqCst));
                tokio::time::sleep(Duration::from_millis(10)).await;
                inside.store(false, Ordering::SeqCst);
                served.fetch_add(1, Ordering::SeqCst);
                locker.unlock().await.unwrap();
            }));
        }
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("every locker should be served")
                .unwrap();
        }
        assert_eq!(served.load(Ordering::SeqCst), 5);
        assert_eq!(coord.session_count(), 0);
    }

    #[tokio::test]
    async fn overlapping_lock_calls_open_one_session() {
        let coord = Arc::new(MemoryCoordinator::new());
        let holder = CoordinationLocker::new(config(), coord.clone());
        let contender = Arc::new(CoordinationLocker::new(config(), coord.clone()));
        holder.lock().await.unwrap();

        let waiting = {
            let contender = Arc::clone(&contender);
            tokio::spawn(async move { contender.lock().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            contender.lock().await,
            Err(LockError::AcquireInProgress(_))
        ));
        assert_eq!(coord.session_count(), 2);

        holder.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("contender should acquire")
            .unwrap()
            .unwrap();
        contender.unlock().await.unwrap();
        assert_eq!(coord.session_count(), 0);
    }

    #[tokio::test]
    async fn expired_holder_lets_waiter_in() {
        let coord = Arc::new(MemoryCoordinator::new());
        let a = CoordinationLocker::new(config(), coord.clone());
        let b = Arc::new(CoordinationLocker::new(config(), coord.clone()));

        a.lock().await.unwrap();
        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.lock().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        coord.expire(a.session_id().unwrap());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire")
            .unwrap()
            .unwrap();

        assert!(matches!(a.unlock().await, Err(LockError::SessionLost(_))));
        b.unlock().await.unwrap();
        assert!(coord.exists("/plume/locks/merge"));
    }
}
