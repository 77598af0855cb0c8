use std::{collections::HashMap, path::PathBuf, sync::Arc};

use crate::{
    coord::{CoordinationLockConfig, CoordinationLocker, Coordinator},
    error::LockError,
    file::FileLocker,
    locker::{Locker, LockerKind},
    pid::{PidLockConfig, PidLocker, ProcessTable},
    ticket::{TicketLockConfig, TicketLocker},
};

/// Builds a locker for a lock name.
pub type LockerCtor = Box<dyn Fn(&str) -> Result<Arc<dyn Locker>, LockError> + Send + Sync>;

/// Lockers keyed by [`LockerKind`] name.
#[derive(Default)]
pub struct LockerFactory {
    ctors: HashMap<String, LockerCtor>,
}

impl LockerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// `file` and `pid` lockers with their markers under `dir`.
    pub fn with_local(dir: impl Into<PathBuf>, processes: Arc<dyn ProcessTable>) -> Self {
        let dir = dir.into();
        let mut factory = Self::new();

        let file_dir = dir.clone();
        factory.register(LockerKind::File.as_str(), move |name: &str| {
            let path = file_dir.join(format!("{name}.flock"));
            Ok(Arc::new(FileLocker::new(path)) as Arc<dyn Locker>)
        });
        factory.register(LockerKind::Pid.as_str(), move |name: &str| {
            let cfg = PidLockConfig {
                dir: dir.clone(),
                name: name.to_string(),
                ..Default::default()
            };
            Ok(Arc::new(PidLocker::new(cfg, Arc::clone(&processes))?) as Arc<dyn Locker>)
        });
        factory
    }

    /// Register the `ticket` locker; `cfg.lock_name` is replaced by the requested name.
    pub fn with_ticket(mut self, cfg: TicketLockConfig, processes: Arc<dyn ProcessTable>) -> Self {
        self.register(LockerKind::Ticket.as_str(), move |name: &str| {
            let cfg = TicketLockConfig {
                lock_name: name.to_string(),
                ..cfg.clone()
            };
            Ok(Arc::new(TicketLocker::new(cfg, Arc::clone(&processes))?) as Arc<dyn Locker>)
        });
        self
    }

    /// Register the `coordination` locker on `coordinator`.
    pub fn with_coordination(
        mut self,
        coordinator: Arc<dyn Coordinator>,
        base_path: impl Into<String>,
        sequential: bool,
    ) -> Self {
        let base_path = base_path.into();
        self.register(LockerKind::Coordination.as_str(), move |name: &str| {
            let cfg = CoordinationLockConfig {
                base_path: base_path.clone(),
                lock_name: name.to_string(),
                sequential,
            };
            Ok(Arc::new(CoordinationLocker::new(cfg, Arc::clone(&coordinator))) as Arc<dyn Locker>)
        });
        self
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn(&str) -> Result<Arc<dyn Locker>, LockError> + Send + Sync + 'static,
    {
        self.ctors.insert(kind.into(), Box::new(ctor));
        self
    }

    pub fn create(&self, kind: &str, lock_name: &str) -> Result<Arc<dyn Locker>, LockError> {
        let kind = kind.trim().to_ascii_lowercase();
        let ctor = self
            .ctors
            .get(&kind)
            .ok_or_else(|| LockError::UnknownLocker(kind.clone()))?;
        ctor(lock_name)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.ctors.contains_key(kind)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{coord::MemoryCoordinator, pid::StaticProcesses};

    fn factory(dir: &std::path::Path) -> LockerFactory {
        let procs: Arc<dyn ProcessTable> = Arc::new(StaticProcesses::new([(std::process::id(), "t")]));
        LockerFactory::with_local(dir, Arc::clone(&procs))
            .with_ticket(TicketLockConfig::default(), procs)
            .with_coordination(Arc::new(MemoryCoordinator::new()), "/locks", true)
    }

    #[test]
    fn every_kind_is_registered() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        assert_eq!(factory.names(), vec!["coordination", "file", "pid", "ticket"]);

        for kind in LockerKind::ALL {
            let locker = factory.create(kind.as_str(), "nightly").unwrap();
            assert_eq!(locker.kind(), kind);
            assert_eq!(locker.name(), "nightly");
        }
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let factory = LockerFactory::new();
        assert!(matches!(
            factory.create("zookeeper", "x"),
            Err(LockError::UnknownLocker(_))
        ));
    }

    #[tokio::test]
    async fn local_locks_are_exclusive_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let a = factory.create("File", "nightly").unwrap();
        a.lock().await.unwrap();
        assert!(dir.path().join("nightly.flock").exists());
        a.unlock().await.unwrap();

        let pid = factory.create("pid", "nightly").unwrap();
        pid.lock().await.unwrap();
        assert!(dir.path().join("nightly.lock").exists());
        pid.unlock().await.unwrap();
    }
}
