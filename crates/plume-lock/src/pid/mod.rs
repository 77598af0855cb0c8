//! Host-local lock elected through pid marker files.
//!
//! Every competitor writes `{name}-{pid}-{token}.pid` holding its creation time; the token tells
//! apart lockers of one process. The oldest live competitor creates the shared `{name}.lock` marker
//! and records itself in `{name}-{pid}-{token}.pidlock`. Markers of dead pids are swept on every
//! poll; a lock marker with no live holder is swept every `check_every` polls.
//!
//! Marker files are read and written on the blocking pool.

mod process;
pub use process::{ProcessTable, StaticProcesses, SystemProcesses};

use std::{
    collections::HashSet,
    fs::OpenOptions,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use plume_model::{EpochMs, now_ms};
use tracing::{debug, instrument, trace, warn};

use crate::{
    error::LockError,
    locker::{Locker, LockerKind, Slot},
};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct PidLockConfig {
    /// Directory holding the markers. Shared by every competitor.
    pub dir: PathBuf,
    pub name: String,
    /// Only processes with this name count as live competitors.
    pub process_name: Option<String>,
    pub poll_interval: Duration,
    /// Stale lock markers are checked every this many polls.
    pub check_every: u32,
    /// Pause after a release so waiters get a chance to observe it.
    pub release_pause: Duration,
    /// Pid written in the markers.
    pub pid: u32,
}

impl Default for PidLockConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("plume").join("locks"),
            name: "plume".into(),
            process_name: None,
            poll_interval: Duration::from_secs(1),
            check_every: 12,
            release_pause: Duration::from_millis(200),
            pid: std::process::id(),
        }
    }
}

pub struct PidLocker {
    election: Arc<Election>,
    held: Slot<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Competitor {
    pid: u32,
    token: u64,
}

struct Markers {
    /// Every competitor with its creation time.
    pids: Vec<(Competitor, EpochMs)>,
    pidlocks: Vec<Competitor>,
}

/// Synchronous marker bookkeeping of one locker.
struct Election {
    cfg: PidLockConfig,
    processes: Arc<dyn ProcessTable>,
    token: u64,
}

impl PidLocker {
    pub fn new(cfg: PidLockConfig, processes: Arc<dyn ProcessTable>) -> Result<Self, LockError> {
        if cfg.name.is_empty() || cfg.name.contains(['/', '\\']) {
            return Err(LockError::InvalidConfig(format!(
                "pid lock name '{}' must be a non-empty file name",
                cfg.name
            )));
        }
        if cfg.check_every == 0 {
            return Err(LockError::InvalidConfig("check_every must be at least 1".into()));
        }
        Ok(Self {
            election: Arc::new(Election {
                cfg,
                processes,
                token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            }),
            held: Slot::new(),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.is_held()
    }

    pub fn lock_path(&self) -> PathBuf {
        self.election.lock_path()
    }

    /// This locker's competitor marker.
    pub fn pid_marker_path(&self) -> PathBuf {
        self.election.marker(self.election.me(), "pid")
    }

    /// This locker's holder marker, present while it owns the lock.
    pub fn pidlock_path(&self) -> PathBuf {
        self.election.marker(self.election.me(), "pidlock")
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, LockError>
    where
        T: Send + 'static,
        F: FnOnce(&Election) -> Result<T, LockError> + Send + 'static,
    {
        let election = Arc::clone(&self.election);
        tokio::task::spawn_blocking(move || f(&election))
            .await
            .map_err(|e| LockError::io(&self.election.cfg.dir, std::io::Error::other(e.to_string())))?
    }
}

impl Election {
    fn me(&self) -> Competitor {
        Competitor {
            pid: self.cfg.pid,
            token: self.token,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.cfg.dir.join(format!("{}.lock", self.cfg.name))
    }

    fn marker(&self, who: Competitor, ext: &str) -> PathBuf {
        self.cfg
            .dir
            .join(format!("{}-{}-{}.{ext}", self.cfg.name, who.pid, who.token))
    }

    fn register(&self) -> Result<(), LockError> {
        let dir = &self.cfg.dir;
        std::fs::create_dir_all(dir).map_err(|e| LockError::io(dir, e))?;
        let marker = self.marker(self.me(), "pid");
        std::fs::write(&marker, now_ms().to_string()).map_err(|e| LockError::io(&marker, e))
    }

    fn read_markers(&self) -> Result<Markers, LockError> {
        let dir = &self.cfg.dir;
        let prefix = format!("{}-", self.cfg.name);
        let mut markers = Markers {
            pids: Vec::new(),
            pidlocks: Vec::new(),
        };

        for entry in std::fs::read_dir(dir).map_err(|e| LockError::io(dir, e))? {
            let entry = entry.map_err(|e| LockError::io(dir, e))?;
            let file_name = entry.file_name();
            let Some(rest) = file_name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
                continue;
            };

            if let Some(who) = rest.strip_suffix(".pid").and_then(parse_competitor) {
                // Unreadable or half-written markers rank last.
                let created = std::fs::read_to_string(entry.path())
                    .ok()
                    .and_then(|s| s.trim().parse::<EpochMs>().ok())
                    .unwrap_or(EpochMs::MAX);
                markers.pids.push((who, created));
            } else if let Some(who) = rest.strip_suffix(".pidlock").and_then(parse_competitor) {
                markers.pidlocks.push(who);
            }
        }
        Ok(markers)
    }

    fn live_pids(&self) -> Result<HashSet<u32>, LockError> {
        let mut live = self.processes.live_pids(self.cfg.process_name.as_deref())?;
        live.insert(self.cfg.pid);
        Ok(live)
    }

    /// One election round. Returns true once this competitor holds the lock.
    fn poll(&self, round: u32) -> Result<bool, LockError> {
        let live = self.live_pids()?;
        let markers = self.read_markers()?;

        for &(who, _) in markers.pids.iter().filter(|(who, _)| !live.contains(&who.pid)) {
            warn!(lock = %self.cfg.name, pid = who.pid, "removing pid marker of dead process");
            remove_if_exists(&self.marker(who, "pid"))?;
        }

        if round % self.cfg.check_every == 0 {
            self.sweep_stale_lock(&markers.pidlocks, &live)?;
        }

        let oldest = markers
            .pids
            .iter()
            .filter(|(who, _)| live.contains(&who.pid))
            .min_by_key(|(who, created)| (*created, who.pid, who.token))
            .map(|(who, _)| *who);
        if oldest != Some(self.me()) {
            trace!(lock = %self.cfg.name, ?oldest, "not the oldest competitor");
            return Ok(false);
        }

        // The pidlock goes first so a sweeper never sees our lock marker without its holder.
        let pidlock = self.marker(self.me(), "pidlock");
        std::fs::write(&pidlock, self.cfg.pid.to_string()).map_err(|e| LockError::io(&pidlock, e))?;

        let lock = self.lock_path();
        match OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                remove_if_exists(&pidlock)?;
                Ok(false)
            }
            Err(e) => {
                remove_if_exists(&pidlock)?;
                Err(LockError::io(&lock, e))
            }
        }
    }

    fn sweep_stale_lock(&self, pidlocks: &[Competitor], live: &HashSet<u32>) -> Result<(), LockError> {
        let lock = self.lock_path();
        if !lock.exists() || pidlocks.iter().any(|who| live.contains(&who.pid)) {
            return Ok(());
        }

        warn!(lock = %self.cfg.name, holders = ?pidlocks, "removing lock marker without a live holder");
        remove_if_exists(&lock)?;
        for &who in pidlocks {
            remove_if_exists(&self.marker(who, "pidlock"))?;
        }
        Ok(())
    }

    fn cleanup(&self) {
        for ext in ["pidlock", "pid"] {
            if let Err(e) = remove_if_exists(&self.marker(self.me(), ext)) {
                warn!(lock = %self.cfg.name, error = %e, "failed to clean up pid marker");
            }
        }
    }

    fn release(&self) -> Result<(), LockError> {
        let pidlock = self.marker(self.me(), "pidlock");
        // A sweeper may have taken our lock marker away already; never remove someone else's.
        if pidlock.exists() {
            remove_if_exists(&self.lock_path())?;
        }
        remove_if_exists(&pidlock)?;
        remove_if_exists(&self.marker(self.me(), "pid"))
    }
}

/// `{pid}-{token}`
fn parse_competitor(s: &str) -> Option<Competitor> {
    let (pid, token) = s.split_once('-')?;
    Some(Competitor {
        pid: pid.parse().ok()?,
        token: token.parse().ok()?,
    })
}

#[async_trait]
impl Locker for PidLocker {
    fn name(&self) -> &str {
        &self.election.cfg.name
    }

    fn kind(&self) -> LockerKind {
        LockerKind::Pid
    }

    #[instrument(level = "debug", skip(self), fields(lock = %self.election.cfg.name, pid = self.election.cfg.pid))]
    async fn lock(&self) -> Result<(), LockError> {
        let Some(acquiring) = self.held.begin(&self.election.cfg.name)? else {
            return Ok(());
        };

        self.blocking(Election::register).await?;
        let mut round: u32 = 1;
        loop {
            match self.blocking(move |e| e.poll(round)).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    let _ = self
                        .blocking(|e| {
                            e.cleanup();
                            Ok(())
                        })
                        .await;
                    return Err(err);
                }
            }
            round = round.wrapping_add(1);
            tokio::time::sleep(self.election.cfg.poll_interval).await;
        }

        acquiring.hold(());
        debug!("pid lock acquired");
        Ok(())
    }

    async fn unlock(&self) -> Result<(), LockError> {
        if self.held.take().is_none() {
            return Ok(());
        }

        self.blocking(Election::release).await?;
        debug!(lock = %self.election.cfg.name, "pid lock released");

        tokio::time::sleep(self.election.cfg.release_pause).await;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), LockError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LockError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, pid: u32) -> PidLockConfig {
        PidLockConfig {
            dir: dir.to_path_buf(),
            name: "ingest".into(),
            poll_interval: Duration::from_millis(20),
            release_pause: Duration::from_millis(5),
            pid,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn waiter_acquires_after_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let procs = Arc::new(StaticProcesses::new([(1001, "plume"), (1002, "plume")]));
        let a = PidLocker::new(config(dir.path(), 1001), procs.clone()).unwrap();
        let b = Arc::new(PidLocker::new(config(dir.path(), 1002), procs).unwrap());

        a.lock().await.unwrap();
        assert!(a.lock_path().exists());

        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.lock().await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());

        a.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("b should acquire after release")
            .unwrap()
            .unwrap();
        assert!(b.is_held());
        assert!(!a.pid_marker_path().exists());

        b.unlock().await.unwrap();
        assert!(!b.lock_path().exists());
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn lock_of_dead_holder_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        let procs = Arc::new(StaticProcesses::new([(1001, "plume"), (1002, "plume")]));
        let a = PidLocker::new(config(dir.path(), 1001), procs.clone()).unwrap();
        a.lock().await.unwrap();

        procs.kill(1001);
        let mut cfg = config(dir.path(), 1002);
        cfg.check_every = 2;
        let b = PidLocker::new(cfg, procs).unwrap();

        tokio::time::timeout(Duration::from_secs(2), b.lock())
            .await
            .expect("stale lock should be swept")
            .unwrap();
        assert!(!a.pid_marker_path().exists());
        assert!(!a.pidlock_path().exists());
        assert!(b.pidlock_path().exists());
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn lockers_of_one_process_keep_their_own_markers() {
        let dir = tempfile::tempdir().unwrap();
        let procs = Arc::new(StaticProcesses::new([(1001, "plume")]));
        let a = PidLocker::new(config(dir.path(), 1001), procs.clone()).unwrap();
        let b = Arc::new(PidLocker::new(config(dir.path(), 1001), procs).unwrap());
        assert_ne!(a.pidlock_path(), b.pidlock_path());

        a.lock().await.unwrap();
        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.lock().await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());
        assert!(a.pidlock_path().exists());

        a.unlock().await.unwrap();
        assert!(!a.pid_marker_path().exists());
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("b should acquire after release")
            .unwrap()
            .unwrap();
        assert!(b.lock_path().exists());
        b.unlock().await.unwrap();
        assert!(!b.lock_path().exists());
    }

    #[test]
    fn marker_names_carry_pid_and_token() {
        assert_eq!(parse_competitor("1001-7"), Some(Competitor { pid: 1001, token: 7 }));
        assert_eq!(parse_competitor("1001"), None);
        assert_eq!(parse_competitor("lock-1001-7"), None);
    }

    #[test]
    fn names_must_be_file_names() {
        let procs: Arc<dyn ProcessTable> = Arc::new(StaticProcesses::default());
        let cfg = PidLockConfig {
            name: "a/b".into(),
            ..Default::default()
        };
        assert!(matches!(
            PidLocker::new(cfg, procs),
            Err(LockError::InvalidConfig(_))
        ));
    }
}
