use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use crate::error::LockError;

/// View of the live processes of this host.
pub trait ProcessTable: Send + Sync + 'static {
    /// Pids of the live processes, restricted to processes called `name` when given.
    fn live_pids(&self, name: Option<&str>) -> Result<HashSet<u32>, LockError>;

    fn is_alive(&self, pid: u32) -> Result<bool, LockError> {
        Ok(self.live_pids(None)?.contains(&pid))
    }
}

/// Linux kernels truncate `comm` to 15 bytes.
const COMM_LEN: usize = 15;

fn same_name(actual: &str, wanted: &str) -> bool {
    let actual = actual.rsplit('/').next().unwrap_or(actual);
    let wanted = wanted.rsplit('/').next().unwrap_or(wanted);
    if actual == wanted {
        return true;
    }
    actual.len() == COMM_LEN && wanted.len() > COMM_LEN && wanted.starts_with(actual)
}

/// The real process table of the host.
///
/// Reads `/proc` on Linux and asks `ps` on other Unix systems.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl SystemProcesses {
    #[cfg(target_os = "linux")]
    fn scan(&self) -> Result<Vec<(u32, String)>, LockError> {
        let proc = std::path::Path::new("/proc");
        let entries = std::fs::read_dir(proc).map_err(|e| LockError::io(proc, e))?;

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // The process may exit between listing and reading.
            let comm = std::fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
            out.push((pid, comm.trim_end().to_string()));
        }
        Ok(out)
    }

    #[cfg(not(target_os = "linux"))]
    fn scan(&self) -> Result<Vec<(u32, String)>, LockError> {
        let output = std::process::Command::new("ps")
            .args(["-A", "-o", "pid=,comm="])
            .output()
            .map_err(|e| LockError::ProcessTable(format!("ps: {e}")))?;
        if !output.status.success() {
            return Err(LockError::ProcessTable(format!("ps exited with {}", output.status)));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| {
                let line = line.trim_start();
                let (pid, comm) = line.split_once(char::is_whitespace)?;
                Some((pid.parse().ok()?, comm.trim().to_string()))
            })
            .collect())
    }
}

impl ProcessTable for SystemProcesses {
    fn live_pids(&self, name: Option<&str>) -> Result<HashSet<u32>, LockError> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|(_, comm)| name.is_none_or(|n| same_name(comm, n)))
            .map(|(pid, _)| pid)
            .collect())
    }
}

/// A process table maintained by hand.
///
/// Used to simulate processes appearing and dying, or to embed the lockers in an environment
/// whose liveness comes from elsewhere.
#[derive(Debug, Default)]
pub struct StaticProcesses {
    procs: RwLock<HashMap<u32, String>>,
}

impl StaticProcesses {
    pub fn new<I, S>(procs: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        Self {
            procs: RwLock::new(procs.into_iter().map(|(p, n)| (p, n.into())).collect()),
        }
    }

    pub fn spawn(&self, pid: u32, name: impl Into<String>) {
        self.procs.write().unwrap().insert(pid, name.into());
    }

    pub fn kill(&self, pid: u32) {
        self.procs.write().unwrap().remove(&pid);
    }
}

impl ProcessTable for StaticProcesses {
    fn live_pids(&self, name: Option<&str>) -> Result<HashSet<u32>, LockError> {
        let procs = self.procs.read().unwrap();
        Ok(procs
            .iter()
            .filter(|(_, comm)| name.is_none_or(|n| same_name(comm, n)))
            .map(|(pid, _)| *pid)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_compare_by_basename_and_truncated_comm() {
        assert!(same_name("plume-worker", "/usr/bin/plume-worker"));
        assert!(same_name("plume-pipeline-", "plume-pipeline-runner"));
        assert!(!same_name("plume", "plume-worker"));
    }

    #[test]
    fn static_table_tracks_spawn_and_kill() {
        let table = StaticProcesses::new([(10, "plume"), (11, "other")]);
        assert_eq!(table.live_pids(Some("plume")).unwrap(), HashSet::from([10]));

        table.spawn(12, "plume");
        table.kill(10);
        assert_eq!(table.live_pids(Some("plume")).unwrap(), HashSet::from([12]));
        assert!(table.is_alive(11).unwrap());
        assert!(!table.is_alive(10).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn system_table_sees_this_process() {
        assert!(SystemProcesses.is_alive(std::process::id()).unwrap());
    }
}
