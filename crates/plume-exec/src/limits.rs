//! Resource limits for task child processes.
//!
//! On Unix the limits are installed with `setrlimit` in a `pre_exec` hook, so the child never runs
//! a single instruction of the task program without them. Elsewhere they are ignored with a warning.

use tokio::process::Command;
#[cfg(not(unix))]
use tracing::warn;

/// Per-task `rlimit`s. `None` keeps the inherited limit.
#[derive(Debug, Clone, Default)]
pub struct RlimitConfig {
    /// `RLIMIT_NOFILE`.
    pub max_open_files: Option<u64>,
    /// `RLIMIT_FSIZE`; a task growing a file past it gets `SIGXFSZ`.
    pub max_file_size_bytes: Option<u64>,
    /// `RLIMIT_CPU`, in seconds of CPU time.
    pub max_cpu_seconds: Option<u64>,
    /// `RLIMIT_AS`.
    pub max_address_space_bytes: Option<u64>,
    /// `RLIMIT_CORE = 0`: failing tasks leave no core files behind.
    pub disable_core_dumps: bool,
}

impl RlimitConfig {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.max_open_files.is_none()
            && self.max_file_size_bytes.is_none()
            && self.max_cpu_seconds.is_none()
            && self.max_address_space_bytes.is_none()
            && !self.disable_core_dumps
    }
}

/// Install `config` on `cmd`. No-op for an empty config.
pub fn attach_rlimits(cmd: &mut Command, config: &RlimitConfig) {
    if config.is_empty() {
        return;
    }

    #[cfg(unix)]
    {
        unix_impl::attach(cmd, unix_impl::resources(config));
    }

    #[cfg(not(unix))]
    {
        let _ = cmd;
        warn!(?config, "rlimits are not supported on this platform; ignoring them");
    }
}

#[cfg(unix)]
mod unix_impl {
    use std::io;

    use tokio::process::Command;

    use super::RlimitConfig;

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    type Resource = libc::__rlimit_resource_t;
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    type Resource = libc::c_int;

    pub(super) fn resources(config: &RlimitConfig) -> Vec<(Resource, u64)> {
        [
            (libc::RLIMIT_NOFILE, config.max_open_files),
            (libc::RLIMIT_FSIZE, config.max_file_size_bytes),
            (libc::RLIMIT_CPU, config.max_cpu_seconds),
            (libc::RLIMIT_AS, config.max_address_space_bytes),
            (libc::RLIMIT_CORE, config.disable_core_dumps.then_some(0)),
        ]
        .into_iter()
        .filter_map(|(resource, value)| value.map(|v| (resource, v)))
        .collect()
    }

    pub(super) fn attach(cmd: &mut Command, limits: Vec<(Resource, u64)>) {
        // SAFETY: the hook only calls `setrlimit`, which is async-signal-safe, and allocates
        // nothing between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                for &(resource, value) in &limits {
                    set(resource, value)?;
                }
                Ok(())
            });
        }
    }

    fn set(resource: Resource, value: u64) -> io::Result<()> {
        let rlim = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

}
