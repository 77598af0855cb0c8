use std::time::Duration;

/// Where the dispatcher sends parallelizable steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Everything runs on this host.
    #[default]
    Local,
    /// Parallelizable steps go to the cluster (batch) backend.
    Cluster,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of tasks allowed to run at the same time.
    pub threads: usize,
    /// How long `stop()` waits for in-flight tasks before giving up on them.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SequentialConfig {
    /// Sleep between two polls of an empty (or paused) queue.
    pub idle_poll: Duration,
}

impl Default for SequentialConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(100),
        }
    }
}

/// Configuration shared by the scheduler constructors of a [`crate::SchedulerFactory`]
/// and by the [`crate::Dispatcher`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub mode: ExecutionMode,
    pub sequential: SequentialConfig,
    pub pool: PoolConfig,
}
