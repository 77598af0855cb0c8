pub mod config;
pub use config::{ExecutionMode, PoolConfig, SchedulerConfig, SequentialConfig};

pub mod error;
pub use error::CoreError;

pub mod lifecycle;
pub use lifecycle::Lifecycle;

pub mod state;
pub use state::StepTable;

pub mod runner;
pub use runner::{InProcess, TaskExecution, TaskRunner};

pub mod pool;
pub use pool::PausablePool;

pub mod scheduler;
pub use scheduler::{PoolScheduler, Scheduler, SequentialScheduler};

pub mod dispatch;
pub use dispatch::Dispatcher;

pub mod factory;
pub use factory::{SchedulerCtor, SchedulerFactory};
