//! Routes every task to the backend matching its step.
//!
//! | step                                   | local mode | cluster mode |
//! |----------------------------------------|------------|--------------|
//! | generator (any parallelization)        | pool       | pool         |
//! | `NotNeeded`                            | sequential | sequential   |
//! | `Standard` / `OwnParallelization`      | pool       | cluster      |

use std::sync::Arc;

use async_trait::async_trait;
use plume_model::{Parallelization, SchedulerState, Step, StepId, StepStatus, TaskContext, TaskResult};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{ExecutionMode, SchedulerConfig},
    error::CoreError,
    factory::SchedulerFactory,
    lifecycle::Lifecycle,
    scheduler::Scheduler,
};

const NAME: &str = "dispatcher";

/// Stateless router over the backend schedulers it owns.
///
/// Counters and results are the union of what every backend reports.
pub struct Dispatcher {
    mode: ExecutionMode,
    sequential: Arc<dyn Scheduler>,
    pool: Arc<dyn Scheduler>,
    cluster: Option<Arc<dyn Scheduler>>,
    lifecycle: Lifecycle,
}

impl Dispatcher {
    /// Local dispatcher over a sequential and a pool backend.
    pub fn new(sequential: Arc<dyn Scheduler>, pool: Arc<dyn Scheduler>) -> Self {
        Self {
            mode: ExecutionMode::Local,
            sequential,
            pool,
            cluster: None,
            lifecycle: Lifecycle::new(NAME),
        }
    }

    /// Attach the backend used for parallelizable steps in cluster mode.
    pub fn with_cluster(mut self, cluster: Arc<dyn Scheduler>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Build every backend through `factory`.
    ///
    /// `cluster` names the backend used in cluster mode; it is only created when
    /// `config.mode` is [`ExecutionMode::Cluster`].
    pub fn from_factory(
        factory: &SchedulerFactory,
        config: &SchedulerConfig,
        cluster: &str,
    ) -> Result<Self, CoreError> {
        let mut dispatcher = Self::new(
            factory.create("sequential", config)?,
            factory.create("pool", config)?,
        )
        .with_mode(config.mode);
        if config.mode == ExecutionMode::Cluster {
            dispatcher = dispatcher.with_cluster(factory.create(cluster, config)?);
        }
        Ok(dispatcher)
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Backend in charge of `step`.
    pub fn backend_for(&self, step: &Step) -> Result<&Arc<dyn Scheduler>, CoreError> {
        if step.is_generator() {
            return Ok(&self.pool);
        }
        match (step.parallelization, self.mode) {
            (Parallelization::NotNeeded, _) => Ok(&self.sequential),
            (_, ExecutionMode::Local) => Ok(&self.pool),
            (_, ExecutionMode::Cluster) => self.cluster.as_ref().ok_or_else(|| CoreError::NoBackend {
                step: step.id.to_string(),
                reason: "cluster mode without a cluster scheduler".to_string(),
            }),
        }
    }

    fn backends(&self) -> impl Iterator<Item = &Arc<dyn Scheduler>> {
        [&self.sequential, &self.pool]
            .into_iter()
            .chain(self.cluster.as_ref())
    }
}

#[async_trait]
impl Scheduler for Dispatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> SchedulerState {
        self.lifecycle.state()
    }

    fn start(&self) -> Result<(), CoreError> {
        if self.lifecycle.state() == SchedulerState::Stopped {
            return Err(CoreError::Stopped { scheduler: NAME });
        }
        for backend in self.backends() {
            if backend.state() == SchedulerState::Created {
                backend.start()?;
            }
        }
        self.lifecycle.start()?;
        info!(mode = ?self.mode, cluster = self.cluster.is_some(), "dispatcher started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        if !self.lifecycle.stop() {
            return Ok(());
        }
        let mut first_err = None;
        for backend in self.backends() {
            if let Err(e) = backend.stop().await {
                warn!(backend = backend.name(), error = %e, "backend failed to stop");
                first_err.get_or_insert(e);
            }
        }
        info!("dispatcher stopped");
        first_err.map_or(Ok(()), Err)
    }

    fn pause(&self) -> Result<(), CoreError> {
        self.lifecycle.pause()?;
        for backend in self.backends() {
            backend.pause()?;
        }
        Ok(())
    }

    fn resume(&self) -> Result<(), CoreError> {
        self.lifecycle.resume()?;
        for backend in self.backends() {
            backend.resume()?;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, step, task), fields(step = %step.id, task = %task.id))]
    fn submit(&self, step: &Step, task: TaskContext) -> Result<(), CoreError> {
        self.lifecycle.check_submit()?;
        let backend = self.backend_for(step)?;
        debug!(backend = backend.name(), "routing task");
        backend.submit(step, task)
    }

    fn submit_all(&self, step: &Step, tasks: Vec<TaskContext>) -> Result<(), CoreError> {
        self.lifecycle.check_submit()?;
        self.backend_for(step)?.submit_all(step, tasks)
    }

    fn status(&self, step: &StepId) -> StepStatus {
        let mut total = StepStatus::empty(step.clone());
        for backend in self.backends() {
            total.merge(&backend.status(step));
        }
        total
    }

    fn results(&self, step: &StepId) -> Vec<TaskResult> {
        self.backends()
            .flat_map(|backend| backend.results(step))
            .collect()
    }

    async fn wait_end_of_tasks(&self, step: &StepId) {
        for backend in self.backends() {
            backend.wait_end_of_tasks(step).await;
        }
    }
}
