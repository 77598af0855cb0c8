use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use crate::{
    config::SchedulerConfig,
    error::CoreError,
    runner::{InProcess, TaskRunner},
    scheduler::{PoolScheduler, Scheduler, SequentialScheduler},
};

/// Builds one backend scheduler from the shared configuration.
pub type SchedulerCtor =
    Box<dyn Fn(&SchedulerConfig) -> Result<Arc<dyn Scheduler>, CoreError> + Send + Sync>;

/// Name-keyed registry of scheduler constructors, filled at start-up.
#[derive(Default)]
pub struct SchedulerFactory {
    ctors: HashMap<String, SchedulerCtor>,
}

impl SchedulerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory knowing the in-process backends: `sequential` and `pool`.
    pub fn with_builtin(runner: Arc<dyn TaskRunner>) -> Self {
        let mut factory = Self::new();

        let r = Arc::clone(&runner);
        factory.register("sequential", move |config: &SchedulerConfig| {
            let exec = InProcess::new(Arc::clone(&r));
            Ok(Arc::new(SequentialScheduler::new(exec, &config.sequential)) as Arc<dyn Scheduler>)
        });

        factory.register("pool", move |config: &SchedulerConfig| {
            if config.pool.threads == 0 {
                return Err(CoreError::InvalidConfig("pool.threads must be > 0".into()));
            }
            let exec = InProcess::new(Arc::clone(&runner));
            Ok(Arc::new(PoolScheduler::new(exec, &config.pool)) as Arc<dyn Scheduler>)
        });

        factory
    }

    /// Register (or replace) the constructor for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn(&SchedulerConfig) -> Result<Arc<dyn Scheduler>, CoreError> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(scheduler = %name, "registering scheduler");
        self.ctors.insert(name, Box::new(ctor));
        self
    }

    pub fn create(
        &self,
        name: &str,
        config: &SchedulerConfig,
    ) -> Result<Arc<dyn Scheduler>, CoreError> {
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| CoreError::UnknownScheduler(name.to_string()))?;
        ctor(config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use plume_model::{SchedulerState, Step, TaskContext, TaskOutput};

    use super::*;
    use crate::{config::ExecutionMode, dispatch::Dispatcher};

    fn factory() -> SchedulerFactory {
        fn ok(_: &TaskContext) -> Result<TaskOutput, String> {
            Ok(TaskOutput::default())
        }
        SchedulerFactory::with_builtin(Arc::new(ok))
    }

    #[test]
    fn builtin_names() {
        let f = factory();
        assert_eq!(f.names(), vec!["pool", "sequential"]);
        assert!(f.contains("pool"));
    }

    #[test]
    fn unknown_name_is_an_error() {
        let err = factory()
            .create("hadoop", &SchedulerConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::UnknownScheduler(name) if name == "hadoop"));
    }

    #[test]
    fn zero_threads_is_rejected() {
        let mut config = SchedulerConfig::default();
        config.pool.threads = 0;
        assert!(matches!(
            factory().create("pool", &config),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn created_schedulers_are_fresh() {
        let f = factory();
        let s = f.create("sequential", &SchedulerConfig::default()).unwrap();
        assert_eq!(s.name(), "sequential");
        assert_eq!(s.state(), SchedulerState::Created);
    }

    #[test]
    fn cluster_dispatcher_needs_a_registered_cluster_backend() {
        let config = SchedulerConfig {
            mode: ExecutionMode::Cluster,
            ..Default::default()
        };
        let err = Dispatcher::from_factory(&factory(), &config, "batch")
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::UnknownScheduler(_)));
    }

    #[tokio::test]
    async fn dispatcher_built_from_factory_runs_tasks() {
        let mut f = factory();
        f.register("batch", |config: &SchedulerConfig| {
            fn ok(_: &TaskContext) -> Result<TaskOutput, String> {
                Ok(TaskOutput::default())
            }
            let exec = InProcess::new(Arc::new(ok));
            Ok(Arc::new(PoolScheduler::new(exec, &config.pool).with_name("batch")) as Arc<dyn Scheduler>)
        });
        let config = SchedulerConfig {
            mode: ExecutionMode::Cluster,
            ..Default::default()
        };

        let d = Dispatcher::from_factory(&f, &config, "batch").unwrap();
        d.start().unwrap();
        let step = Step::new("s", "m");
        d.submit(&step, TaskContext::new(1, "s", "c")).unwrap();
        tokio::time::timeout(Duration::from_secs(5), d.wait_end_of_tasks(&step.id))
            .await
            .unwrap();
        assert_eq!(d.results(&step.id)[0].backend, "batch");
        d.stop().await.unwrap();
    }
}
