//! Out-of-process execution backends.
//!
//! Both backends exchange a task with a child through a [`TaskFiles`] set:
//! - `process`: one child process per task ([`ProcessExecution`]);
//! - `batch`: one batch job per task ([`BatchExecution`]) on a [`BatchRuntime`].
//!
//! The child side lives in [`worker`].

mod error;
pub use error::{ExecError, ExecResult};

pub mod files;
pub use files::TaskFiles;

pub mod limits;
pub use limits::{RlimitConfig, attach_rlimits};

mod util;
pub use util::kill_graceful;

pub mod worker;

pub mod proc;
pub use proc::{PROCESS_SCHEDULER, ProcessConfig, ProcessExecution, process_scheduler};

pub mod batch;
pub use batch::{
    BATCH_SCHEDULER, BatchConfig, BatchExecution, BatchRuntime, JobId, JobSpec, JobState,
    LocalBatchConfig, LocalBatchRuntime, batch_scheduler,
};

use std::sync::Arc;

use plume_core::{CoreError, Scheduler, SchedulerConfig, SchedulerFactory};

/// Register the `process` and `batch` backends in `factory`.
pub fn register_exec_schedulers(
    factory: &mut SchedulerFactory,
    process: ProcessConfig,
    batch: BatchConfig,
    runtime: Arc<dyn BatchRuntime>,
) {
    factory.register(PROCESS_SCHEDULER, move |config: &SchedulerConfig| {
        let scheduler = process_scheduler(process.clone(), &config.pool)
            .map_err(|e| CoreError::InvalidConfig(format!("{PROCESS_SCHEDULER}: {e}")))?;
        Ok(Arc::new(scheduler) as Arc<dyn Scheduler>)
    });
    factory.register(BATCH_SCHEDULER, move |config: &SchedulerConfig| {
        let scheduler = batch_scheduler(Arc::clone(&runtime), batch.clone(), &config.pool);
        Ok(Arc::new(scheduler) as Arc<dyn Scheduler>)
    });
}

pub mod prelude {
    pub use crate::error::{ExecError, ExecResult};
    pub use crate::{
        BatchConfig, BatchRuntime, LocalBatchConfig, LocalBatchRuntime, ProcessConfig, TaskFiles,
        register_exec_schedulers,
    };
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use plume_core::{Dispatcher, ExecutionMode, TaskRunner};
    use plume_model::{Parallelization, Step, TaskContext, TaskOutput};

    use super::*;

    const SCRIPT: &str = r#"P="${1%.ctx}"; echo '{"success":true}' > "$P.result"; touch "$P.done""#;

    fn factory(dir: &std::path::Path) -> SchedulerFactory {
        fn ok(_: &TaskContext) -> Result<TaskOutput, String> {
            Ok(TaskOutput::default())
        }
        let runner: Arc<dyn TaskRunner> = Arc::new(ok);
        let mut factory = SchedulerFactory::with_builtin(runner);

        let args = vec!["-c".to_string(), SCRIPT.to_string(), "sh".to_string()];
        let runtime = LocalBatchRuntime::new(LocalBatchConfig {
            program: "sh".into(),
            args: args.clone(),
            ..Default::default()
        })
        .unwrap();
        register_exec_schedulers(
            &mut factory,
            ProcessConfig {
                program: "sh".into(),
                args,
                work_dir: dir.join("process"),
                ..Default::default()
            },
            BatchConfig {
                work_dir: dir.join("batch"),
                ..Default::default()
            },
            Arc::new(runtime),
        );
        factory
    }

    #[test]
    fn exec_backends_are_registered_by_name() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            factory(dir.path()).names(),
            vec!["batch", "pool", "process", "sequential"]
        );
    }

    #[test]
    fn process_without_program_is_a_config_error() {
        let mut factory = SchedulerFactory::new();
        let runtime = LocalBatchRuntime::new(LocalBatchConfig {
            program: "true".into(),
            ..Default::default()
        })
        .unwrap();
        register_exec_schedulers(
            &mut factory,
            ProcessConfig::default(),
            BatchConfig::default(),
            Arc::new(runtime),
        );
        assert!(matches!(
            factory.create(PROCESS_SCHEDULER, &SchedulerConfig::default()),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cluster_dispatcher_runs_parallel_steps_as_batch_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            mode: ExecutionMode::Cluster,
            ..Default::default()
        };
        let d = Dispatcher::from_factory(&factory(dir.path()), &config, BATCH_SCHEDULER).unwrap();
        d.start().unwrap();

        let parallel = Step::new("map", "m");
        let serial = Step::new("merge", "m").with_parallelization(Parallelization::NotNeeded);
        d.submit(&parallel, TaskContext::new(1, "map", "c")).unwrap();
        d.submit(&serial, TaskContext::new(2, "merge", "c")).unwrap();

        for step in [&parallel, &serial] {
            tokio::time::timeout(Duration::from_secs(10), d.wait_end_of_tasks(&step.id))
                .await
                .unwrap();
        }
        assert_eq!(d.results(&parallel.id)[0].backend, "batch");
        assert!(d.results(&parallel.id)[0].is_success());
        assert_eq!(d.results(&serial.id)[0].backend, "sequential");
        d.stop().await.unwrap();
    }
}
