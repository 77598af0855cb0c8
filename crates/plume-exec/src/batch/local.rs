use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use plume_model::Counters;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::watch,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::runtime::{BatchRuntime, JobId, JobSpec, JobState};
use crate::{
    error::{ExecError, ExecResult},
    limits::{RlimitConfig, attach_rlimits},
    util::kill_graceful,
    worker::parse_counter_line,
};

/// Worker program of a [`LocalBatchRuntime`]; started as `program args... <record>`.
#[derive(Clone, Debug)]
pub struct LocalBatchConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub rlimits: RlimitConfig,
    pub kill_grace: Duration,
}

impl Default for LocalBatchConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            env: Vec::new(),
            rlimits: RlimitConfig::default(),
            kill_grace: Duration::from_secs(5),
        }
    }
}

struct Job {
    name: String,
    state: watch::Receiver<Option<JobState>>,
    cancel: CancellationToken,
    counters: Arc<Mutex<Counters>>,
}

/// Batch runtime running every job on this host, one worker process per input record.
///
/// Workers report counters on stderr (`reporter:counter:<group>,<name>,<amount>`); the other
/// stderr lines are logged at debug level and stdout goes to `worker-{n}.out` in the job directory.
pub struct LocalBatchRuntime {
    cfg: Arc<LocalBatchConfig>,
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl LocalBatchRuntime {
    pub fn new(cfg: LocalBatchConfig) -> ExecResult<Self> {
        if cfg.program.is_empty() {
            return Err(ExecError::MissingProgram);
        }
        Ok(Self {
            cfg: Arc::new(cfg),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Jobs known to the runtime and not final yet.
    pub fn running(&self) -> usize {
        let jobs = self.jobs.lock().unwrap();
        jobs.values().filter(|j| j.state.borrow().is_none()).count()
    }

    fn job<T>(&self, id: &JobId, f: impl FnOnce(&Job) -> T) -> ExecResult<T> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(id)
            .map(f)
            .ok_or_else(|| ExecError::UnknownJob(id.to_string()))
    }
}

#[async_trait]
impl BatchRuntime for LocalBatchRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(level = "debug", skip_all, fields(job = %spec.name))]
    async fn submit(&self, spec: JobSpec) -> ExecResult<JobId> {
        let input = tokio::fs::read_to_string(&spec.input).await?;
        let records: Vec<String> = input
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        let id = JobId::new(format!("job-{}", Uuid::new_v4().simple()));
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let counters = Arc::new(Mutex::new(Counters::new()));

        info!(job = %id, records = records.len(), "job submitted");
        tokio::spawn(run_job(
            Arc::clone(&self.cfg),
            spec.work_dir.clone(),
            records,
            cancel.clone(),
            Arc::clone(&counters),
            tx,
        ));

        self.jobs.lock().unwrap().insert(
            id.clone(),
            Job {
                name: spec.name,
                state: rx,
                cancel,
                counters,
            },
        );
        Ok(id)
    }

    async fn wait(&self, job: &JobId) -> ExecResult<JobState> {
        let mut rx = self.job(job, |j| j.state.clone())?;
        loop {
            if let Some(state) = rx.borrow_and_update().clone() {
                return Ok(state);
            }
            if rx.changed().await.is_err() {
                return Err(ExecError::Io(format!("job {job} lost its runner")));
            }
        }
    }

    async fn kill(&self, job: &JobId) -> ExecResult<()> {
        let (name, cancel) = self.job(job, |j| (j.name.clone(), j.cancel.clone()))?;
        debug!(job = %job, %name, "killing job");
        cancel.cancel();
        Ok(())
    }

    async fn counters(&self, job: &JobId) -> ExecResult<Counters> {
        self.job(job, |j| j.counters.lock().unwrap().clone())
    }

    async fn forget(&self, job: &JobId) {
        self.jobs.lock().unwrap().remove(job);
    }
}

async fn run_job(
    cfg: Arc<LocalBatchConfig>,
    work_dir: PathBuf,
    records: Vec<String>,
    cancel: CancellationToken,
    counters: Arc<Mutex<Counters>>,
    state: watch::Sender<Option<JobState>>,
) {
    if records.is_empty() {
        state.send_replace(Some(JobState::Failed {
            reason: "empty job input".into(),
        }));
        return;
    }

    let mut workers = JoinSet::new();
    for (index, record) in records.into_iter().enumerate() {
        let cfg = Arc::clone(&cfg);
        let work_dir = work_dir.clone();
        let cancel = cancel.clone();
        let counters = Arc::clone(&counters);
        workers.spawn(async move {
            let res = run_worker(&cfg, &work_dir, index, &record, cancel, counters).await;
            (index, res)
        });
    }

    let mut killed = false;
    let mut failure: Option<String> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((_, Err(ExecError::Cancelled))) => killed = true,
            Ok((index, Err(e))) => {
                warn!(record = index, error = %e, "batch worker failed");
                failure.get_or_insert_with(|| format!("record {index}: {e}"));
            }
            Err(e) => {
                failure.get_or_insert_with(|| format!("worker aborted: {e}"));
            }
        }
    }

    let final_state = match (killed, failure) {
        (true, _) => JobState::Killed,
        (false, Some(reason)) => JobState::Failed { reason },
        (false, None) => JobState::Succeeded,
    };
    debug!(state = ?final_state, "job finished");
    state.send_replace(Some(final_state));
}

async fn run_worker(
    cfg: &LocalBatchConfig,
    work_dir: &Path,
    index: usize,
    record: &str,
    cancel: CancellationToken,
    counters: Arc<Mutex<Counters>>,
) -> ExecResult<()> {
    let mut cmd = Command::new(&cfg.program);
    cmd.args(&cfg.args).arg(record);
    cmd.current_dir(work_dir);
    for (k, v) in &cfg.env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null());
    let stdout = File::create(work_dir.join(format!("worker-{index}.out"))).await?;
    cmd.stdout(Stdio::from(stdout.into_std().await));
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    attach_rlimits(&mut cmd, &cfg.rlimits);

    trace!(program = %cfg.program, record, "spawn worker");
    let mut child = cmd.spawn().map_err(|e| ExecError::Spawn(e.to_string()))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::Io("worker stderr not captured".into()))?;
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_counter_line(&line) {
                Some((name, amount)) => {
                    *counters.lock().unwrap().entry(name).or_insert(0) += amount;
                }
                None => debug!(record = index, %line, "worker stderr"),
            }
        }
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            if let Err(e) = kill_graceful(&mut child, cfg.kill_grace).await {
                warn!(record = index, error = %e, "failed to kill batch worker");
            }
            reader.abort();
            return Err(ExecError::Cancelled);
        }
    };
    // drain the remaining counter lines
    let _ = reader.await;

    if !status.success() {
        return Err(match status.code() {
            Some(code) => ExecError::NonZeroExit { code },
            None => ExecError::KilledBySignal,
        });
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runtime(script: &str) -> LocalBatchRuntime {
        LocalBatchRuntime::new(LocalBatchConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into(), "sh".into()],
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap()
    }

    fn job(dir: &Path, records: &[&str]) -> JobSpec {
        let input = dir.join("input.txt");
        std::fs::write(&input, records.join("\n")).unwrap();
        JobSpec {
            name: "plume-test".into(),
            input,
            work_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn one_worker_per_record_and_counters_are_summed() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(r#"echo "reporter:counter:plume,records,1" >&2; echo "$1""#);

        let id = rt.submit(job(dir.path(), &["a", "b", "c"])).await.unwrap();
        assert_eq!(rt.wait(&id).await.unwrap(), JobState::Succeeded);

        let counters = rt.counters(&id).await.unwrap();
        assert_eq!(counters.get("plume.records"), Some(&3));
        let outputs: Vec<_> = (0..3)
            .map(|i| std::fs::read_to_string(dir.path().join(format!("worker-{i}.out"))).unwrap())
            .collect();
        assert_eq!(outputs, ["a\n", "b\n", "c\n"]);
    }

    #[tokio::test]
    async fn failing_record_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(r#"[ "$1" = bad ] && exit 4; exit 0"#);

        let id = rt.submit(job(dir.path(), &["ok", "bad"])).await.unwrap();
        let state = rt.wait(&id).await.unwrap();
        assert_eq!(
            state,
            JobState::Failed {
                reason: "record 1: non-zero exit code: 4".into()
            }
        );
    }

    #[tokio::test]
    async fn empty_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime("exit 0");
        let id = rt.submit(job(dir.path(), &[])).await.unwrap();
        assert!(matches!(rt.wait(&id).await.unwrap(), JobState::Failed { .. }));
    }

    #[tokio::test]
    async fn killed_job_reports_killed() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime("sleep 30");

        let id = rt.submit(job(dir.path(), &["x"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rt.running(), 1);
        rt.kill(&id).await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), rt.wait(&id))
            .await
            .expect("killed job should finish");
        assert_eq!(state.unwrap(), JobState::Killed);
        assert_eq!(rt.running(), 0);

        rt.forget(&id).await;
        assert!(matches!(rt.wait(&id).await, Err(ExecError::UnknownJob(_))));
    }
}
