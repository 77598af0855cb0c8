//! Fixed-size executor whose task starts can be suspended.
//!
//! `pause()` closes a gate that every task passes through right before it starts; tasks that are
//! already running are not affected. The gate flag is checked, and the start recorded, while holding
//! the gate's lock, so once `pause()` returns no new task can begin until `resume()`.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    runtime::Handle,
    sync::{Semaphore, watch},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

pub struct PausablePool {
    threads: usize,
    permits: Arc<Semaphore>,
    paused: watch::Sender<bool>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl PausablePool {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (paused, _) = watch::channel(false);
        Self {
            threads,
            permits: Arc::new(Semaphore::new(threads)),
            paused,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Stop starting new tasks. Returns once the gate is closed.
    pub fn pause(&self) {
        self.paused.send_replace(true);
        debug!("pool paused");
    }

    /// Reopen the gate and wake every waiting task.
    pub fn resume(&self) {
        self.paused.send_replace(false);
        debug!("pool resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Returns `true` once `shutdown` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of tasks spawned and not yet finished (waiting at the gate or running).
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Queue a task.
    ///
    /// Once admitted (gate open and a slot free) `on_start` is called under the gate lock and
    /// `job` runs with a token cancelled on shutdown. If the pool shuts down before the task
    /// is admitted, `on_cancel` runs instead of `job`.
    ///
    /// Returns `false` (and runs nothing) if the pool is already shut down.
    pub fn spawn<S, F, Fut, C>(&self, handle: &Handle, on_start: S, job: F, on_cancel: C) -> bool
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return false;
        }

        let permits = Arc::clone(&self.permits);
        let mut gate = self.paused.subscribe();
        let cancel = self.cancel.clone();

        self.tracker.spawn_on(
            async move {
                let mut on_start = Some(on_start);
                let permit = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            on_cancel();
                            return;
                        }
                        open = async { gate.wait_for(|paused| !*paused).await.is_ok() } => {
                            if !open {
                                on_cancel();
                                return;
                            }
                        }
                    }

                    let permit = tokio::select! {
                        _ = cancel.cancelled() => {
                            on_cancel();
                            return;
                        }
                        permit = Arc::clone(&permits).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => {
                                on_cancel();
                                return;
                            }
                        },
                    };

                    // Paused while waiting for a slot: give the slot back and wait again.
                    let admitted = {
                        let paused = gate.borrow_and_update();
                        if *paused {
                            false
                        } else {
                            if let Some(f) = on_start.take() {
                                f();
                            }
                            true
                        }
                    };
                    if admitted {
                        break permit;
                    }
                };

                job(cancel).await;
                drop(permit);
            },
            handle,
        );
        true
    }

    /// Reject new work, cancel in-flight tasks, and wait up to `timeout` for them to finish.
    ///
    /// Returns `false` if some tasks were still running when the timeout expired.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        self.permits.close();
        self.tracker.close();

        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                in_flight = self.tracker.len(),
                timeout_ms = timeout.as_millis() as u64,
                "pool shutdown timed out; abandoning in-flight tasks"
            );
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn paused_pool_starts_nothing_until_resumed() {
        let pool = PausablePool::new(2);
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = Handle::current();

        pool.pause();
        for _ in 0..5 {
            let s = Arc::clone(&started);
            let f = Arc::clone(&finished);
            assert!(pool.spawn(
                &handle,
                move || {
                    s.fetch_add(1, Ordering::SeqCst);
                },
                move |_| async move {
                    f.fetch_add(1, Ordering::SeqCst);
                },
                || {},
            ));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(pool.in_flight(), 5);

        pool.resume();
        tokio::time::timeout(Duration::from_secs(5), async {
            while finished.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all tasks should run after resume");
        assert_eq!(started.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_by_threads() {
        let pool = PausablePool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handle = Handle::current();

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(
                &handle,
                || {},
                move |_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                },
                || {},
            );
        }

        assert!(pool.shutdown_after_idle().await);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_tasks() {
        let pool = PausablePool::new(1);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let handle = Handle::current();

        pool.pause();
        for _ in 0..3 {
            let c = Arc::clone(&cancelled);
            pool.spawn(
                &handle,
                || {},
                |_| async {},
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        assert!(pool.shutdown(Duration::from_secs(5)).await);
        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
        assert!(!pool.spawn(&handle, || {}, |_| async {}, || {}));
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_task() {
        let pool = PausablePool::new(1);
        let handle = Handle::current();
        pool.spawn(
            &handle,
            || {},
            |_| async {
                // ignores cancellation
                tokio::time::sleep(Duration::from_secs(3600)).await;
            },
            || {},
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!pool.shutdown(Duration::from_millis(50)).await);
    }

    impl PausablePool {
        async fn shutdown_after_idle(&self) -> bool {
            while self.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.shutdown(Duration::from_secs(1)).await
        }
    }
}
