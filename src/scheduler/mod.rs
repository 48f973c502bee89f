//! Periodic background tasks with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Context handed to a task on every run.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delay between the end of one run and the start of the next.
    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: Context) -> Result<()>;
}

pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Starts running `task` every `task.interval()`. Must be called from
    /// inside a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock().push(handle);
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            error!(
                                task = task.name(),
                                run_id,
                                error = %e,
                                "Background task failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        debug!(task = task.name(), runs = run_id, "Background task stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Signals every task to stop and waits for them. A run in progress
    /// finishes first.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            task.await
                .map_err(|e| Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        info!(tasks = count, "Scheduler shut down");
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        interval: Duration,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::ObjectStore("unreachable".to_string()));
            }
            Ok(())
        }
    }

    fn task(runs: &Arc<AtomicUsize>, fail: bool) -> Arc<CountingTask> {
        Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            runs: runs.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn test_task_runs_periodically() -> Result<()> {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.register(task(&runs, false));
        assert_eq!(scheduler.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runs.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().await
    }

    #[tokio::test]
    async fn test_failing_task_keeps_running() -> Result<()> {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.register(task(&runs, true));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(runs.load(Ordering::SeqCst) > 1);

        scheduler.shutdown().await
    }

    #[tokio::test]
    async fn test_no_runs_after_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.register(task(&runs, false));

        tokio::time::sleep(Duration::from_millis(25)).await;
        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        assert!(start.elapsed() < Duration::from_millis(100));

        let before = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), before);
        Ok(())
    }
}
