//! Periodic background task runner.
//!
//! Each registered task gets its own single-threaded timer loop: ticks of
//! the same task never overlap, while different tasks interleave freely
//! with each other and with foreground operations. A tick that fails is
//! logged and skipped; the loop keeps running until shutdown is signalled.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Context handed to a task on each tick.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
}

/// A task that runs on a fixed period.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute one tick
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Owns the timer loops of the registered tasks and shuts them down
/// together.
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Registers a periodic task. Must be called within a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.push(handle);
        }
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut run_id = 0u64;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                        };
                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "background tick failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Signals shutdown and awaits each in-flight tick, bounded by
    /// `timeout`; a loop that does not stop in time is aborted.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let handles: Vec<JoinHandle<()>> = match self.tasks.write() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for mut handle in handles {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(joined) => joined?,
                Err(_) => {
                    tracing::warn!("background task did not stop within timeout, aborting");
                    handle.abort();
                }
            }
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Dropping the scheduler without `shutdown` still signals the timer loops
/// to stop; they are detached, not awaited.
impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown_tx.send(()).ok();
    }
}
