//! Background maintenance of the in-memory rate counter store.
//!
//! Fixed windows are reset lazily on the next hit, so keys that are never
//! hit again would stay in memory forever. [`CounterSweeper`] drops expired
//! windows on every tick of a [`BackgroundWorker`], and on demand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::rate_limit::MemoryRateCounter;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Process a single submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on every tick of the worker's interval.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Runs a [`BackgroundRunnable`] on its own task, feeding it submitted tasks
/// and periodic ticks until stopped.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. The first tick fires one full `tick` after start.
    pub fn start(mut runnable: R, tick: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(t) => runnable.run(t).await,
                        None => break,
                    },
                    _ = interval.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues `task` for the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker and waits for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// CounterSweeper
// ---------------------------------------------------------------------------

/// On-demand sweeper tasks.
#[derive(Debug)]
pub enum SweepTask {
    /// Prune immediately and report how many windows were dropped.
    SweepNow { done: Option<oneshot::Sender<usize>> },
}

/// Prunes expired windows from a [`MemoryRateCounter`].
pub struct CounterSweeper {
    counter: Arc<MemoryRateCounter>,
}

impl CounterSweeper {
    #[must_use]
    pub fn new(counter: Arc<MemoryRateCounter>) -> Self {
        Self { counter }
    }

    /// Starts a sweeper pruning every `interval`.
    #[must_use]
    pub fn spawn(counter: Arc<MemoryRateCounter>, interval: Duration) -> BackgroundWorker<Self> {
        BackgroundWorker::start(Self::new(counter), interval)
    }

    fn sweep(&self) -> usize {
        let dropped = self.counter.prune_expired();
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("tenantgate_rate_windows").set(self.counter.len() as f64);
        if dropped > 0 {
            debug!(dropped, remaining = self.counter.len(), "pruned expired rate windows");
        }
        dropped
    }
}

#[async_trait]
impl BackgroundRunnable for CounterSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::SweepNow { done } => {
                let dropped = self.sweep();
                if let Some(done) = done {
                    let _ = done.send(dropped);
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tenantgate_core::RateCounter;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tick_prunes_expired_windows() {
        let counter = Arc::new(MemoryRateCounter::new());
        counter.hit("short", 1).await.unwrap();
        counter.hit("long", 3600).await.unwrap();

        let mut worker = CounterSweeper::spawn(Arc::clone(&counter), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(counter.len(), 1);
        assert_eq!(counter.attempts("long").await.unwrap(), 1);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_now_reports_dropped_count() {
        let counter = Arc::new(MemoryRateCounter::new());
        counter.hit("a", 1).await.unwrap();
        counter.hit("b", 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut worker = CounterSweeper::spawn(Arc::clone(&counter), Duration::from_secs(3600));
        let (done, rx) = oneshot::channel();
        worker
            .submit(SweepTask::SweepNow { done: Some(done) })
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), 2);
        assert!(counter.is_empty());
        worker.stop().await;
    }

    #[tokio::test]
    async fn submit_after_stop_returns_error() {
        let mut worker =
            CounterSweeper::spawn(Arc::new(MemoryRateCounter::new()), Duration::from_secs(60));
        worker.stop().await;

        let result = worker.submit(SweepTask::SweepNow { done: None }).await;
        assert!(result.is_err());
    }
}
