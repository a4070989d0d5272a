//! Single background task that runs periodic ticks and on-demand jobs.
//!
//! `BackgroundWorker<R>` owns one tokio task. Jobs submitted through the
//! handle and ticks of the configured interval are processed one at a time,
//! so a runnable never sees concurrent calls. Stopping the worker closes the
//! channel and runs `BackgroundRunnable::shutdown` exactly once.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Job: Send + 'static;

    /// Handles one submitted job.
    async fn run(&mut self, job: Self::Job);

    /// Called on every tick. Ticks missed while a job runs are delayed, not
    /// bunched up.
    async fn on_tick(&mut self) {}

    /// Called once after the loop exits.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: String,
    tx: Option<mpsc::Sender<R::Job>>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker task. Must be called inside a tokio runtime.
    pub fn spawn(name: impl Into<String>, mut runnable: R, tick: Duration) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<R::Job>(64);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    job = rx.recv() => match job {
                        Some(job) => runnable.run(job).await,
                        None => break,
                    },
                    _ = interval.tick() => runnable.on_tick().await,
                    _ = &mut stop_rx => break,
                }
            }

            // Jobs already queued still get an answer.
            rx.close();
            while let Some(job) = rx.recv().await {
                runnable.run(job).await;
            }
            runnable.shutdown().await;
            tracing::debug!(worker = %task_name, "background worker stopped");
        });

        Self {
            name,
            tx: Some(tx),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Queues a job.
    ///
    /// # Errors
    ///
    /// Returns an error once the worker has been stopped.
    pub async fn submit(&self, job: R::Job) -> anyhow::Result<()> {
        let Some(tx) = &self.tx else {
            anyhow::bail!("worker {} is stopped", self.name);
        };
        tx.send(job)
            .await
            .map_err(|_| anyhow::anyhow!("worker {} channel closed", self.name))
    }

    /// Stops the loop and waits for `shutdown` to complete.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(worker = %self.name, error = %e, "background worker panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
