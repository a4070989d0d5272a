//! Bounded worker pool running service units under three execution modes.
//!
//! - `Sync` runs the unit on the caller's task and returns its error as-is.
//! - `Async` queues the unit and returns a handle immediately.
//! - `AsyncWait` queues the unit and waits up to the configured timeout,
//!   cancelling the unit when the wait expires.
//!
//! When the queue is full the engine first grows the pool up to `max_size`,
//! then makes the submitter wait up to `reject_wait` for queue space before
//! rejecting. An engine created without an [`ExecutorConfig`] has no pool and
//! runs every unit inline.

mod workers;

pub use workers::{ServiceRef, WorkerSnapshot, WorkerState};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use spaceport_core::RequestInfo;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use workers::{Assignment, WorkerSlot, WorkerTable};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Sync,
    Async,
    AsyncWait,
}

/// Engine state machine: Idle -> Running -> Draining -> Terminating ->
/// Terminated. A terminated engine can be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    /// Not accepting work; queued units still run.
    Draining,
    /// In-flight units were interrupted; queued units are dropped.
    Terminating,
    Terminated,
}

/// Handed to every unit. Interruption is cooperative: the unit's future is
/// dropped at its next await point, and long synchronous sections can poll
/// [`WorkerToken::is_interrupted`].
#[derive(Debug, Clone)]
pub struct WorkerToken {
    worker: Option<u64>,
    cancel: CancellationToken,
}

impl WorkerToken {
    /// `None` when the unit runs inline on the caller's task.
    #[must_use]
    pub fn worker_id(&self) -> Option<u64> {
        self.worker
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn interrupted(&self) {
        self.cancel.cancelled().await;
    }
}

enum HandleState<T> {
    Ready(Result<T, ExecutionError>),
    Pending(oneshot::Receiver<Result<T, ExecutionError>>),
}

/// Result of a submitted unit.
pub struct ExecutionHandle<T> {
    state: HandleState<T>,
    cancel: CancellationToken,
}

impl<T> ExecutionHandle<T> {
    fn ready(result: Result<T, ExecutionError>, cancel: CancellationToken) -> Self {
        Self {
            state: HandleState::Ready(result),
            cancel,
        }
    }

    /// `true` until an `Async` unit's result is available.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.state, HandleState::Pending(_))
    }

    /// Requests cancellation of the unit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the unit's result.
    ///
    /// # Errors
    ///
    /// Returns the unit's failure, or [`ExecutionError::Cancelled`] if the
    /// unit was dropped before producing a result.
    pub async fn join(self) -> Result<T, ExecutionError> {
        match self.state {
            HandleState::Ready(result) => result,
            HandleState::Pending(rx) => rx.await.unwrap_or(Err(ExecutionError::Cancelled)),
        }
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce(WorkerToken) -> BoxFuture<'static, ()> + Send>;

struct Envelope {
    job: Job,
    request: Option<RequestInfo>,
    service: Option<ServiceRef>,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct Queue {
    tx: mpsc::Sender<Envelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
}

struct EngineInner {
    name: String,
    config: Option<ExecutorConfig>,
    state: ArcSwap<EngineState>,
    queue: Mutex<Option<Queue>>,
    tasks: Mutex<Option<JoinSet<()>>>,
    workers: WorkerTable,
}

impl EngineInner {
    fn state(&self) -> EngineState {
        **self.state.load()
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(Arc::new(state));
    }

    fn spawn_worker(self: &Arc<Self>, set: &mut JoinSet<()>, queue: &Queue, config: &ExecutorConfig, elastic: bool) {
        let slot = self.workers.register(&config.group, elastic);
        let idle = elastic.then(|| config.keep_alive());
        tracing::trace!(engine = %self.name, worker = slot.id, elastic, "worker started");
        set.spawn(worker_loop(Arc::clone(self), slot, Arc::clone(&queue.rx), idle));
    }

    /// Adds an elastic worker if the pool is below `max_size`.
    fn grow(self: &Arc<Self>, queue: &Queue, config: &ExecutorConfig) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(set) = tasks.as_mut() else {
            return false;
        };
        // Reap exited elastic workers.
        while set.try_join_next().is_some() {}
        if self.workers.len() >= config.max_size {
            return false;
        }
        self.spawn_worker(set, queue, config, true);
        true
    }

    async fn submit(self: &Arc<Self>, config: &ExecutorConfig, envelope: Envelope) -> Result<(), ExecutionError> {
        let queue = self.queue.lock().clone().ok_or(ExecutionError::NotRunning)?;
        let envelope = match queue.tx.try_send(envelope) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(ExecutionError::NotRunning),
            Err(mpsc::error::TrySendError::Full(envelope)) => envelope,
        };

        self.grow(&queue, config);
        let wait = config.reject_wait();
        match tokio::time::timeout(wait, queue.tx.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ExecutionError::NotRunning),
            Err(_) => {
                let waited_ms = duration_ms(wait);
                tracing::warn!(engine = %self.name, waited_ms, "execution rejected, queue full");
                Err(ExecutionError::Rejected { waited_ms })
            }
        }
    }
}

/// Unregisters a worker however its task ends, abort included.
struct SlotGuard {
    inner: Arc<EngineInner>,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.workers.remove(self.id);
    }
}

async fn worker_loop(
    inner: Arc<EngineInner>,
    slot: Arc<WorkerSlot>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    idle: Option<Duration>,
) {
    let _registered = SlotGuard {
        inner: Arc::clone(&inner),
        id: slot.id,
    };
    loop {
        let next = async { rx.lock().await.recv().await };
        let envelope = match idle {
            None => next.await,
            // Elastic workers exit once idle for `keep_alive`.
            Some(idle) => tokio::time::timeout(idle, next).await.ok().flatten(),
        };
        let Some(envelope) = envelope else {
            break;
        };
        if envelope.cancel.is_cancelled() || inner.state() == EngineState::Terminating {
            // Dropping the job resolves its handle as cancelled.
            continue;
        }

        slot.begin(Assignment {
            request: envelope.request,
            service: envelope.service,
            cancel: envelope.cancel.clone(),
        });
        let token = WorkerToken {
            worker: Some(slot.id),
            cancel: envelope.cancel,
        };
        (envelope.job)(token).await;
        slot.finish();
    }
    tracing::trace!(engine = %inner.name, worker = slot.id, "worker exited");
}

async fn drain(set: &mut JoinSet<()>, within: Duration) -> bool {
    tokio::time::timeout(within, async { while set.join_next().await.is_some() {} })
        .await
        .is_ok()
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

/// Per-space execution engine. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Creates an engine; `None` disables the pool so every mode runs inline.
    #[must_use]
    pub fn new(name: impl Into<String>, config: Option<ExecutorConfig>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                name: name.into(),
                config,
                state: ArcSwap::from_pointee(EngineState::Idle),
                queue: Mutex::new(None),
                tasks: Mutex::new(None),
                workers: WorkerTable::default(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn config(&self) -> Option<&ExecutorConfig> {
        self.inner.config.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Spawns the core workers. No-op when already running.
    pub fn start(&self) {
        if self.inner.state() == EngineState::Running {
            return;
        }
        let Some(config) = &self.inner.config else {
            self.inner.set_state(EngineState::Running);
            return;
        };

        let (tx, rx) = mpsc::channel(config.queue.max(1));
        let queue = Queue {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        };
        let mut set = JoinSet::new();
        for _ in 0..config.core_size.max(1) {
            self.inner.spawn_worker(&mut set, &queue, config, false);
        }
        *self.inner.queue.lock() = Some(queue);
        *self.inner.tasks.lock() = Some(set);
        self.inner.set_state(EngineState::Running);
        tracing::info!(
            engine = %self.inner.name,
            group = %config.group,
            core = config.core_size,
            max = config.max_size,
            queue = config.queue,
            "execution engine started"
        );
    }

    /// Runs a unit under `mode`.
    ///
    /// # Errors
    ///
    /// `Sync` and `AsyncWait` return the unit's failure as
    /// [`ExecutionError::Failed`]; `AsyncWait` also returns
    /// [`ExecutionError::Timeout`]. Submission fails with
    /// [`ExecutionError::Rejected`] when the pool stays saturated and with
    /// [`ExecutionError::NotRunning`] before `start` or after `shutdown`.
    pub async fn execute<T, F, Fut>(&self, mode: ExecutionMode, unit: F) -> Result<ExecutionHandle<T>, ExecutionError>
    where
        T: Send + 'static,
        F: FnOnce(WorkerToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.dispatch(None, None, mode, unit).await
    }

    /// Same as [`ExecutionEngine::execute`], recording the originating
    /// request for [`ExecutionEngine::describe`].
    ///
    /// # Errors
    ///
    /// See [`ExecutionEngine::execute`].
    pub async fn execute_request<T, F, Fut>(
        &self,
        request: RequestInfo,
        service: ServiceRef,
        mode: ExecutionMode,
        unit: F,
    ) -> Result<ExecutionHandle<T>, ExecutionError>
    where
        T: Send + 'static,
        F: FnOnce(WorkerToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.dispatch(Some(request), Some(service), mode, unit).await
    }

    async fn dispatch<T, F, Fut>(
        &self,
        request: Option<RequestInfo>,
        service: Option<ServiceRef>,
        mode: ExecutionMode,
        unit: F,
    ) -> Result<ExecutionHandle<T>, ExecutionError>
    where
        T: Send + 'static,
        F: FnOnce(WorkerToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let Some(config) = self.inner.config.as_ref().filter(|_| mode != ExecutionMode::Sync) else {
            let token = WorkerToken {
                worker: None,
                cancel: cancel.clone(),
            };
            let value = unit(token).await.map_err(ExecutionError::Failed)?;
            return Ok(ExecutionHandle::ready(Ok(value), cancel));
        };
        if self.inner.state() != EngineState::Running {
            return Err(ExecutionError::NotRunning);
        }

        let (tx, rx) = oneshot::channel();
        let unit_cancel = cancel.clone();
        let engine = self.inner.name.clone();
        let log_failure = mode == ExecutionMode::Async;
        let job: Job = Box::new(move |token: WorkerToken| {
            async move {
                let outcome = tokio::select! {
                    biased;
                    () = unit_cancel.cancelled() => Err(ExecutionError::Cancelled),
                    result = AssertUnwindSafe(unit(token)).catch_unwind() => match result {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(ExecutionError::Failed(e)),
                        Err(_) => Err(ExecutionError::Failed(anyhow::anyhow!("execution unit panicked"))),
                    },
                };
                if log_failure {
                    if let Err(e) = &outcome {
                        tracing::warn!(engine = %engine, error = %e, "async execution failed");
                    }
                }
                let _ = tx.send(outcome);
            }
            .boxed()
        });

        self.inner
            .submit(
                config,
                Envelope {
                    job,
                    request,
                    service,
                    cancel: cancel.clone(),
                },
            )
            .await?;

        if mode == ExecutionMode::Async {
            return Ok(ExecutionHandle {
                state: HandleState::Pending(rx),
                cancel,
            });
        }

        let timeout = config.timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map(|value| ExecutionHandle::ready(Ok(value), cancel)),
            Ok(Err(_)) => Err(ExecutionError::Cancelled),
            Err(_) => {
                cancel.cancel();
                let timeout_ms = duration_ms(timeout);
                tracing::warn!(engine = %self.inner.name, timeout_ms, "execution timed out, unit interrupted");
                Err(ExecutionError::Timeout { timeout_ms })
            }
        }
    }

    /// Signals the unit running on `worker_id`. Returns `false` if no such
    /// worker exists. Doesn't wait for the unit to stop.
    #[must_use]
    pub fn interrupt(&self, worker_id: u64) -> bool {
        match self.inner.workers.get(worker_id) {
            Some(slot) => {
                if slot.interrupt() {
                    tracing::debug!(engine = %self.inner.name, worker = worker_id, "worker interrupted");
                }
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn describe(&self) -> Vec<WorkerSnapshot> {
        self.inner.workers.snapshot()
    }

    /// Stops accepting work, lets queued units drain for
    /// `await_termination`, then interrupts whatever still runs and waits
    /// once more.
    pub async fn shutdown(&self) {
        if self.inner.state() != EngineState::Running {
            return;
        }
        let Some(config) = &self.inner.config else {
            self.inner.set_state(EngineState::Terminated);
            return;
        };

        self.inner.set_state(EngineState::Draining);
        // Dropping the sender lets workers exit once the queue is empty.
        drop(self.inner.queue.lock().take());
        let tasks = self.inner.tasks.lock().take();
        if let Some(mut tasks) = tasks {
            let wait = config.await_termination();
            if !drain(&mut tasks, wait).await {
                self.inner.set_state(EngineState::Terminating);
                let interrupted = self.inner.workers.interrupt_all();
                tracing::warn!(engine = %self.inner.name, interrupted, "workers still busy, interrupting");
                if !drain(&mut tasks, wait).await {
                    tracing::error!(engine = %self.inner.name, remaining = tasks.len(), "workers did not terminate, aborting");
                    tasks.abort_all();
                    // Aborted tasks unregister only once they next yield.
                    self.inner.workers.clear();
                }
            }
        }
        self.inner.set_state(EngineState::Terminated);
        tracing::info!(engine = %self.inner.name, "execution engine stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
