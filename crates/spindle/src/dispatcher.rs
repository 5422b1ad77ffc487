//! Dispatcher thread: a worker thread whose body is a task queue
//!
//! Every start builds a fresh [`TaskQueue`] in `on_begin`, runs it as
//! `on_run` and shuts it down from `on_request_stop`. Submissions are
//! forwarded to the current run's queue.

use crate::config::{DispatcherConfig, ThreadConfig};
use crate::error::{DispatchError, DispatchResult, Fault};
use crate::event::{ExceptionEvent, Listeners, SubscriptionId};
use crate::operation::OperationHandle;
use crate::queue::{QueueStats, ShutdownMode, TaskQueue};
use crate::worker::{StopToken, ThreadState, WorkerBody, WorkerThread};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

struct DispatcherBody {
    config: Mutex<DispatcherConfig>,

    /// Queue of the most recent run to begin, tagged with its run ID
    current: Mutex<Option<(u64, Arc<TaskQueue>)>>,

    listeners: Arc<Listeners>,
}

impl DispatcherBody {
    fn current_queue(&self) -> Option<Arc<TaskQueue>> {
        self.current.lock().as_ref().map(|(_, queue)| queue.clone())
    }

    fn queue_for_run(&self, run_id: u64) -> Option<Arc<TaskQueue>> {
        match &*self.current.lock() {
            Some((id, queue)) if *id == run_id => Some(queue.clone()),
            _ => None,
        }
    }
}

/// Whether a thread-level fault is the queue's own uncaught failure,
/// which the queue has already published
fn is_queue_fault(fault: &Fault) -> bool {
    fault
        .error()
        .and_then(|e| e.downcast_ref::<DispatchError>())
        .is_some_and(|e| matches!(e, DispatchError::Faulted(_)))
}

impl WorkerBody for DispatcherBody {
    fn on_configure(&self, config: &mut ThreadConfig) {
        *config = self.config.lock().thread.clone();
    }

    fn on_begin(&self, token: &StopToken) -> anyhow::Result<()> {
        let queue = Arc::new(TaskQueue::new(self.config.lock().queue_config()));
        let listeners = self.listeners.clone();
        queue.on_exception(move |event| listeners.raise(event));
        queue.open()?;

        let mut current = self.current.lock();
        // A late begin from an abandoned run must not replace a newer queue
        if current.as_ref().map_or(true, |(id, _)| *id < token.run_id()) {
            *current = Some((token.run_id(), queue));
        }
        Ok(())
    }

    fn on_run(&self, token: &StopToken) -> anyhow::Result<()> {
        let queue = self
            .queue_for_run(token.run_id())
            .ok_or_else(|| anyhow::anyhow!("run {} has no task queue", token.run_id()))?;
        queue.run()?;
        Ok(())
    }

    fn on_request_stop(&self) {
        let Some(queue) = self.current_queue() else {
            return;
        };
        let finish_pending = self.config.lock().finish_pending_on_shutdown;
        if let Err(e) = queue.shutdown(finish_pending) {
            tracing::debug!(error = %e, "dispatcher queue already stopping");
        }
    }

    fn on_abandon(&self, token: &StopToken) {
        // The abandoned thread may finish its current operation, nothing more
        if let Some(queue) = self.queue_for_run(token.run_id()) {
            queue.abort();
        }
    }

    fn on_exception(&self, fault: &Fault, past_begin: bool) {
        if is_queue_fault(fault) {
            return;
        }
        tracing::debug!(fault = %fault, past_begin, "forwarding worker thread failure");
        self.listeners.raise(&ExceptionEvent {
            fault: fault.clone(),
            can_continue: false,
        });
    }
}

/// A dedicated thread running a FIFO task queue
///
/// ```rust,ignore
/// let dispatcher = DispatcherThread::new(DispatcherConfig::named("io"));
/// dispatcher.start()?;
/// let handle = dispatcher.post(|| Ok(expensive()))?;
/// let answer = dispatcher.send(|| Ok(6 * 7))?;
/// dispatcher.stop()?;
/// ```
pub struct DispatcherThread {
    worker: WorkerThread<DispatcherBody>,
}

impl DispatcherThread {
    /// Create a dispatcher that is not yet started
    pub fn new(config: DispatcherConfig) -> Self {
        let thread = config.thread.clone();
        let body = DispatcherBody {
            config: Mutex::new(config),
            current: Mutex::new(None),
            listeners: Arc::new(Listeners::new()),
        };
        Self {
            worker: WorkerThread::new(thread, body),
        }
    }

    /// Current configuration
    pub fn config(&self) -> DispatcherConfig {
        self.worker.body().config.lock().clone()
    }

    /// Change configuration; fails with `AlreadyRunning` while running
    pub fn configure<F>(&self, update: F) -> DispatchResult<()>
    where
        F: FnOnce(&mut DispatcherConfig),
    {
        let body = self.worker.body();
        self.worker.configure(|thread| {
            let mut config = body.config.lock();
            update(&mut config);
            *thread = config.thread.clone();
        })
    }

    /// Start the thread; returns once its queue accepts work
    pub fn start(&self) -> DispatchResult<()> {
        self.worker.start()
    }

    /// Stop the thread, finishing or discarding queued work per configuration
    pub fn stop(&self) -> DispatchResult<()> {
        self.worker.stop()
    }

    fn queue(&self) -> DispatchResult<Arc<TaskQueue>> {
        match self.worker.state() {
            ThreadState::Starting | ThreadState::Running | ThreadState::StoppingGraceful => {}
            _ => return Err(DispatchError::NotRunning),
        }
        self.worker
            .body()
            .current_queue()
            .ok_or(DispatchError::NotRunning)
    }

    /// Queue work on the dispatcher thread and return immediately
    pub fn post<T, F>(&self, work: F) -> DispatchResult<OperationHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.queue()?.post(work)
    }

    /// Run work on the dispatcher thread and wait for its value.
    ///
    /// Waits at most the configured send timeout (the thread timeout unless
    /// overridden). Safe to call from the dispatcher thread itself.
    pub fn send<T, F>(&self, work: F) -> DispatchResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.queue()?.send(work)
    }

    /// [`send`](Self::send) with an explicit wait bound
    pub fn send_timeout<T, F>(&self, work: F, timeout: Duration) -> DispatchResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.queue()?.send_timeout(work, timeout)
    }

    /// Block until everything queued before this call has been processed
    pub fn do_processing(&self) -> DispatchResult<()> {
        self.queue()?.do_processing()
    }

    /// Subscribe to work failures and worker thread failures
    pub fn on_exception<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ExceptionEvent) + Send + Sync + 'static,
    {
        self.worker.body().listeners.subscribe(listener)
    }

    /// Remove an exception listener
    pub fn remove_exception_listener(&self, id: SubscriptionId) -> bool {
        self.worker.body().listeners.unsubscribe(id)
    }

    /// Whether the thread is started and not stopped
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Lifecycle state of the underlying thread
    pub fn state(&self) -> ThreadState {
        self.worker.state()
    }

    /// Outcome of the last stop
    pub fn has_stopped_gracefully(&self) -> Option<bool> {
        self.worker.has_stopped_gracefully()
    }

    /// Shutdown policy of the current queue
    pub fn shutdown_mode(&self) -> ShutdownMode {
        self.worker
            .body()
            .current_queue()
            .map_or(ShutdownMode::None, |queue| queue.shutdown_mode())
    }

    /// Counters of the current (or last) run's queue
    pub fn stats(&self) -> QueueStats {
        self.worker
            .body()
            .current_queue()
            .map(|queue| queue.stats())
            .unwrap_or_default()
    }

    /// Whether the caller is running on the dispatcher thread
    pub fn is_dispatcher_thread(&self) -> bool {
        self.worker.is_worker_thread()
    }

    /// OS thread ID of the current (or last) run
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.worker.thread_id()
    }

    /// Last failure captured on the dispatcher thread
    pub fn last_exception(&self) -> Option<Fault> {
        self.worker.last_exception()
    }

    /// Return and clear the last captured thread failure as an error
    pub fn check_for_exception(&self) -> DispatchResult<()> {
        self.worker.check_for_exception()
    }
}

impl Default for DispatcherThread {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl std::fmt::Debug for DispatcherThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherThread")
            .field("worker", &self.worker)
            .field("shutdown_mode", &self.shutdown_mode())
            .finish()
    }
}
