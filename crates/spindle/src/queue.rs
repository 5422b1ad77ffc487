//! Single-consumer FIFO task queue
//!
//! A [`TaskQueue`] is drained by exactly one thread at a time: the thread
//! that calls [`TaskQueue::run`]. Any number of producers may [`post`] or
//! [`send`] work to it concurrently; they never execute queued work
//! themselves, with one exception: a `send` issued from the queue's own
//! thread runs a nested frame that drains the queue inline up to and
//! including the new operation, so it cannot deadlock.
//!
//! [`post`]: TaskQueue::post
//! [`send`]: TaskQueue::send

use crate::config::QueueConfig;
use crate::error::{DispatchError, DispatchResult, Fault};
use crate::event::{ExceptionEvent, Listeners, SubscriptionId};
use crate::operation::{Operation, OperationHandle, Outcome};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Policy applied to queued work when the loop is asked to stop
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShutdownMode {
    /// No shutdown requested
    None,
    /// Cancel everything still waiting and return
    DiscardPending,
    /// Run everything already queued, then return
    FinishPending,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Operations accepted by `post`/`send`
    pub posted: u64,

    /// Operations that ran to a value
    pub executed: u64,

    /// Operations that returned an error or panicked
    pub failed: u64,

    /// Operations that were canceled instead of running
    pub canceled: u64,

    /// Operations currently waiting
    pub pending: usize,
}

struct QueueState {
    /// Waiting operations in submission order
    pending: VecDeque<Arc<dyn Operation>>,

    /// Thread bound to this queue by `open`/`run`
    owner: Option<ThreadId>,

    /// Whether the owner is inside `run`
    looping: bool,

    shutdown_mode: ShutdownMode,

    /// Uncaught failure that terminated the loop; the queue is dead once set
    fatal: Option<Fault>,
}

/// FIFO dispatcher loop with blocking and non-blocking submission
pub struct TaskQueue {
    state: Mutex<QueueState>,

    /// Signalled when work is queued or shutdown is requested
    work_available: Condvar,

    config: QueueConfig,

    listeners: Listeners,

    posted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
}

impl TaskQueue {
    /// Create a queue that is not yet running
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                owner: None,
                looping: false,
                shutdown_mode: ShutdownMode::None,
                fatal: None,
            }),
            work_available: Condvar::new(),
            config,
            listeners: Listeners::new(),
            posted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
        }
    }

    /// The queue's configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Bind the queue to the calling thread and start accepting submissions.
    ///
    /// Work posted after `open` is held until the same thread calls
    /// [`run`](Self::run). Opening again from the bound thread is a no-op.
    pub fn open(&self) -> DispatchResult<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if let Some(fault) = &state.fatal {
            return Err(DispatchError::Faulted(fault.clone()));
        }
        match state.owner {
            Some(owner) if owner == me && !state.looping => return Ok(()),
            Some(_) => return Err(DispatchError::AlreadyRunning),
            None => {}
        }

        debug_assert!(state.pending.is_empty());
        state.owner = Some(me);
        state.shutdown_mode = ShutdownMode::None;
        Ok(())
    }

    /// Run the dispatch loop on the calling thread until shut down.
    ///
    /// Returns `Ok` after a requested shutdown, or
    /// [`DispatchError::Faulted`] if a work failure terminated the loop
    /// (only when `catch_exceptions` is off). A faulted queue never runs again.
    pub fn run(&self) -> DispatchResult<()> {
        self.open()?;
        {
            let mut state = self.state.lock();
            if state.looping {
                return Err(DispatchError::AlreadyRunning);
            }
            state.looping = true;
        }

        tracing::debug!("task queue loop started");
        let result = self.run_loop();
        self.close();

        match &result {
            Ok(()) => tracing::debug!("task queue loop finished"),
            Err(e) => tracing::error!(error = %e, "task queue loop terminated"),
        }
        result
    }

    fn run_loop(&self) -> DispatchResult<()> {
        loop {
            let op = {
                let mut state = self.state.lock();
                loop {
                    if let Some(fault) = &state.fatal {
                        return Err(DispatchError::Faulted(fault.clone()));
                    }
                    match state.shutdown_mode {
                        ShutdownMode::DiscardPending => {
                            let discarded = std::mem::take(&mut state.pending);
                            drop(state);
                            self.cancel_all(discarded);
                            return Ok(());
                        }
                        ShutdownMode::FinishPending if state.pending.is_empty() => {
                            return Ok(());
                        }
                        _ => {}
                    }
                    if let Some(op) = state.pending.pop_front() {
                        break op;
                    }
                    self.work_available.wait(&mut state);
                }
            };

            self.dispatch(op)?;
        }
    }

    /// Execute one operation and apply the exception policy
    fn dispatch(&self, op: Arc<dyn Operation>) -> DispatchResult<()> {
        tracing::trace!(operation = op.id().as_u64(), "executing operation");

        let can_continue = self.config.catch_exceptions;
        // Counters and the fatal mark are in place before the submitter wakes
        let outcome = op.execute(&|outcome| match outcome {
            Outcome::Skipped => {
                self.canceled.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Finished => {
                self.executed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failed(fault) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if !can_continue {
                    self.state.lock().fatal = Some(fault.clone());
                }
            }
        });

        if let Outcome::Failed(fault) = outcome {
            self.listeners.raise(&ExceptionEvent {
                fault: fault.clone(),
                can_continue,
            });

            if !can_continue {
                tracing::error!(
                    operation = op.id().as_u64(),
                    fault = %fault,
                    "uncaught operation failure"
                );
                return Err(DispatchError::Faulted(fault));
            }
            tracing::debug!(operation = op.id().as_u64(), fault = %fault, "operation failed");
        }
        Ok(())
    }

    /// Drain inline on the queue's own thread until `target` is terminal
    fn run_nested<T: Send + 'static>(&self, target: &OperationHandle<T>) {
        tracing::trace!(operation = target.id().as_u64(), "entering nested frame");

        while !target.is_done() {
            let op = {
                let mut state = self.state.lock();
                if state.fatal.is_some() {
                    break;
                }
                if state.shutdown_mode == ShutdownMode::DiscardPending {
                    let discarded = std::mem::take(&mut state.pending);
                    drop(state);
                    self.cancel_all(discarded);
                    break;
                }
                match state.pending.pop_front() {
                    Some(op) => op,
                    None => break,
                }
            };

            if self.dispatch(op).is_err() {
                break;
            }
        }

        // A fatal failure ahead of the target leaves it queued; it will never run
        self.cancel_operation(target);
        tracing::trace!(operation = target.id().as_u64(), "leaving nested frame");
    }

    fn cancel_operation<T: Send + 'static>(&self, target: &OperationHandle<T>) {
        if !target.is_done() {
            target.cancel();
        }
    }

    fn close(&self) {
        let leftovers = {
            let mut state = self.state.lock();
            state.owner = None;
            state.looping = false;
            std::mem::take(&mut state.pending)
        };
        self.cancel_all(leftovers);
    }

    fn cancel_all(&self, ops: VecDeque<Arc<dyn Operation>>) {
        if ops.is_empty() {
            return;
        }
        tracing::debug!(count = ops.len(), "canceling pending operations");
        for op in ops {
            op.cancel();
            self.canceled.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn enqueue(&self, op: Arc<dyn Operation>) -> DispatchResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(fault) = &state.fatal {
                return Err(DispatchError::Faulted(fault.clone()));
            }
            if state.owner.is_none() {
                return Err(DispatchError::NotRunning);
            }
            if state.shutdown_mode != ShutdownMode::None {
                return Err(DispatchError::ShuttingDown);
            }
            state.pending.push_back(op);
        }
        self.posted.fetch_add(1, Ordering::Relaxed);
        self.work_available.notify_one();
        Ok(())
    }

    /// Queue work and return immediately.
    ///
    /// A failure of the work is observable only through the returned handle
    /// and the exception listeners; it is never reported to the poster.
    pub fn post<T, F>(&self, work: F) -> DispatchResult<OperationHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (handle, op) = OperationHandle::new(work);
        self.enqueue(op)?;
        Ok(handle)
    }

    /// Queue work and block until it completes, returning its value.
    ///
    /// Waits at most the configured send timeout. Called from the queue's own
    /// thread, drains the queue inline instead of blocking.
    pub fn send<T, F>(&self, work: F) -> DispatchResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.send_with(work, self.config.send_timeout)
    }

    /// [`send`](Self::send) with an explicit wait bound
    pub fn send_timeout<T, F>(&self, work: F, timeout: Duration) -> DispatchResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.send_with(work, Some(timeout))
    }

    fn send_with<T, F>(&self, work: F, timeout: Option<Duration>) -> DispatchResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (handle, op) = OperationHandle::new(work);
        self.enqueue(op)?;

        if self.is_queue_thread() {
            self.run_nested(&handle);
            return handle.finish();
        }

        match timeout {
            Some(timeout) => {
                if !handle.wait_timeout(timeout) {
                    handle.cancel();
                    return Err(DispatchError::SendTimeout(timeout));
                }
            }
            None => handle.wait(),
        }
        handle.finish()
    }

    /// Block until everything queued before this call has been processed
    pub fn do_processing(&self) -> DispatchResult<()> {
        self.send(|| Ok(()))
    }

    /// Ask the loop to stop, finishing or discarding queued work
    pub fn shutdown(&self, finish_pending: bool) -> DispatchResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(fault) = &state.fatal {
                return Err(DispatchError::Faulted(fault.clone()));
            }
            if state.owner.is_none() {
                return Err(DispatchError::NotRunning);
            }
            if state.shutdown_mode != ShutdownMode::None {
                return Err(DispatchError::ShuttingDown);
            }
            state.shutdown_mode = if finish_pending {
                ShutdownMode::FinishPending
            } else {
                ShutdownMode::DiscardPending
            };
            tracing::debug!(mode = ?state.shutdown_mode, "task queue shutdown requested");
        }
        self.work_available.notify_all();
        Ok(())
    }

    /// Stop taking work now: cancel everything waiting and make the loop
    /// return once the operation in flight, if any, finishes.
    ///
    /// Overrides a `FinishPending` shutdown already in progress. Does nothing
    /// on a queue that is not bound to a thread.
    pub fn abort(&self) {
        let discarded = {
            let mut state = self.state.lock();
            if state.owner.is_none() {
                return;
            }
            state.shutdown_mode = ShutdownMode::DiscardPending;
            std::mem::take(&mut state.pending)
        };
        tracing::debug!(count = discarded.len(), "task queue aborted");
        self.cancel_all(discarded);
        self.work_available.notify_all();
    }

    /// Whether the queue is bound to a thread and accepting or draining work
    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.owner.is_some() && state.fatal.is_none()
    }

    /// Whether the calling thread is the one bound to this queue
    pub fn is_queue_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Current shutdown policy
    pub fn shutdown_mode(&self) -> ShutdownMode {
        self.state.lock().shutdown_mode
    }

    /// The failure that terminated the loop, if any
    pub fn fault(&self) -> Option<Fault> {
        self.state.lock().fatal.clone()
    }

    /// Number of operations waiting
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Snapshot of the queue counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            posted: self.posted.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }

    /// Listeners notified of every failed operation
    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    /// Shorthand for `listeners().subscribe(..)`
    pub fn on_exception<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ExceptionEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskQueue")
            .field("owner", &state.owner)
            .field("looping", &state.looping)
            .field("shutdown_mode", &state.shutdown_mode)
            .field("pending", &state.pending.len())
            .field("faulted", &state.fatal.is_some())
            .finish()
    }
}
