//! Operation handles: per-submission state, result and completion signal
//!
//! An operation moves through a small monotonic state machine:
//!
//! ```text
//! Waiting ──execute──▶ Executing ──ok──▶ Finished
//!    │                     └──err/panic──▶ Exception
//!    └──cancel──▶ Canceled
//! ```
//!
//! Only the queue's thread executes an operation; any thread may wait on it
//! or cancel it while it is still waiting.

use crate::error::{DispatchError, DispatchResult, Fault};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unique identifier for an operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

impl OperationId {
    fn next() -> Self {
        OperationId(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// State of an operation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationState {
    /// Queued, not yet picked up
    Waiting,
    /// Running on the queue's thread
    Executing,
    /// Returned a value
    Finished,
    /// Returned an error or panicked
    Exception,
    /// Canceled before it started
    Canceled,
}

impl OperationState {
    /// Whether the operation can no longer change state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Finished | OperationState::Exception | OperationState::Canceled
        )
    }
}

/// What a call to [`Operation::execute`] did
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    /// The operation was not waiting (already ran or was canceled)
    Skipped,
    /// The work returned a value
    Finished,
    /// The work failed
    Failed(Fault),
}

type Work<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;

struct Slot<T> {
    state: OperationState,
    work: Option<Work<T>>,
    result: Option<T>,
    exception: Option<Fault>,
}

struct OperationCell<T> {
    id: OperationId,
    slot: Mutex<Slot<T>>,
    completed: Condvar,
}

/// Type-erased view of an operation, as held by the queue
pub(crate) trait Operation: Send + Sync {
    /// The operation's ID
    fn id(&self) -> OperationId;

    /// Current state
    fn state(&self) -> OperationState;

    /// Run the work if still waiting; a second call is a no-op.
    ///
    /// `observe` sees the outcome before any waiter is woken.
    fn execute(&self, observe: &dyn Fn(&Outcome)) -> Outcome;

    /// Cancel if still waiting
    fn cancel(&self) -> bool;
}

impl<T: Send + 'static> Operation for OperationCell<T> {
    fn id(&self) -> OperationId {
        self.id
    }

    fn state(&self) -> OperationState {
        self.slot.lock().state
    }

    fn execute(&self, observe: &dyn Fn(&Outcome)) -> Outcome {
        let work = {
            let mut slot = self.slot.lock();
            let work = match slot.state {
                OperationState::Waiting => slot.work.take(),
                _ => None,
            };
            match work {
                Some(work) => {
                    slot.state = OperationState::Executing;
                    work
                }
                None => {
                    drop(slot);
                    observe(&Outcome::Skipped);
                    return Outcome::Skipped;
                }
            }
        };

        let (outcome, value) = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => (Outcome::Finished, Some(value)),
            Ok(Err(error)) => (Outcome::Failed(Fault::from_error(error)), None),
            Err(payload) => (Outcome::Failed(Fault::from_panic(payload)), None),
        };

        // Still Executing here, so no waiter can return before `observe`
        observe(&outcome);
        {
            let mut slot = self.slot.lock();
            match &outcome {
                Outcome::Failed(fault) => {
                    slot.exception = Some(fault.clone());
                    slot.state = OperationState::Exception;
                }
                _ => {
                    slot.result = value;
                    slot.state = OperationState::Finished;
                }
            }
        }
        self.completed.notify_all();
        outcome
    }

    fn cancel(&self) -> bool {
        let work = {
            let mut slot = self.slot.lock();
            if slot.state != OperationState::Waiting {
                return false;
            }
            slot.state = OperationState::Canceled;
            slot.work.take()
        };
        self.completed.notify_all();
        // Captured values are dropped outside the lock
        drop(work);
        true
    }
}

/// Caller's view of a submitted operation
///
/// Clones share the same operation.
pub struct OperationHandle<T> {
    cell: Arc<OperationCell<T>>,
}

impl<T: Send + 'static> OperationHandle<T> {
    /// Wrap work in a new waiting operation.
    ///
    /// Returns the caller's handle and the queue's type-erased view.
    pub(crate) fn new<F>(work: F) -> (Self, Arc<dyn Operation>)
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let cell = Arc::new(OperationCell {
            id: OperationId::next(),
            slot: Mutex::new(Slot {
                state: OperationState::Waiting,
                work: Some(Box::new(work)),
                result: None,
                exception: None,
            }),
            completed: Condvar::new(),
        });
        let erased: Arc<dyn Operation> = cell.clone();
        (Self { cell }, erased)
    }

    /// Cancel the operation if it has not started.
    ///
    /// Returns false, with no side effects, once execution has begun.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }
}

impl<T> OperationHandle<T> {
    /// The operation's ID
    pub fn id(&self) -> OperationId {
        self.cell.id
    }

    /// Current state
    pub fn state(&self) -> OperationState {
        self.cell.slot.lock().state
    }

    /// Whether the operation reached a terminal state
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// The failure, if the operation ended in [`OperationState::Exception`]
    pub fn exception(&self) -> Option<Fault> {
        self.cell.slot.lock().exception.clone()
    }

    /// Take the result out of a finished operation.
    ///
    /// Subsequent calls on this handle or its clones return None, and
    /// [`into_result`](Self::into_result) reports
    /// [`DispatchError::ResultTaken`].
    pub fn take_result(&self) -> Option<T> {
        self.cell.slot.lock().result.take()
    }

    /// Block until the operation is terminal
    pub fn wait(&self) {
        let mut slot = self.cell.slot.lock();
        while !slot.state.is_terminal() {
            self.cell.completed.wait(&mut slot);
        }
    }

    /// Block until the operation is terminal or the timeout elapses.
    ///
    /// Returns whether the operation completed in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };

        let mut slot = self.cell.slot.lock();
        while !slot.state.is_terminal() {
            if self.cell.completed.wait_until(&mut slot, deadline).timed_out() {
                return slot.state.is_terminal();
            }
        }
        true
    }

    /// Block until terminal, then convert the outcome into a result
    pub fn into_result(self) -> DispatchResult<T> {
        self.wait();
        self.finish()
    }

    /// Convert a terminal operation's outcome into a result
    pub(crate) fn finish(&self) -> DispatchResult<T> {
        let mut slot = self.cell.slot.lock();
        match slot.state {
            OperationState::Finished => slot.result.take().ok_or(DispatchError::ResultTaken),
            OperationState::Exception => match slot.exception.clone() {
                Some(fault) => Err(DispatchError::Work(fault)),
                None => Err(DispatchError::Canceled),
            },
            OperationState::Canceled => Err(DispatchError::Canceled),
            OperationState::Waiting | OperationState::Executing => Err(DispatchError::NotRunning),
        }
    }
}

impl<T: Clone> OperationHandle<T> {
    /// A copy of the result, if the operation finished
    pub fn result(&self) -> Option<T> {
        self.cell.slot.lock().result.clone()
    }
}

impl<T> Clone for OperationHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> std::fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.cell.id)
            .field("state", &self.state())
            .finish()
    }
}
