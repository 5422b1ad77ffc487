//! Exception notification
//!
//! Failures on a worker thread are published to an observer list. Each
//! subscribed listener sees each failure exactly once, in subscription order.

use crate::error::Fault;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Payload delivered to exception listeners
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    /// The failure
    pub fault: Fault,

    /// Whether the loop that raised it keeps running
    pub can_continue: bool,
}

/// Handle returned by [`Listeners::subscribe`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&ExceptionEvent) + Send + Sync>;

/// Observer list for [`ExceptionEvent`]s
pub struct Listeners {
    next_id: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, Listener)>>,
}

impl Listeners {
    /// Create an empty list
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ExceptionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Deliver an event to every listener registered at the time of the call.
    ///
    /// Listeners run on the calling thread without the list locked, so they
    /// may subscribe or unsubscribe. A panicking listener is logged and does
    /// not prevent delivery to the rest.
    pub fn raise(&self, event: &ExceptionEvent) {
        let snapshot: Vec<Listener> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                tracing::error!(
                    fault = %Fault::from_panic(payload),
                    "exception listener panicked"
                );
            }
        }
    }
}

impl Default for Listeners {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}
