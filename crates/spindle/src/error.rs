//! Error types for the dispatcher runtime.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A failure raised by user code running on a worker thread.
///
/// Either an error returned from a closure or hook, or a panic caught while
/// running one. Cloning is cheap and clones share identity, so the same
/// failure can be handed to an operation handle, an exception listener and a
/// thread's exception slot without being mistaken for three failures.
#[derive(Clone)]
pub enum Fault {
    /// The work returned an error
    Error(Arc<anyhow::Error>),

    /// The work panicked; the payload message is preserved
    Panic(Arc<str>),
}

impl Fault {
    /// Wrap an error returned from user code
    pub fn from_error(error: anyhow::Error) -> Self {
        Fault::Error(Arc::new(error))
    }

    /// Convert a panic payload from `catch_unwind` into a fault
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Fault::Panic(message.into())
    }

    /// Whether this fault came from a panic
    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panic(_))
    }

    /// The underlying error, if the fault was returned rather than panicked
    pub fn error(&self) -> Option<&anyhow::Error> {
        match self {
            Fault::Error(e) => Some(e),
            Fault::Panic(_) => None,
        }
    }

    /// Whether two faults are the same failure (not merely equal text)
    pub fn same(&self, other: &Fault) -> bool {
        match (self, other) {
            (Fault::Error(a), Fault::Error(b)) => Arc::ptr_eq(a, b),
            (Fault::Panic(a), Fault::Panic(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Error(e) => write!(f, "{:#}", e),
            Fault::Panic(msg) => write!(f, "panicked: {}", msg),
        }
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Error(e) => f.debug_tuple("Error").field(&format_args!("{:#}", e)).finish(),
            Fault::Panic(msg) => f.debug_tuple("Panic").field(msg).finish(),
        }
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Fault::Error(e) => {
                let inner: &(dyn std::error::Error + 'static) = (**e).as_ref();
                Some(inner)
            }
            Fault::Panic(_) => None,
        }
    }
}

/// Errors returned by the dispatcher, queue and worker thread APIs
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Start or Run called while already active
    #[error("already running")]
    AlreadyRunning,

    /// Submission or shutdown on something that is not running
    #[error("not running")]
    NotRunning,

    /// Submission or shutdown after shutdown was requested
    #[error("shutting down")]
    ShuttingDown,

    /// Stop called from inside the worker thread it would stop
    #[error("cannot stop a worker thread from inside itself")]
    StopFromWorkerThread,

    /// An operation that must be called from outside the worker thread was not
    #[error("operation not permitted on the worker thread")]
    WrongThread,

    /// The begin phase did not signal within the start timeout
    #[error("worker thread did not start within {0:?}")]
    StartTimeout(Duration),

    /// The begin phase failed
    #[error("worker thread failed to start: {0}")]
    StartFailure(Fault),

    /// The OS refused to spawn a thread
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The queue was terminated by an uncaught work failure and cannot run again
    #[error("task queue terminated by an uncaught failure: {0}")]
    Faulted(Fault),

    /// A sent operation failed
    #[error("operation failed: {0}")]
    Work(Fault),

    /// A sent operation was canceled before it executed
    #[error("operation canceled")]
    Canceled,

    /// The operation finished but its result was already taken through
    /// another handle
    #[error("operation result already taken")]
    ResultTaken,

    /// A sent operation did not complete within the wait timeout
    #[error("operation did not complete within {0:?}")]
    SendTimeout(Duration),

    /// A failure captured on the worker thread
    #[error("worker thread failed: {0}")]
    Thread(Fault),

    /// Thread settings rejected at start
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias used across the crate
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors that can occur while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A timeout was negative
    #[error("timeout must not be negative: {field} = {value}ms")]
    NegativeTimeout {
        /// Offending field
        field: &'static str,
        /// Offending value in milliseconds
        value: i64,
    },

    /// Thread names must be non-empty and free of NUL bytes
    #[error("invalid thread name: {0:?}")]
    InvalidThreadName(String),

    /// Stack size of zero
    #[error("stack size must be greater than zero")]
    ZeroStackSize,
}
