//! Default constants for worker thread and queue configuration.

use std::time::Duration;

/// Default bound on both start and stop of a worker thread.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default OS thread name for worker threads.
pub const DEFAULT_THREAD_NAME: &str = "spindle-worker";

/// Default OS thread name for dispatcher threads.
pub const DEFAULT_DISPATCHER_NAME: &str = "spindle-dispatcher";

/// Environment variable read by [`crate::logging::init_logging`].
pub const LOG_ENV_VAR: &str = "SPINDLE_LOG";

/// Filter used when neither `SPINDLE_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "warn";
