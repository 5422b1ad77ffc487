//! Logging setup
//!
//! The runtime logs through `tracing`; nothing is printed unless the host
//! installs a subscriber. [`init_logging`] installs a console subscriber for
//! programs and tests that do not bring their own.

use crate::defaults::{DEFAULT_LOG_FILTER, LOG_ENV_VAR};
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Install a fmt subscriber filtered by `SPINDLE_LOG` (or `RUST_LOG`).
///
/// Safe to call more than once and from several threads. If another global
/// subscriber is already installed it is left in place.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = build_filter();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .try_init();
    });
}

fn build_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}
