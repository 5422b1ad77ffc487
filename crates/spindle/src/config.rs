//! Worker thread, queue and dispatcher configuration.
//!
//! Configuration is plain data with `with_*` builders. A dispatcher can also
//! be described by a TOML document:
//!
//! ```toml
//! catch_exceptions = true
//! finish_pending_on_shutdown = false
//! send_timeout_ms = 2000
//!
//! [thread]
//! name = "render"
//! priority = "above_normal"
//! background = false
//! timeout_ms = 5000
//! ```

use crate::defaults::{DEFAULT_DISPATCHER_NAME, DEFAULT_THREAD_NAME, DEFAULT_TIMEOUT};
use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Scheduling priority requested for a worker thread
///
/// On Linux the priority is applied as a per-thread nice value when the
/// thread starts. Raising priority usually needs `CAP_SYS_NICE`; if the OS
/// refuses, the thread runs at its inherited priority and a warning is
/// logged. On other platforms the value is recorded only.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPriority {
    /// Runs only when nothing else wants the CPU
    Lowest,
    /// Below the process default
    BelowNormal,
    /// The process default
    #[default]
    Normal,
    /// Above the process default
    AboveNormal,
    /// Highest priority a user thread can request
    Highest,
}

impl ThreadPriority {
    /// Nice value this priority maps to (lower is more favourable)
    pub fn nice_value(self) -> i32 {
        match self {
            ThreadPriority::Lowest => 19,
            ThreadPriority::BelowNormal => 5,
            ThreadPriority::Normal => 0,
            ThreadPriority::AboveNormal => -5,
            ThreadPriority::Highest => -10,
        }
    }
}

/// Settings for a [`WorkerThread`](crate::WorkerThread)
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadConfig {
    /// OS thread name
    pub name: String,

    /// Requested scheduling priority
    pub priority: ThreadPriority,

    /// Background threads are abandoned on drop; foreground threads are stopped
    pub background: bool,

    /// Stack size in bytes (None = platform default)
    pub stack_size: Option<usize>,

    /// Bound on both start and stop
    pub timeout: Duration,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_THREAD_NAME.to_string(),
            priority: ThreadPriority::Normal,
            background: true,
            stack_size: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ThreadConfig {
    /// Default settings with the given thread name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the OS thread name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the scheduling priority
    pub fn with_priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the background flag
    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Set the stack size in bytes
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Set the start/stop timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the settings can be handed to the OS
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.contains('\0') {
            return Err(ConfigError::InvalidThreadName(self.name.clone()));
        }
        if self.stack_size == Some(0) {
            return Err(ConfigError::ZeroStackSize);
        }
        Ok(())
    }
}

/// Settings for a [`TaskQueue`](crate::TaskQueue)
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Absorb work failures (true) or terminate the run loop on them (false)
    pub catch_exceptions: bool,

    /// How long `send` waits for its operation (None = indefinitely)
    pub send_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            catch_exceptions: true,
            send_timeout: None,
        }
    }
}

impl QueueConfig {
    /// Set the catch-exceptions flag
    pub fn with_catch_exceptions(mut self, catch_exceptions: bool) -> Self {
        self.catch_exceptions = catch_exceptions;
        self
    }

    /// Set the default wait bound for `send`
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }
}

/// Settings for a [`DispatcherThread`](crate::DispatcherThread)
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Settings for the underlying worker thread
    pub thread: ThreadConfig,

    /// Absorb work failures (true) or stop the dispatcher on them (false)
    pub catch_exceptions: bool,

    /// Drain queued work (true) or cancel it (false) when stopping
    pub finish_pending_on_shutdown: bool,

    /// Wait bound for `send` (None = use the thread timeout)
    pub send_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread: ThreadConfig::named(DEFAULT_DISPATCHER_NAME),
            catch_exceptions: true,
            finish_pending_on_shutdown: true,
            send_timeout: None,
        }
    }
}

impl DispatcherConfig {
    /// Default settings with the given thread name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            thread: ThreadConfig::named(name),
            ..Self::default()
        }
    }

    /// Replace the worker thread settings
    pub fn with_thread(mut self, thread: ThreadConfig) -> Self {
        self.thread = thread;
        self
    }

    /// Set the start/stop timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.thread.timeout = timeout;
        self
    }

    /// Set the catch-exceptions flag
    pub fn with_catch_exceptions(mut self, catch_exceptions: bool) -> Self {
        self.catch_exceptions = catch_exceptions;
        self
    }

    /// Set the default shutdown policy for queued work
    pub fn with_finish_pending_on_shutdown(mut self, finish_pending: bool) -> Self {
        self.finish_pending_on_shutdown = finish_pending;
        self
    }

    /// Set an explicit wait bound for `send`
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Queue settings derived from this dispatcher config
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            catch_exceptions: self.catch_exceptions,
            send_timeout: Some(self.send_timeout.unwrap_or(self.thread.timeout)),
        }
    }

    /// Check the settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thread.validate()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: DispatcherFile = toml::from_str(content)?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// On-disk shape of [`DispatcherConfig`]; timeouts are signed so negative
/// values can be reported instead of failing to parse.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DispatcherFile {
    #[serde(default)]
    thread: ThreadFile,
    catch_exceptions: Option<bool>,
    finish_pending_on_shutdown: Option<bool>,
    send_timeout_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThreadFile {
    name: Option<String>,
    priority: Option<ThreadPriority>,
    background: Option<bool>,
    stack_size: Option<usize>,
    timeout_ms: Option<i64>,
}

impl DispatcherFile {
    fn into_config(self) -> Result<DispatcherConfig, ConfigError> {
        let defaults = DispatcherConfig::default();
        let thread = ThreadConfig {
            name: self.thread.name.unwrap_or(defaults.thread.name),
            priority: self.thread.priority.unwrap_or(defaults.thread.priority),
            background: self.thread.background.unwrap_or(defaults.thread.background),
            stack_size: self.thread.stack_size,
            timeout: match self.thread.timeout_ms {
                Some(ms) => millis("thread.timeout_ms", ms)?,
                None => defaults.thread.timeout,
            },
        };
        let send_timeout = match self.send_timeout_ms {
            Some(ms) => Some(millis("send_timeout_ms", ms)?),
            None => None,
        };

        Ok(DispatcherConfig {
            thread,
            catch_exceptions: self.catch_exceptions.unwrap_or(defaults.catch_exceptions),
            finish_pending_on_shutdown: self
                .finish_pending_on_shutdown
                .unwrap_or(defaults.finish_pending_on_shutdown),
            send_timeout,
        })
    }
}

fn millis(field: &'static str, value: i64) -> Result<Duration, ConfigError> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::NegativeTimeout { field, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.thread.name, DEFAULT_DISPATCHER_NAME);
        assert_eq!(config.thread.timeout, DEFAULT_TIMEOUT);
        assert!(config.thread.background);
        assert!(config.catch_exceptions);
        assert!(config.finish_pending_on_shutdown);
        assert_eq!(config.queue_config().send_timeout, Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn test_parse_full_document() {
        let config = DispatcherConfig::from_toml_str(
            r#"
            catch_exceptions = false
            finish_pending_on_shutdown = false
            send_timeout_ms = 250

            [thread]
            name = "render"
            priority = "above_normal"
            background = false
            stack_size = 262144
            timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.thread.name, "render");
        assert_eq!(config.thread.priority, ThreadPriority::AboveNormal);
        assert!(!config.thread.background);
        assert_eq!(config.thread.stack_size, Some(262144));
        assert_eq!(config.thread.timeout, Duration::from_millis(1500));
        assert!(!config.catch_exceptions);
        assert!(!config.finish_pending_on_shutdown);
        assert_eq!(config.send_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_parse_empty_document_uses_defaults() {
        let config = DispatcherConfig::from_toml_str("").unwrap();
        assert_eq!(config, DispatcherConfig::default());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let err = DispatcherConfig::from_toml_str("[thread]\ntimeout_ms = -1\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NegativeTimeout {
                field: "thread.timeout_ms",
                value: -1
            }
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = DispatcherConfig::from_toml_str("catch_everything = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_thread_settings() {
        assert!(matches!(
            ThreadConfig::named("").validate(),
            Err(ConfigError::InvalidThreadName(_))
        ));
        assert!(matches!(
            ThreadConfig::default().with_stack_size(0).validate(),
            Err(ConfigError::ZeroStackSize)
        ));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(ThreadPriority::Highest.nice_value() < ThreadPriority::Normal.nice_value());
        assert!(ThreadPriority::Lowest.nice_value() > ThreadPriority::BelowNormal.nice_value());
    }
}
