//! Spindle: dedicated worker threads with FIFO task queues
//!
//! This crate provides:
//! - **Worker threads**: begin/run/end lifecycle with bounded start and stop (`worker` module)
//! - **Task queues**: FIFO dispatch loop with post, reentrant send and shutdown (`queue` module)
//! - **Operations**: handles tracking a queued work item to completion (`operation` module)
//! - **Dispatcher threads**: a worker thread running its own task queue (`dispatcher` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use spindle::{DispatcherConfig, DispatcherThread};
//!
//! let dispatcher = DispatcherThread::new(DispatcherConfig::named("io"));
//! dispatcher.start()?;
//!
//! // Fire and forget
//! let handle = dispatcher.post(|| Ok(load_index()))?;
//!
//! // Wait for a value
//! let total = dispatcher.send(|| Ok(2 + 2))?;
//!
//! dispatcher.stop()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Worker thread lifecycle
pub mod worker;

/// FIFO task queue and dispatch loop
pub mod queue;

/// Operation handles and states
pub mod operation;

/// Worker thread running a task queue
pub mod dispatcher;

// ============================================================================
// Ambient
// ============================================================================

/// Thread, queue and dispatcher settings
pub mod config;

/// Default values
pub mod defaults;

/// Error and failure types
pub mod error;

/// Exception events and listeners
pub mod event;

/// Tracing subscriber setup
pub mod logging;

pub use config::{DispatcherConfig, QueueConfig, ThreadConfig, ThreadPriority};
pub use dispatcher::DispatcherThread;
pub use error::{ConfigError, DispatchError, DispatchResult, Fault};
pub use event::{ExceptionEvent, Listeners, SubscriptionId};
pub use logging::init_logging;
pub use operation::{OperationHandle, OperationId, OperationState};
pub use queue::{QueueStats, ShutdownMode, TaskQueue};
pub use worker::{FnBody, StopToken, ThreadState, WorkerBody, WorkerThread};
