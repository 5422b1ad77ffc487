//! Supervised worker thread
//!
//! A [`WorkerThread`] owns at most one OS thread per run and drives a
//! [`WorkerBody`] through three phases on it:
//!
//! 1. `on_begin` – short setup; [`WorkerThread::start`] blocks until it returns
//!    or the start timeout elapses.
//! 2. `on_run` – the long-lived body; runs after `start` has returned.
//! 3. `on_end` – teardown, always called once the thread exits.
//!
//! [`WorkerThread::stop`] asks the body to return (via `on_request_stop` and
//! the run's [`StopToken`]) and waits up to the stop timeout. A thread that
//! does not exit in time is abandoned: its join handle is dropped, its token
//! is marked abandoned and it is left to finish on its own. Nothing it does
//! afterwards can affect a later run, but there is no guarantee about what it
//! still holds (locks, files, memory) or when it will let go of it. This is a
//! last resort, not a shutdown strategy; bodies should poll their token.
//!
//! Errors and panics escaping any phase are captured, reported to
//! `on_exception` and kept for [`WorkerThread::check_for_exception`].

use crate::config::{ThreadConfig, ThreadPriority};
use crate::error::{DispatchError, DispatchResult, Fault};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Lifecycle of a worker thread
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    /// Never started
    NotStarted,
    /// `start` is waiting for `on_begin`
    Starting,
    /// `on_begin` succeeded; `on_run` is in progress
    Running,
    /// Stop requested; waiting for the thread to exit
    StoppingGraceful,
    /// Stop timeout elapsed; abandoning the thread
    StoppingForced,
    /// Thread exited or was abandoned
    Stopped,
}

/// Cooperative stop flag for one run of a worker thread
#[derive(Debug, Clone)]
pub struct StopToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    run_id: u64,
    requested: AtomicBool,
    abandoned: AtomicBool,
}

impl StopToken {
    fn new(run_id: u64) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                run_id,
                requested: AtomicBool::new(false),
                abandoned: AtomicBool::new(false),
            }),
        }
    }

    /// Whether a stop has been requested for this run
    pub fn is_stop_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Whether this run missed its stop timeout and was abandoned
    pub fn is_abandoned(&self) -> bool {
        self.inner.abandoned.load(Ordering::Acquire)
    }

    /// Sequence number of the run, increasing with every start
    pub fn run_id(&self) -> u64 {
        self.inner.run_id
    }

    fn request(&self) {
        self.inner.requested.store(true, Ordering::Release);
    }

    fn abandon(&self) {
        self.inner.requested.store(true, Ordering::Release);
        self.inner.abandoned.store(true, Ordering::Release);
    }
}

/// Code run on a [`WorkerThread`]
///
/// Every hook except `on_request_stop` and `on_configure` runs on the worker
/// thread. Errors and panics from `on_begin`, `on_run` and `on_end` are
/// captured and reported to `on_exception`.
pub trait WorkerBody: Send + Sync + 'static {
    /// Adjust thread settings just before the OS thread is spawned
    fn on_configure(&self, _config: &mut ThreadConfig) {}

    /// Fast setup; `start` blocks until this returns
    fn on_begin(&self, _token: &StopToken) -> anyhow::Result<()> {
        Ok(())
    }

    /// The thread's long-lived body; should return once a stop is requested
    fn on_run(&self, token: &StopToken) -> anyhow::Result<()>;

    /// Called on the stopping thread to make `on_run` return
    fn on_request_stop(&self) {}

    /// Called on the stopping thread once the run is abandoned; must keep the
    /// abandoned thread from starting any further work
    fn on_abandon(&self, _token: &StopToken) {}

    /// Teardown; runs whether or not `on_begin` succeeded
    fn on_end(&self, _token: &StopToken) -> anyhow::Result<()> {
        Ok(())
    }

    /// A phase failed; `past_begin` is false for failures in `on_begin`
    fn on_exception(&self, _fault: &Fault, _past_begin: bool) {}
}

/// [`WorkerBody`] built from a closure used as `on_run`
pub struct FnBody<F> {
    run: F,
}

impl<F> FnBody<F>
where
    F: Fn(&StopToken) -> anyhow::Result<()> + Send + Sync + 'static,
{
    /// Wrap a closure
    pub fn new(run: F) -> Self {
        Self { run }
    }
}

impl<F> WorkerBody for FnBody<F>
where
    F: Fn(&StopToken) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_run(&self, token: &StopToken) -> anyhow::Result<()> {
        (self.run)(token)
    }
}

/// State shared between one run's OS thread and the supervisor
struct RunContext {
    token: StopToken,
    status: Mutex<RunStatus>,
    changed: Condvar,
}

#[derive(Default)]
struct RunStatus {
    thread_id: Option<ThreadId>,
    /// Set once `on_begin` has returned
    begin: Option<Result<(), Fault>>,
    exited: bool,
    last_exception: Option<Fault>,
}

impl RunContext {
    fn new(run_id: u64) -> Self {
        Self {
            token: StopToken::new(run_id),
            status: Mutex::new(RunStatus::default()),
            changed: Condvar::new(),
        }
    }

    fn thread_id(&self) -> Option<ThreadId> {
        self.status.lock().thread_id
    }

    fn has_exited(&self) -> bool {
        self.status.lock().exited
    }

    fn signal_begin(&self, result: Result<(), Fault>) {
        self.status.lock().begin = Some(result);
        self.changed.notify_all();
    }

    fn signal_exit(&self) {
        self.status.lock().exited = true;
        self.changed.notify_all();
    }

    fn record_exception(&self, fault: &Fault) {
        self.status.lock().last_exception = Some(fault.clone());
    }

    /// Wait for `on_begin` to report; None on timeout
    fn wait_begin(&self, timeout: Duration) -> Option<Result<(), Fault>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut status = self.status.lock();
        loop {
            if let Some(result) = &status.begin {
                return Some(result.clone());
            }
            // A thread that exits without reporting never began
            if status.exited {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut status, deadline).timed_out() {
                        return status.begin.clone();
                    }
                }
                None => self.changed.wait(&mut status),
            }
        }
    }

    /// Wait for the thread to exit; returns whether it did in time
    fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut status = self.status.lock();
        while !status.exited {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut status, deadline).timed_out() {
                        return status.exited;
                    }
                }
                None => self.changed.wait(&mut status),
            }
        }
        true
    }
}

/// Supervisor-side bookkeeping, serialised by the control lock
struct Control {
    join: Option<JoinHandle<()>>,
    /// Settings the current run was started with
    active: ThreadConfig,
}

struct Lifecycle {
    state: ThreadState,
    stopped_gracefully: Option<bool>,
    run: Option<Arc<RunContext>>,
}

/// A dedicated OS thread supervised through begin/run/end phases
pub struct WorkerThread<B: WorkerBody> {
    body: Arc<B>,
    config: Mutex<ThreadConfig>,
    control: Mutex<Control>,
    lifecycle: Mutex<Lifecycle>,
    next_run_id: AtomicU64,
}

impl<B: WorkerBody> WorkerThread<B> {
    /// Create a worker thread that is not yet started
    pub fn new(config: ThreadConfig, body: B) -> Self {
        Self {
            body: Arc::new(body),
            control: Mutex::new(Control {
                join: None,
                active: config.clone(),
            }),
            config: Mutex::new(config),
            lifecycle: Mutex::new(Lifecycle {
                state: ThreadState::NotStarted,
                stopped_gracefully: None,
                run: None,
            }),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// The body driven by this thread
    pub fn body(&self) -> &B {
        &self.body
    }

    /// Settings used by the next start
    pub fn config(&self) -> ThreadConfig {
        self.config.lock().clone()
    }

    /// Change settings; fails with `AlreadyRunning` while a run is live
    pub fn configure<F>(&self, update: F) -> DispatchResult<()>
    where
        F: FnOnce(&mut ThreadConfig),
    {
        let _control = self.control.lock();
        match self.state() {
            ThreadState::NotStarted | ThreadState::Stopped => {
                update(&mut self.config.lock());
                Ok(())
            }
            _ => Err(DispatchError::AlreadyRunning),
        }
    }

    /// Thread name used by the next start
    pub fn name(&self) -> String {
        self.config.lock().name.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ThreadState {
        let lifecycle = self.lifecycle.lock();
        match (&lifecycle.state, &lifecycle.run) {
            (ThreadState::Running, Some(run)) if run.has_exited() => ThreadState::Stopped,
            (state, _) => *state,
        }
    }

    /// Whether `on_begin` succeeded and the thread has not stopped
    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    /// Outcome of the last stop: None until stopped, then graceful or forced.
    ///
    /// A run whose `on_run` returned by itself counts as graceful.
    pub fn has_stopped_gracefully(&self) -> Option<bool> {
        let lifecycle = self.lifecycle.lock();
        match (&lifecycle.state, &lifecycle.run) {
            (ThreadState::Running, Some(run)) if run.has_exited() => Some(true),
            _ => lifecycle.stopped_gracefully,
        }
    }

    /// ID of the current (or last) run's OS thread
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.current_run().and_then(|run| run.thread_id())
    }

    /// Whether the caller is running on this worker's current OS thread
    pub fn is_worker_thread(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    /// Last failure captured on the worker thread, if any
    pub fn last_exception(&self) -> Option<Fault> {
        self.current_run()
            .and_then(|run| run.status.lock().last_exception.clone())
    }

    /// Return and clear the last captured failure as an error.
    ///
    /// Must be called from outside the worker thread.
    pub fn check_for_exception(&self) -> DispatchResult<()> {
        if self.is_worker_thread() {
            return Err(DispatchError::WrongThread);
        }
        let fault = self
            .current_run()
            .and_then(|run| run.status.lock().last_exception.take());
        match fault {
            Some(fault) => Err(DispatchError::Thread(fault)),
            None => Ok(()),
        }
    }

    fn current_run(&self) -> Option<Arc<RunContext>> {
        self.lifecycle.lock().run.clone()
    }

    fn set_state(&self, state: ThreadState) {
        self.lifecycle.lock().state = state;
    }

    /// Spawn the OS thread and block until `on_begin` completes.
    ///
    /// On any failure the thread is torn down before the error is returned.
    pub fn start(&self) -> DispatchResult<()> {
        let mut control = self.control.lock();
        {
            let lifecycle = self.lifecycle.lock();
            let state = match (&lifecycle.state, &lifecycle.run) {
                (ThreadState::Running, Some(run)) if run.has_exited() => ThreadState::Stopped,
                (state, _) => *state,
            };
            if !matches!(state, ThreadState::NotStarted | ThreadState::Stopped) {
                return Err(DispatchError::AlreadyRunning);
            }
        }

        // Reap a previous run that ended on its own
        if let Some(previous) = control.join.take() {
            let _ = previous.join();
        }

        let mut config = self.config.lock().clone();
        self.body.on_configure(&mut config);
        config.validate()?;

        let run = Arc::new(RunContext::new(
            self.next_run_id.fetch_add(1, Ordering::Relaxed),
        ));
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = ThreadState::Starting;
            lifecycle.stopped_gracefully = None;
            lifecycle.run = Some(run.clone());
        }

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let body = self.body.clone();
        let thread_run = run.clone();
        let priority = config.priority;
        let spawned = builder.spawn(move || thread_main(body, thread_run, priority));

        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                tracing::error!(thread = %config.name, error = %e, "failed to spawn worker thread");
                self.set_state(ThreadState::Stopped);
                return Err(DispatchError::Spawn(e));
            }
        };
        control.join = Some(join);
        control.active = config.clone();

        tracing::debug!(
            thread = %config.name,
            run = run.token.run_id(),
            "worker thread spawned, waiting for begin"
        );

        match run.wait_begin(config.timeout) {
            Some(Ok(())) => {
                self.set_state(ThreadState::Running);
                tracing::debug!(thread = %config.name, "worker thread running");
                Ok(())
            }
            Some(Err(fault)) => {
                tracing::error!(thread = %config.name, fault = %fault, "worker thread failed to begin");
                self.stop_locked(&mut control, config.timeout);
                Err(DispatchError::StartFailure(fault))
            }
            None => {
                tracing::error!(
                    thread = %config.name,
                    timeout = ?config.timeout,
                    "worker thread did not begin in time"
                );
                // Still inside on_begin; nothing to wait for
                self.stop_locked(&mut control, Duration::ZERO);
                Err(DispatchError::StartTimeout(config.timeout))
            }
        }
    }

    /// Ask the thread to stop and wait up to the stop timeout.
    ///
    /// Idempotent. A thread that does not exit in time is abandoned and
    /// [`has_stopped_gracefully`](Self::has_stopped_gracefully) reports false.
    pub fn stop(&self) -> DispatchResult<()> {
        if self.is_worker_thread() {
            return Err(DispatchError::StopFromWorkerThread);
        }
        let mut control = self.control.lock();
        let timeout = control.active.timeout;
        self.stop_locked(&mut control, timeout);
        Ok(())
    }

    fn stop_locked(&self, control: &mut Control, timeout: Duration) {
        let run = {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(lifecycle.state, ThreadState::NotStarted | ThreadState::Stopped) {
                return;
            }
            lifecycle.state = ThreadState::StoppingGraceful;
            lifecycle.run.clone()
        };

        let graceful = match run {
            Some(run) => self.stop_run(control, &run, timeout),
            None => true,
        };

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = ThreadState::Stopped;
        lifecycle.stopped_gracefully = Some(graceful);
    }

    fn stop_run(&self, control: &mut Control, run: &RunContext, timeout: Duration) -> bool {
        let name = &control.active.name;
        tracing::debug!(thread = %name, run = run.token.run_id(), "stopping worker thread");

        run.token.request();
        if !run.has_exited() {
            guarded_hook(run, "on_request_stop", || self.body.on_request_stop());
        }

        if run.wait_exit(timeout) {
            if let Some(join) = control.join.take() {
                let _ = join.join();
            }
            tracing::debug!(thread = %name, "worker thread stopped");
            return true;
        }

        self.set_state(ThreadState::StoppingForced);
        run.token.abandon();
        guarded_hook(run, "on_abandon", || self.body.on_abandon(&run.token));
        // Dropping the handle detaches the thread
        control.join.take();
        tracing::warn!(
            thread = %name,
            timeout = ?timeout,
            "worker thread did not stop in time and was abandoned"
        );
        false
    }

    /// Request a stop without waiting and detach the thread
    fn abandon(&self) {
        let mut control = self.control.lock();
        if let Some(run) = self.current_run() {
            if !run.has_exited() {
                run.token.abandon();
                guarded_hook(&run, "on_request_stop", || self.body.on_request_stop());
                guarded_hook(&run, "on_abandon", || self.body.on_abandon(&run.token));
            }
        }
        control.join.take();
    }
}

impl<B: WorkerBody> Drop for WorkerThread<B> {
    fn drop(&mut self) {
        if matches!(self.state(), ThreadState::NotStarted | ThreadState::Stopped) {
            return;
        }
        let background = self.control.lock().active.background;
        if background || self.is_worker_thread() {
            self.abandon();
        } else {
            let _ = self.stop();
        }
    }
}

impl<B: WorkerBody> std::fmt::Debug for WorkerThread<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("stopped_gracefully", &self.has_stopped_gracefully())
            .finish()
    }
}

/// Body of the spawned OS thread
fn thread_main<B: WorkerBody>(body: Arc<B>, run: Arc<RunContext>, priority: ThreadPriority) {
    run.status.lock().thread_id = Some(thread::current().id());
    apply_priority(priority);

    let began = match guarded(|| body.on_begin(&run.token)) {
        Ok(()) => {
            run.signal_begin(Ok(()));
            true
        }
        Err(fault) => {
            report(&*body, &run, &fault, false);
            run.signal_begin(Err(fault));
            false
        }
    };

    // A start that timed out has already abandoned this run
    if began && !run.token.is_abandoned() {
        if let Err(fault) = guarded(|| body.on_run(&run.token)) {
            report(&*body, &run, &fault, true);
        }
    }

    if let Err(fault) = guarded(|| body.on_end(&run.token)) {
        report(&*body, &run, &fault, began);
    }

    run.signal_exit();
}

fn guarded<F>(phase: F) -> Result<(), Fault>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(phase)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(Fault::from_error(error)),
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}

/// Run a hook on the supervising side, recording a panic against the run
fn guarded_hook<F: FnOnce()>(run: &RunContext, hook: &'static str, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let fault = Fault::from_panic(payload);
        tracing::error!(hook, fault = %fault, "worker hook panicked");
        run.record_exception(&fault);
    }
}

fn report<B: WorkerBody>(body: &B, run: &RunContext, fault: &Fault, past_begin: bool) {
    tracing::error!(fault = %fault, past_begin, "worker thread phase failed");
    run.record_exception(fault);
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body.on_exception(fault, past_begin))) {
        tracing::error!(fault = %Fault::from_panic(payload), "on_exception panicked");
    }
}

#[cfg(target_os = "linux")]
fn apply_priority(priority: ThreadPriority) {
    if priority == ThreadPriority::Normal {
        return;
    }
    // SAFETY: gettid and setpriority only read/modify the calling thread's
    // scheduling attributes.
    let rc = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, priority.nice_value())
    };
    if rc != 0 {
        tracing::warn!(
            ?priority,
            error = %std::io::Error::last_os_error(),
            "could not apply thread priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(priority: ThreadPriority) {
    if priority != ThreadPriority::Normal {
        tracing::debug!(?priority, "thread priority is not applied on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Body that loops until asked to stop, recording which hooks ran
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
        faults: Mutex<Vec<(String, bool)>>,
    }

    impl WorkerBody for Recorder {
        fn on_begin(&self, _token: &StopToken) -> anyhow::Result<()> {
            self.events.lock().push("begin");
            Ok(())
        }

        fn on_run(&self, token: &StopToken) -> anyhow::Result<()> {
            self.events.lock().push("run");
            while !token.is_stop_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }

        fn on_request_stop(&self) {
            self.events.lock().push("request_stop");
        }

        fn on_end(&self, _token: &StopToken) -> anyhow::Result<()> {
            self.events.lock().push("end");
            Ok(())
        }

        fn on_exception(&self, fault: &Fault, past_begin: bool) {
            self.faults.lock().push((fault.to_string(), past_begin));
        }
    }

    fn config(timeout_ms: u64) -> ThreadConfig {
        ThreadConfig::named("test-worker").with_timeout(Duration::from_millis(timeout_ms))
    }

    #[test]
    fn test_worker_creation() {
        let worker = WorkerThread::new(config(1000), Recorder::default());
        assert_eq!(worker.state(), ThreadState::NotStarted);
        assert!(!worker.is_running());
        assert_eq!(worker.has_stopped_gracefully(), None);
        assert!(worker.thread_id().is_none());
    }

    #[test]
    fn test_worker_start_stop() {
        let worker = WorkerThread::new(config(1000), Recorder::default());

        worker.start().unwrap();
        assert!(worker.is_running());
        assert!(matches!(worker.start(), Err(DispatchError::AlreadyRunning)));

        // on_run starts after start() returns
        let start = Instant::now();
        while !worker.body().events.lock().contains(&"run") {
            assert!(start.elapsed() < Duration::from_secs(2), "on_run never started");
            thread::sleep(Duration::from_millis(1));
        }

        worker.stop().unwrap();
        assert_eq!(worker.state(), ThreadState::Stopped);
        assert_eq!(worker.has_stopped_gracefully(), Some(true));
        assert_eq!(
            *worker.body().events.lock(),
            vec!["begin", "run", "request_stop", "end"]
        );

        // Idempotent
        worker.stop().unwrap();
        assert_eq!(worker.has_stopped_gracefully(), Some(true));
    }

    #[test]
    fn test_worker_thread_name() {
        let worker = WorkerThread::new(
            config(1000),
            FnBody::new(|token: &StopToken| {
                assert_eq!(thread::current().name(), Some("test-worker"));
                while !token.is_stop_requested() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }),
        );
        worker.start().unwrap();
        assert!(!worker.is_worker_thread());
        worker.stop().unwrap();
        assert!(worker.last_exception().is_none());
    }

    #[test]
    fn test_worker_restart() {
        let worker = WorkerThread::new(config(1000), Recorder::default());
        worker.start().unwrap();
        let first = worker.thread_id();
        worker.stop().unwrap();

        worker.start().unwrap();
        assert!(worker.is_running());
        assert_ne!(worker.thread_id(), first);
        worker.stop().unwrap();
    }

    #[test]
    fn test_begin_failure_fails_start() {
        struct FailingBegin;
        impl WorkerBody for FailingBegin {
            fn on_begin(&self, _token: &StopToken) -> anyhow::Result<()> {
                anyhow::bail!("no device")
            }
            fn on_run(&self, _token: &StopToken) -> anyhow::Result<()> {
                unreachable!("on_run must not run after a failed begin")
            }
        }

        let worker = WorkerThread::new(config(1000), FailingBegin);
        let err = worker.start().unwrap_err();
        assert!(matches!(err, DispatchError::StartFailure(ref f) if f.to_string() == "no device"));
        assert_eq!(worker.state(), ThreadState::Stopped);
        assert!(matches!(worker.check_for_exception(), Err(DispatchError::Thread(_))));
        // Taken by the previous call
        assert!(worker.check_for_exception().is_ok());
    }

    #[test]
    fn test_start_timeout() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        struct SlowBegin(Mutex<mpsc::Receiver<()>>);
        impl WorkerBody for SlowBegin {
            fn on_begin(&self, _token: &StopToken) -> anyhow::Result<()> {
                let _ = self.0.lock().recv();
                Ok(())
            }
            fn on_run(&self, _token: &StopToken) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let worker = WorkerThread::new(config(100), SlowBegin(Mutex::new(release_rx)));
        let start = Instant::now();
        let err = worker.start().unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, DispatchError::StartTimeout(_)));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(1000));
        assert!(!worker.is_running());
        assert_eq!(worker.has_stopped_gracefully(), Some(false));
        drop(release_tx);
    }

    #[test]
    fn test_forced_stop() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let worker = WorkerThread::new(
            config(100),
            FnBody::new(move |_token: &StopToken| {
                // Ignores the stop request
                let _ = release_rx.lock().recv();
                Ok(())
            }),
        );
        worker.start().unwrap();

        let start = Instant::now();
        worker.stop().unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(1000));
        assert_eq!(worker.has_stopped_gracefully(), Some(false));
        assert_eq!(worker.state(), ThreadState::Stopped);
        drop(release_tx);
    }

    /// Body that ignores stop requests until released, counting abandons
    struct Stubborn {
        release: Mutex<mpsc::Receiver<()>>,
        abandoned: Mutex<Vec<u64>>,
    }

    impl WorkerBody for Stubborn {
        fn on_run(&self, _token: &StopToken) -> anyhow::Result<()> {
            let _ = self.release.lock().recv();
            Ok(())
        }

        fn on_abandon(&self, token: &StopToken) {
            assert!(token.is_abandoned());
            self.abandoned.lock().push(token.run_id());
        }
    }

    #[test]
    fn test_forced_stop_calls_on_abandon() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = WorkerThread::new(
            config(50),
            Stubborn {
                release: Mutex::new(release_rx),
                abandoned: Mutex::new(Vec::new()),
            },
        );
        worker.start().unwrap();
        worker.stop().unwrap();

        assert_eq!(worker.has_stopped_gracefully(), Some(false));
        assert_eq!(worker.body().abandoned.lock().len(), 1);
        drop(release_tx);
    }

    /// Body whose stop hooks panic
    struct PanickyHooks;

    impl WorkerBody for PanickyHooks {
        fn on_run(&self, token: &StopToken) -> anyhow::Result<()> {
            while !token.is_stop_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }

        fn on_request_stop(&self) {
            panic!("request_stop hook failed");
        }

        fn on_abandon(&self, _token: &StopToken) {
            panic!("abandon hook failed");
        }
    }

    #[test]
    fn test_panicking_stop_hooks_are_contained() {
        let worker = WorkerThread::new(config(1000), PanickyHooks);
        worker.start().unwrap();
        worker.stop().unwrap();
        assert_eq!(worker.has_stopped_gracefully(), Some(true));
        assert!(worker.last_exception().unwrap().is_panic());

        // Background threads are abandoned on drop; both hooks panic there
        worker.start().unwrap();
        assert!(worker.config().background);
        drop(worker);
    }

    #[test]
    fn test_run_failure_is_captured() {
        let worker = WorkerThread::new(
            config(1000),
            FnBody::new(|_token: &StopToken| -> anyhow::Result<()> { panic!("run exploded") }),
        );
        worker.start().unwrap();

        let start = Instant::now();
        while worker.is_running() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(worker.state(), ThreadState::Stopped);
        // Ended by itself, not by a forced stop
        assert_eq!(worker.has_stopped_gracefully(), Some(true));

        let fault = worker.last_exception().unwrap();
        assert!(fault.is_panic());
        worker.stop().unwrap();
        assert!(matches!(worker.check_for_exception(), Err(DispatchError::Thread(_))));
    }

    #[test]
    fn test_on_exception_receives_past_begin() {
        struct FailingRun(Recorder);
        impl WorkerBody for FailingRun {
            fn on_run(&self, _token: &StopToken) -> anyhow::Result<()> {
                anyhow::bail!("lost connection")
            }
            fn on_end(&self, _token: &StopToken) -> anyhow::Result<()> {
                anyhow::bail!("cleanup failed")
            }
            fn on_exception(&self, fault: &Fault, past_begin: bool) {
                self.0.on_exception(fault, past_begin)
            }
        }

        let worker = WorkerThread::new(config(1000), FailingRun(Recorder::default()));
        worker.start().unwrap();
        worker.stop().unwrap();

        assert_eq!(
            *worker.body().0.faults.lock(),
            vec![
                ("lost connection".to_string(), true),
                ("cleanup failed".to_string(), true)
            ]
        );
        // The slot keeps the most recent failure
        let fault = worker.last_exception().unwrap();
        assert_eq!(fault.to_string(), "cleanup failed");
    }

    #[test]
    fn test_stop_from_worker_thread_fails() {
        struct SelfStopper {
            worker: Mutex<Option<std::sync::Weak<WorkerThread<SelfStopper>>>>,
            stop_result: Mutex<Option<DispatchResult<()>>>,
            check_result: Mutex<Option<DispatchResult<()>>>,
        }
        impl WorkerBody for SelfStopper {
            fn on_run(&self, token: &StopToken) -> anyhow::Result<()> {
                let worker = self.worker.lock().as_ref().and_then(|w| w.upgrade());
                if let Some(worker) = worker {
                    *self.stop_result.lock() = Some(worker.stop());
                    *self.check_result.lock() = Some(worker.check_for_exception());
                }
                while !token.is_stop_requested() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }
        }

        let worker = Arc::new(WorkerThread::new(
            config(1000),
            SelfStopper {
                worker: Mutex::new(None),
                stop_result: Mutex::new(None),
                check_result: Mutex::new(None),
            },
        ));
        *worker.body().worker.lock() = Some(Arc::downgrade(&worker));

        worker.start().unwrap();
        let start = Instant::now();
        while worker.body().check_result.lock().is_none() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        worker.stop().unwrap();

        assert!(matches!(
            worker.body().stop_result.lock().take(),
            Some(Err(DispatchError::StopFromWorkerThread))
        ));
        assert!(matches!(
            worker.body().check_result.lock().take(),
            Some(Err(DispatchError::WrongThread))
        ));
        assert_eq!(worker.has_stopped_gracefully(), Some(true));
    }

    #[test]
    fn test_configure_rejected_while_running() {
        let worker = WorkerThread::new(config(1000), Recorder::default());
        worker.configure(|c| c.name = "renamed".to_string()).unwrap();
        assert_eq!(worker.name(), "renamed");

        worker.start().unwrap();
        assert!(matches!(
            worker.configure(|c| c.timeout = Duration::ZERO),
            Err(DispatchError::AlreadyRunning)
        ));
        worker.stop().unwrap();
    }

    #[test]
    fn test_on_configure_adjusts_settings() {
        struct Renamer;
        impl WorkerBody for Renamer {
            fn on_configure(&self, config: &mut ThreadConfig) {
                config.name = "configured".to_string();
            }
            fn on_run(&self, token: &StopToken) -> anyhow::Result<()> {
                anyhow::ensure!(
                    thread::current().name() == Some("configured"),
                    "name not applied"
                );
                while !token.is_stop_requested() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }
        }

        let worker = WorkerThread::new(config(1000), Renamer);
        worker.start().unwrap();
        worker.stop().unwrap();
        assert!(worker.check_for_exception().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected_at_start() {
        let worker = WorkerThread::new(ThreadConfig::named(""), Recorder::default());
        assert!(matches!(worker.start(), Err(DispatchError::Config(_))));
        assert_eq!(worker.state(), ThreadState::NotStarted);
    }
}
