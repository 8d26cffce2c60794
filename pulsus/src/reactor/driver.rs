use super::backend::{Backend, signal};
use super::callback::{CallbackKind, Handler, expiration_after};
use super::core::{Exit, Inner};
use super::{CallbackId, CallbackType};
use crate::error::{Error, Result};
use crate::runtime::builder::DriverBuilder;
use crate::runtime::context;
use crate::runtime::suspension::Suspension;
use crate::runtime::task::{Task, TaskId};

use std::fmt::Write as _;
use std::future::Future;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::Location;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// A single-threaded event loop.
///
/// The driver owns every registered callback, the timer queue, the
/// microtask queue, and the tasks spawned on it. Handles are cheap to
/// clone and all refer to the same loop.
///
/// Callbacks registered during a tick are first considered at the next
/// tick. Within a tick, ready callbacks run in FIFO order, and the
/// microtask queue is drained before every callback.
///
/// # Example
///
/// ```rust,ignore
/// use pulsus::Driver;
/// use std::time::Duration;
///
/// let driver = Driver::new()?;
/// driver.delay(Duration::from_millis(10), |_, _| {
///     println!("fired");
///     Ok(())
/// });
/// driver.run()?;
/// ```
#[derive(Clone)]
pub struct Driver {
    pub(crate) inner: Rc<Inner>,
}

impl Driver {
    /// Creates a driver configured from the environment, see
    /// [`DriverBuilder::from_env`].
    pub fn new() -> Result<Self> {
        DriverBuilder::from_env()?.build()
    }

    /// Creates a driver that owns `backend`.
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self::from_backend(backend, false)
    }

    pub(crate) fn from_backend(backend: Box<dyn Backend>, tracing: bool) -> Self {
        let inner = Rc::new(Inner::new(backend, tracing));
        context::register_driver(&inner);

        log::debug!(
            "driver {} created on {} backend{}",
            inner.id,
            inner.state.borrow().backend.name(),
            if tracing { " with tracing" } else { "" },
        );

        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> WeakDriver {
        WeakDriver(Rc::downgrade(&self.inner))
    }

    /// The driver whose loop is running on this thread.
    ///
    /// # Panics
    ///
    /// Panics when called outside a running loop.
    pub fn current() -> Self {
        Self::try_current().unwrap_or_else(|| panic!("{}", Error::NoCurrentDriver))
    }

    pub fn try_current() -> Option<Self> {
        context::current_driver()
    }

    #[track_caller]
    fn register(&self, kind: CallbackKind, handler: Handler) -> CallbackId {
        let site = Location::caller();
        self.inner.state.borrow_mut().register(kind, handler, site)
    }

    /// Schedules `f` to run once at the next tick.
    #[track_caller]
    pub fn defer<F>(&self, f: F) -> CallbackId
    where
        F: FnOnce(&Driver, CallbackId) -> anyhow::Result<()> + 'static,
    {
        self.register(CallbackKind::Defer, Handler::Once(Box::new(f)))
    }

    /// Schedules `f` to run once after `delay`.
    #[track_caller]
    pub fn delay<F>(&self, delay: Duration, f: F) -> CallbackId
    where
        F: FnOnce(&Driver, CallbackId) -> anyhow::Result<()> + 'static,
    {
        let kind = self.timer(delay, false);
        self.register(kind, Handler::Once(Box::new(f)))
    }

    /// Like [`delay`](Self::delay), with the delay given in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NegativeDelay`] when `seconds` is negative or not
    /// finite.
    #[track_caller]
    pub fn delay_secs<F>(&self, seconds: f64, f: F) -> Result<CallbackId>
    where
        F: FnOnce(&Driver, CallbackId) -> anyhow::Result<()> + 'static,
    {
        let delay =
            Duration::try_from_secs_f64(seconds).map_err(|_| Error::NegativeDelay(seconds))?;
        Ok(self.delay(delay, f))
    }

    /// Schedules `f` to run every `interval`.
    ///
    /// The next expiration is computed after `f` has been dispatched, so
    /// a slow callback delays later runs instead of piling them up.
    #[track_caller]
    pub fn repeat<F>(&self, interval: Duration, f: F) -> CallbackId
    where
        F: FnMut(&Driver, CallbackId) -> anyhow::Result<()> + 'static,
    {
        let kind = self.timer(interval, true);
        self.register(kind, Handler::Repeat(Box::new(f)))
    }

    /// Like [`repeat`](Self::repeat), with the interval given in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NegativeInterval`] when `seconds` is negative or
    /// not finite.
    #[track_caller]
    pub fn repeat_secs<F>(&self, seconds: f64, f: F) -> Result<CallbackId>
    where
        F: FnMut(&Driver, CallbackId) -> anyhow::Result<()> + 'static,
    {
        let interval =
            Duration::try_from_secs_f64(seconds).map_err(|_| Error::NegativeInterval(seconds))?;
        Ok(self.repeat(interval, f))
    }

    fn timer(&self, interval: Duration, repeat: bool) -> CallbackKind {
        CallbackKind::Timer {
            interval,
            repeat,
            expiration: expiration_after(self.now(), interval),
        }
    }

    /// Invokes `f` whenever `handle` is readable, until cancelled or
    /// disabled.
    ///
    /// The driver does not own the descriptor. Cancel the callback before
    /// closing it.
    #[track_caller]
    pub fn on_readable<H, F>(&self, handle: &H, f: F) -> CallbackId
    where
        H: AsRawFd + ?Sized,
        F: FnMut(&Driver, CallbackId, RawFd) -> anyhow::Result<()> + 'static,
    {
        let fd = handle.as_raw_fd();
        self.register(CallbackKind::Readable { fd }, Handler::Stream(Box::new(f)))
    }

    /// Invokes `f` whenever `handle` is writable, until cancelled or
    /// disabled.
    #[track_caller]
    pub fn on_writable<H, F>(&self, handle: &H, f: F) -> CallbackId
    where
        H: AsRawFd + ?Sized,
        F: FnMut(&Driver, CallbackId, RawFd) -> anyhow::Result<()> + 'static,
    {
        let fd = handle.as_raw_fd();
        self.register(CallbackKind::Writable { fd }, Handler::Stream(Box::new(f)))
    }

    /// Invokes `f` whenever the process receives `signal`.
    ///
    /// Deliveries of the same signal that arrive within one tick are
    /// coalesced into a single invocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedSignal`] when the backend cannot watch
    /// signals or `signal` cannot be caught.
    #[track_caller]
    pub fn on_signal<F>(&self, signal: i32, f: F) -> Result<CallbackId>
    where
        F: FnMut(&Driver, CallbackId, i32) -> anyhow::Result<()> + 'static,
    {
        if !self.inner.state.borrow().backend.supports_signals() {
            return Err(Error::UnsupportedSignal {
                signal,
                reason: "the active backend cannot watch signals",
            });
        }

        signal::validate(signal).map_err(|reason| Error::UnsupportedSignal { signal, reason })?;

        Ok(self.register(CallbackKind::Signal { signal }, Handler::Signal(Box::new(f))))
    }

    /// Re-enables a disabled callback. Timers restart their full delay.
    pub fn enable(&self, id: CallbackId) -> Result<CallbackId> {
        self.inner.state.borrow_mut().enable(id)
    }

    /// Disables a callback without forgetting it. Unknown ids are ignored.
    pub fn disable(&self, id: CallbackId) -> CallbackId {
        self.inner.state.borrow_mut().disable(id)
    }

    /// Disables and forgets a callback. Cancelling twice is harmless.
    #[track_caller]
    pub fn cancel(&self, id: CallbackId) {
        let site = Location::caller();
        let removed = {
            let mut state = self.inner.state.borrow_mut();
            let removed = state.cancel(id);
            if let Some(tracer) = &mut state.tracer {
                tracer.cancelled(id, site);
            }
            removed
        };

        drop(removed);
    }

    /// Makes the callback keep the loop alive again.
    pub fn reference(&self, id: CallbackId) -> Result<CallbackId> {
        self.set_referenced(id, true)
    }

    /// Lets the loop exit even while this callback is enabled.
    pub fn unreference(&self, id: CallbackId) -> Result<CallbackId> {
        self.set_referenced(id, false)
    }

    fn set_referenced(&self, id: CallbackId, referenced: bool) -> Result<CallbackId> {
        let mut state = self.inner.state.borrow_mut();
        match state.callbacks.get_mut(&id) {
            Some(record) => {
                record.referenced = referenced;
                Ok(id)
            }
            None => Err(state.invalid(id)),
        }
    }

    pub fn is_enabled(&self, id: CallbackId) -> Result<bool> {
        let state = self.inner.state.borrow();
        match state.callbacks.get(&id) {
            Some(record) => Ok(record.enabled),
            None => Err(state.invalid(id)),
        }
    }

    pub fn is_referenced(&self, id: CallbackId) -> Result<bool> {
        let state = self.inner.state.borrow();
        match state.callbacks.get(&id) {
            Some(record) => Ok(record.referenced),
            None => Err(state.invalid(id)),
        }
    }

    pub fn callback_type(&self, id: CallbackId) -> Result<CallbackType> {
        let state = self.inner.state.borrow();
        match state.callbacks.get(&id) {
            Some(record) => Ok(record.kind.callback_type()),
            None => Err(state.invalid(id)),
        }
    }

    /// Every live callback, in creation order.
    pub fn identifiers(&self) -> Vec<CallbackId> {
        self.inner.state.borrow().callbacks.keys().copied().collect()
    }

    /// Queues `f` to run before the next callback.
    pub fn queue<F>(&self, f: F)
    where
        F: FnOnce(&Driver) -> anyhow::Result<()> + 'static,
    {
        self.enqueue_microtask(Box::new(f));
    }

    /// Spawns a task that is polled by this driver.
    ///
    /// An error returned by the task is routed like a callback error.
    /// Tasks do not keep the loop alive by themselves: the loop only
    /// waits for the callbacks the task is blocked on.
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        let task = Task::new(Box::pin(future), Location::caller());
        log::trace!("task {} spawned at {}", task.id, task.spawned_at);
        self.insert_task(Rc::new(task))
    }

    /// Creates a suspension owned by the calling task, or by the top-level
    /// context when called outside any task.
    #[track_caller]
    pub fn suspension<T: 'static>(&self) -> Suspension<T> {
        Suspension::create(self, context::current_task(), Location::caller())
    }

    /// Runs the loop until `future` completes and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockingInTask`] inside a task,
    /// [`Error::AlreadyRunning`] inside a running loop, any uncaught error
    /// raised while the loop runs, or [`Error::Deadlock`] when the loop
    /// runs out of work before `future` completes.
    #[track_caller]
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        if context::current_task().is_some() {
            return Err(Error::BlockingInTask);
        }
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let suspension = self.suspension::<F::Output>();
        let pending = suspension.suspend();

        self.spawn(async move {
            let output = future.await;
            suspension.resume(output)?;
            Ok(())
        });

        pending.wait()
    }

    /// Runs the loop until no enabled and referenced callback remains, or
    /// until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] when called from inside the loop,
    /// the first uncaught error raised by a callback, and backend failures.
    ///
    /// Resuming a top-level suspension does not end the run. The value is
    /// kept for the next [`Suspend::wait`](crate::Suspend::wait).
    pub fn run(&self) -> Result<()> {
        loop {
            match self.run_loop()? {
                Exit::Empty | Exit::Stopped => return Ok(()),
                Exit::Resumed => continue,
            }
        }
    }

    /// Makes the loop exit once the current tick has completed.
    pub fn stop(&self) {
        self.inner.state.borrow_mut().stopped = true;
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().running
    }

    /// Installs the handler that receives errors escaping callbacks,
    /// microtasks, and tasks. Without one, such errors stop the loop.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&Driver, anyhow::Error) -> anyhow::Result<()> + 'static,
    {
        let previous = self.inner.state.borrow_mut().error_handler.replace(Rc::new(handler));
        drop(previous);
    }

    pub fn clear_error_handler(&self) {
        let previous = self.inner.state.borrow_mut().error_handler.take();
        drop(previous);
    }

    pub fn has_error_handler(&self) -> bool {
        self.inner.state.borrow().error_handler.is_some()
    }

    /// The backend's monotonic clock.
    pub fn now(&self) -> Instant {
        self.inner.state.borrow().backend.now()
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.state.borrow().backend.name()
    }

    /// Lists the callbacks currently keeping the loop alive.
    pub fn dump(&self) -> String {
        let state = self.inner.state.borrow();
        let mut out = format!(
            "driver {} ({} backend), enabled and referenced callbacks:",
            self.inner.id,
            state.backend.name()
        );

        for (id, record) in &state.callbacks {
            if !(record.enabled && record.referenced) {
                continue;
            }

            let _ = write!(out, "\n  {} callback {id}", record.kind.callback_type());
            let site = state
                .tracer
                .as_ref()
                .and_then(|tracer| tracer.creation_site(*id));
            if let Some(site) = site {
                let _ = write!(out, " created at {site}");
            }
        }

        out
    }
}

/// A driver handle that does not keep the driver alive.
///
/// Futures stored inside the driver's own tasks hold these to avoid
/// reference cycles.
#[derive(Clone)]
pub(crate) struct WeakDriver(Weak<Inner>);

impl WeakDriver {
    pub(crate) fn upgrade(&self) -> Option<Driver> {
        self.0.upgrade().map(|inner| Driver { inner })
    }

    /// Cancels `id` if the driver is still alive.
    #[track_caller]
    pub(crate) fn cancel(&self, id: CallbackId) {
        if let Some(driver) = self.upgrade() {
            driver.cancel(id);
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("id", &self.inner.id)
            .field("backend", &self.backend_name())
            .field("running", &self.is_running())
            .finish()
    }
}
