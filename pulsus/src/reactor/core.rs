//! Driver core: the tick loop.
//!
//! Each tick:
//! 1. callbacks staged in the enable queue are activated in the backend
//!    or the timer queue and become invokable; staged defers go straight
//!    to the ready queue,
//! 2. the loop decides whether it may block: only when the previous
//!    tick was idle, the loop is not stopped, and some enabled and
//!    referenced callback remains,
//! 3. when blocking, already-ready work runs first, and newly enabled
//!    work downgrades the wait to a non-blocking poll,
//! 4. the backend dispatches I/O and signal readiness, bounded by the
//!    earliest timer,
//! 5. expired timers are appended to the ready queue.
//!
//! Between ticks the ready queue is drained in FIFO order, with the
//! microtask queue drained before every callback. A pending interrupt
//! is checked after each callback and microtask and unwinds the loop.

use super::backend::Backend;
use super::callback::{CallbackKind, CallbackRecord, Handler, expiration_after};
use super::timer::TimerQueue;
use super::trace::Tracer;
use super::{CallbackId, Driver};
use crate::error::{Error, Origin, Result, UncaughtError, catch_panic};
use crate::runtime::context;
use crate::runtime::suspension::Outstanding;
use crate::runtime::task::{Task, TaskId};

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::mem;
use std::panic::Location;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;
use std::time::Duration;

pub(crate) type Microtask = Box<dyn FnOnce(&Driver) -> anyhow::Result<()>>;

/// Receives errors escaping callbacks, microtasks, and tasks.
pub type ErrorHandler = Rc<dyn Fn(&Driver, anyhow::Error) -> anyhow::Result<()>>;

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Single-slot request to unwind the run loop.
pub(crate) enum Interrupt {
    /// The top-level suspension has a value waiting.
    Resume,
    Fail(Error),
}

impl Interrupt {
    fn into_exit(self) -> Result<Exit> {
        match self {
            Interrupt::Resume => Ok(Exit::Resumed),
            Interrupt::Fail(error) => Err(error),
        }
    }
}

/// Why the run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// No enabled and referenced callback remains.
    Empty,
    Stopped,
    Resumed,
}

pub(crate) struct Inner {
    pub(crate) id: u64,
    pub(crate) state: RefCell<State>,
}

impl Inner {
    pub(crate) fn new(backend: Box<dyn Backend>, tracing: bool) -> Self {
        Self {
            id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
            state: RefCell::new(State::new(backend, tracing)),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        context::unregister_driver(self.id);
    }
}

pub(crate) struct State {
    pub(crate) backend: Box<dyn Backend>,
    next_id: u64,
    pub(crate) callbacks: BTreeMap<CallbackId, CallbackRecord>,
    enable_queue: Vec<CallbackId>,
    enable_defer_queue: Vec<CallbackId>,
    ready: VecDeque<CallbackId>,
    microtasks: VecDeque<Microtask>,
    timers: TimerQueue,
    /// Reused buffer the backend reports readiness into.
    scratch: Vec<CallbackId>,
    interrupt: Option<Interrupt>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) tracer: Option<Tracer>,
    pub(crate) running: bool,
    pub(crate) stopped: bool,
    idle: bool,
    pub(crate) tasks: HashMap<TaskId, Rc<Task>>,
    /// Suspensions created outside any task.
    pub(crate) main_suspensions: Vec<Weak<dyn Outstanding>>,
}

impl State {
    fn new(backend: Box<dyn Backend>, tracing: bool) -> Self {
        Self {
            backend,
            next_id: 1,
            callbacks: BTreeMap::new(),
            enable_queue: Vec::new(),
            enable_defer_queue: Vec::new(),
            ready: VecDeque::new(),
            microtasks: VecDeque::new(),
            timers: TimerQueue::new(),
            scratch: Vec::new(),
            interrupt: None,
            error_handler: None,
            tracer: tracing.then(Tracer::new),
            running: false,
            stopped: false,
            idle: false,
            tasks: HashMap::new(),
            main_suspensions: Vec::new(),
        }
    }

    pub(crate) fn register(
        &mut self,
        kind: CallbackKind,
        handler: Handler,
        site: &'static Location<'static>,
    ) -> CallbackId {
        let id = CallbackId::from_raw(self.next_id);
        self.next_id += 1;

        self.callbacks.insert(id, CallbackRecord::new(kind, handler));
        match kind {
            CallbackKind::Defer => self.enable_defer_queue.push(id),
            _ => self.enable_queue.push(id),
        }

        if let Some(tracer) = &mut self.tracer {
            tracer.created(id, site);
        }

        id
    }

    pub(crate) fn invalid(&self, id: CallbackId) -> Error {
        let detail = match &self.tracer {
            Some(tracer) => tracer.explain_invalid(id),
            None => String::new(),
        };

        Error::InvalidCallback { id, detail }
    }

    /// Marks a callback enabled and stages it for activation at the next
    /// tick. Timers get a fresh expiration.
    pub(crate) fn enable(&mut self, id: CallbackId) -> Result<CallbackId> {
        let now = self.backend.now();
        let Some(record) = self.callbacks.get_mut(&id) else {
            return Err(self.invalid(id));
        };

        if record.enabled {
            return Ok(id);
        }

        record.enabled = true;

        match &mut record.kind {
            CallbackKind::Defer => self.enable_defer_queue.push(id),
            CallbackKind::Timer {
                interval,
                expiration,
                ..
            } => {
                *expiration = expiration_after(now, *interval);
                self.enable_queue.push(id);
            }
            _ => self.enable_queue.push(id),
        }

        Ok(id)
    }

    /// Disables a callback, removing it from whichever queue or backend
    /// currently holds it. Unknown ids are ignored.
    pub(crate) fn disable(&mut self, id: CallbackId) -> CallbackId {
        let Some(record) = self.callbacks.get_mut(&id) else {
            return id;
        };

        if !record.enabled {
            return id;
        }

        record.enabled = false;
        record.invokable = false;
        let kind = record.kind;
        let active = mem::replace(&mut record.active, false);

        match kind {
            CallbackKind::Defer => self.enable_defer_queue.retain(|queued| *queued != id),
            _ if !active => self.enable_queue.retain(|queued| *queued != id),
            CallbackKind::Timer { .. } => {
                self.timers.remove(id);
            }
            _ => {
                if let Some(watcher) = kind.watcher(id) {
                    self.backend.deactivate(&watcher);
                }
            }
        }

        id
    }

    /// Disables and forgets a callback. The removed record is returned so
    /// its handler can be dropped outside the state borrow.
    pub(crate) fn cancel(&mut self, id: CallbackId) -> Option<CallbackRecord> {
        self.disable(id);
        self.callbacks.remove(&id)
    }

    /// Whether no enabled and referenced callback remains.
    pub(crate) fn is_empty(&self) -> bool {
        !self
            .callbacks
            .values()
            .any(|record| record.enabled && record.referenced)
    }

    fn has_staged(&self) -> bool {
        !self.enable_queue.is_empty() || !self.enable_defer_queue.is_empty()
    }

    fn enqueue(&mut self, id: CallbackId) {
        self.ready.push_back(id);
        self.idle = false;
    }

    pub(crate) fn queue_microtask(&mut self, microtask: Microtask) {
        self.microtasks.push_back(microtask);
    }

    pub(crate) fn set_interrupt(&mut self, interrupt: Interrupt) {
        if let Some(Interrupt::Fail(previous)) = &self.interrupt {
            log::debug!("pending interrupt overwritten; discarded: {previous}");
        }

        self.interrupt = Some(interrupt);
    }

    fn take_interrupt(&mut self) -> Option<Interrupt> {
        self.interrupt.take()
    }

    fn activate(&mut self) -> io::Result<()> {
        let staged = mem::take(&mut self.enable_queue);
        let mut watchers = Vec::new();

        for id in staged {
            let Some(record) = self.callbacks.get_mut(&id) else {
                continue;
            };
            if !record.enabled || record.active {
                continue;
            }

            record.invokable = true;
            record.active = true;

            match record.kind {
                CallbackKind::Timer { expiration, .. } => self.timers.insert(id, expiration),
                kind => watchers.extend(kind.watcher(id)),
            }
        }

        if !watchers.is_empty() {
            self.backend.activate(&watchers)?;
        }

        for id in mem::take(&mut self.enable_defer_queue) {
            let Some(record) = self.callbacks.get_mut(&id) else {
                continue;
            };
            if !record.enabled {
                continue;
            }

            record.invokable = true;
            self.enqueue(id);
        }

        Ok(())
    }

    fn dispatch(&mut self, blocking: bool) -> io::Result<()> {
        let timeout = if blocking {
            let now = self.backend.now();
            self.timers
                .peek()
                .map(|expiration| expiration.saturating_duration_since(now))
        } else {
            Some(Duration::ZERO)
        };

        let mut ready = mem::take(&mut self.scratch);
        let result = self.backend.dispatch(timeout, &mut ready);
        for id in ready.drain(..) {
            self.enqueue(id);
        }
        self.scratch = ready;
        result?;

        let now = self.backend.now();
        while let Some(id) = self.timers.extract(now) {
            self.enqueue(id);
        }

        Ok(())
    }
}

enum Next {
    Microtask(Microtask),
    Callback(CallbackId),
}

impl Driver {
    /// Runs ticks until the loop is empty, stopped, or interrupted.
    pub(crate) fn run_loop(&self) -> Result<Exit> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.running {
                return Err(Error::AlreadyRunning);
            }
            state.running = true;
            state.stopped = false;
        }

        let exit = context::enter_driver(self, || self.drive());
        self.inner.state.borrow_mut().running = false;

        match &exit {
            Ok(exit) => log::trace!("driver {} loop exited: {exit:?}", self.inner.id),
            Err(e) => log::debug!("driver {} loop unwound: {e}", self.inner.id),
        }

        exit
    }

    fn drive(&self) -> Result<Exit> {
        if let Some(exit) = self.invoke_callbacks()? {
            return Ok(exit);
        }

        loop {
            let previous_idle = {
                let mut state = self.inner.state.borrow_mut();
                if state.stopped {
                    return Ok(Exit::Stopped);
                }
                if let Some(interrupt) = state.take_interrupt() {
                    return interrupt.into_exit();
                }
                if state.is_empty() {
                    return Ok(Exit::Empty);
                }

                mem::replace(&mut state.idle, true)
            };

            if let Some(exit) = self.tick(previous_idle)? {
                return Ok(exit);
            }
            if let Some(exit) = self.invoke_callbacks()? {
                return Ok(exit);
            }
        }
    }

    fn tick(&self, previous_idle: bool) -> Result<Option<Exit>> {
        let mut blocking = {
            let mut state = self.inner.state.borrow_mut();
            state.activate()?;
            previous_idle && !state.stopped && !state.is_empty()
        };

        if blocking {
            if let Some(exit) = self.invoke_callbacks()? {
                return Ok(Some(exit));
            }

            let state = self.inner.state.borrow();
            if state.has_staged() || state.stopped || state.is_empty() {
                blocking = false;
            }
        }

        self.inner.state.borrow_mut().dispatch(blocking)?;

        Ok(None)
    }

    /// Drains microtasks and ready callbacks. Returns early when an
    /// interrupt is raised.
    fn invoke_callbacks(&self) -> Result<Option<Exit>> {
        loop {
            let next = {
                let mut state = self.inner.state.borrow_mut();
                if let Some(microtask) = state.microtasks.pop_front() {
                    Next::Microtask(microtask)
                } else if let Some(id) = state.ready.pop_front() {
                    Next::Callback(id)
                } else {
                    return Ok(None);
                }
            };

            match next {
                Next::Microtask(microtask) => {
                    if let Err(error) = catch_panic(|| microtask(self)) {
                        self.route_error(Origin::Microtask, error);
                    }
                }
                Next::Callback(id) => self.invoke(id),
            }

            let interrupt = self.inner.state.borrow_mut().take_interrupt();
            if let Some(interrupt) = interrupt {
                return interrupt.into_exit().map(Some);
            }
        }
    }

    fn invoke(&self, id: CallbackId) {
        let (kind, handler, removed) = {
            let mut state = self.inner.state.borrow_mut();
            let Some(record) = state.callbacks.get_mut(&id) else {
                return;
            };
            if !record.invokable {
                return;
            }

            let kind = record.kind;
            let handler = record.handler.take();

            let removed = match kind {
                CallbackKind::Defer | CallbackKind::Timer { repeat: false, .. } => state.cancel(id),
                CallbackKind::Timer { repeat: true, .. } => {
                    // Re-enabling re-inserts the timer at the next tick with a
                    // fresh expiration, so it cannot fire twice in this one.
                    state.disable(id);
                    let _ = state.enable(id);
                    None
                }
                _ => None,
            };

            (kind, handler, removed)
        };
        drop(removed);

        let Some(handler) = handler else {
            return;
        };

        let (handler, result) = handler.call(self, id, &kind);

        if let Some(handler) = handler {
            let leftover = {
                let mut state = self.inner.state.borrow_mut();
                match state.callbacks.get_mut(&id) {
                    Some(record) if record.handler.is_none() => {
                        record.handler = Some(handler);
                        None
                    }
                    _ => Some(handler),
                }
            };
            drop(leftover);
        }

        if let Err(error) = result {
            let origin = Origin::Callback {
                id,
                kind: kind.callback_type(),
            };
            self.route_error(origin, error);
        }
    }

    /// Hands an error to the error handler, or raises it as an interrupt
    /// when none is installed or the handler fails itself.
    pub(crate) fn route_error(&self, origin: Origin, error: anyhow::Error) {
        let handler = self.inner.state.borrow().error_handler.clone();

        let Some(handler) = handler else {
            log::debug!("uncaught error in {origin}: {error:#}");
            let uncaught = UncaughtError::wrap(origin, error);
            self.set_interrupt(Interrupt::Fail(Error::Uncaught(uncaught)));
            return;
        };

        if let Err(error) = catch_panic(|| handler(self, error)) {
            let uncaught = UncaughtError::wrap(Origin::ErrorHandler, error);
            self.set_interrupt(Interrupt::Fail(Error::Uncaught(uncaught)));
        }
    }

    pub(crate) fn set_interrupt(&self, interrupt: Interrupt) {
        self.inner.state.borrow_mut().set_interrupt(interrupt);
    }

    pub(crate) fn enqueue_microtask(&self, microtask: Microtask) {
        self.inner.state.borrow_mut().queue_microtask(microtask);
    }

    pub(crate) fn insert_task(&self, task: Rc<Task>) -> TaskId {
        let id = task.id;
        self.inner.state.borrow_mut().tasks.insert(id, task);
        self.schedule_task(id);
        id
    }

    pub(crate) fn task(&self, id: TaskId) -> Option<Rc<Task>> {
        self.inner.state.borrow().tasks.get(&id).cloned()
    }

    /// Queues a poll of the task unless one is already queued.
    pub(crate) fn schedule_task(&self, id: TaskId) {
        let Some(task) = self.task(id) else {
            return;
        };
        if task.scheduled.replace(true) {
            return;
        }

        self.enqueue_microtask(Box::new(move |driver| {
            driver.run_task(id);
            Ok(())
        }));
    }

    /// Polls a task once and retires it when it completes.
    pub(crate) fn run_task(&self, id: TaskId) {
        let Some(task) = self.task(id) else {
            return;
        };
        task.scheduled.set(false);

        let Poll::Ready(result) = task.poll(self) else {
            return;
        };

        let retired = self.inner.state.borrow_mut().tasks.remove(&id);
        log::trace!("task {id} completed");
        drop(retired);

        if let Err(error) = result {
            self.route_error(Origin::Task(id), error);
        }
    }

    /// Describes every pending suspension except `exclude`.
    pub(crate) fn outstanding_suspensions(&self, exclude: *const ()) -> Vec<String> {
        let (main, tasks) = {
            let state = self.inner.state.borrow();
            let main: Vec<_> = state
                .main_suspensions
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            let tasks: Vec<_> = state.tasks.values().cloned().collect();
            (main, tasks)
        };

        let mut outstanding: Vec<String> = main
            .iter()
            .filter(|suspension| Rc::as_ptr(suspension) as *const () != exclude)
            .filter(|suspension| suspension.is_pending())
            .map(|suspension| suspension.describe())
            .collect();

        for task in &tasks {
            for suspension in task.suspensions.borrow().iter() {
                if Rc::as_ptr(suspension) as *const () != exclude && suspension.is_pending() {
                    outstanding.push(suspension.describe());
                }
            }
        }

        outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::backend::VirtualBackend;

    fn driver() -> Driver {
        Driver::from_backend(Box::new(VirtualBackend::new()), false)
    }

    #[test]
    fn last_interrupt_wins() {
        let driver = driver();

        driver.route_error(Origin::Microtask, anyhow::anyhow!("first"));
        driver.route_error(Origin::Microtask, anyhow::anyhow!("second"));

        let interrupt = driver.inner.state.borrow_mut().take_interrupt();
        match interrupt {
            Some(Interrupt::Fail(error)) => assert!(error.to_string().ends_with("second")),
            _ => panic!("expected a failure interrupt"),
        }
    }

    #[test]
    fn staged_callbacks_only_become_invokable_at_activation() {
        let driver = driver();
        let id = driver.delay(Duration::from_millis(1), |_, _| Ok(()));

        {
            let state = driver.inner.state.borrow();
            assert!(!state.callbacks[&id].invokable);
            assert!(state.has_staged());
        }

        driver.inner.state.borrow_mut().activate().unwrap();

        let state = driver.inner.state.borrow();
        assert!(state.callbacks[&id].invokable);
        assert!(state.callbacks[&id].active);
        assert_eq!(state.timers.len(), 1);
    }

    #[test]
    fn disabling_an_active_timer_removes_it_from_the_queue() {
        let driver = driver();
        let id = driver.delay(Duration::from_millis(1), |_, _| Ok(()));
        driver.inner.state.borrow_mut().activate().unwrap();

        driver.disable(id);

        let state = driver.inner.state.borrow();
        assert_eq!(state.timers.len(), 0);
        assert!(!state.callbacks[&id].active);
        assert!(state.is_empty());
    }
}
