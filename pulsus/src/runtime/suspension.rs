//! One-shot rendezvous between a suspended context and whoever resumes it.
//!
//! A suspension owned by a task is awaited: [`Suspension::suspend`]
//! returns a [`Suspend`] future and the task is polled again as soon as
//! the value is delivered. A suspension owned by the top-level context
//! is blocked on with [`Suspend::wait`], which runs the loop until the
//! value arrives.
//!
//! Values are never delivered synchronously. `resume` and `throw` queue
//! the delivery as a microtask, so the resumer always finishes its own
//! work first.

use crate::error::{Error, Result};
use crate::reactor::{Driver, Exit, Inner, Interrupt};
use crate::runtime::context;
use crate::runtime::task::TaskId;

use std::cell::RefCell;
use std::future::Future;
use std::mem;
use std::panic::Location;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

type Site = &'static Location<'static>;

/// Type-erased view of a suspension, used to describe deadlocks.
pub(crate) trait Outstanding {
    fn is_pending(&self) -> bool;
    fn describe(&self) -> String;
}

struct Shared<T> {
    driver: Weak<Inner>,
    owner: Option<TaskId>,
    created_at: Site,
    state: RefCell<State<T>>,
}

struct State<T> {
    pending: bool,
    /// Set once a top-level wait failed; the suspension is unusable.
    dead: bool,
    suspended_at: Option<Site>,
    outcome: Option<Result<T>>,
}

impl<T> Outstanding for Shared<T> {
    fn is_pending(&self) -> bool {
        let state = self.state.borrow();
        state.pending && !state.dead
    }

    fn describe(&self) -> String {
        let state = self.state.borrow();
        let owner = match self.owner {
            Some(id) => format!("task {id}"),
            None => "the top-level context".to_string(),
        };

        match state.suspended_at {
            Some(site) => format!(
                "suspension created at {}, suspended at {site}, owned by {owner}",
                self.created_at
            ),
            None => format!("suspension created at {}, owned by {owner}", self.created_at),
        }
    }
}

/// A handle for suspending the current context until a value or an
/// error is delivered.
///
/// Obtained from [`Driver::suspension`]. Clones share the same state, so
/// one clone can be handed to a callback that resumes the other.
///
/// # Example
///
/// ```rust,ignore
/// let suspension = driver.suspension::<u32>();
/// let resumer = suspension.clone();
/// driver.delay(Duration::from_millis(5), move |_, _| {
///     resumer.resume(42)?;
///     Ok(())
/// });
///
/// assert_eq!(suspension.suspend().wait()?, 42);
/// ```
pub struct Suspension<T> {
    shared: Rc<Shared<T>>,
}

impl<T> Clone for Suspension<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> Suspension<T> {
    pub(crate) fn create(driver: &Driver, owner: Option<TaskId>, created_at: Site) -> Self {
        let shared = Rc::new(Shared {
            driver: Rc::downgrade(&driver.inner),
            owner,
            created_at,
            state: RefCell::new(State {
                pending: false,
                dead: false,
                suspended_at: None,
                outcome: None,
            }),
        });

        let entry: Rc<dyn Outstanding> = shared.clone();

        match owner.and_then(|id| driver.task(id)) {
            Some(task) => {
                let released = {
                    let mut suspensions = task.suspensions.borrow_mut();
                    let (kept, released): (Vec<_>, Vec<_>) = mem::take(&mut *suspensions)
                        .into_iter()
                        .partition(|s| s.is_pending() || Rc::strong_count(s) > 1);
                    *suspensions = kept;
                    suspensions.push(entry);
                    released
                };
                drop(released);
            }
            None => {
                let mut state = driver.inner.state.borrow_mut();
                state.main_suspensions.retain(|s| s.strong_count() > 0);
                state.main_suspensions.push(Rc::downgrade(&entry));
            }
        }

        Self { shared }
    }

    /// Suspends the owning context.
    ///
    /// Misuse is not reported here but as the output of the returned
    /// future: [`Error::DeadSuspension`] after a failed top-level wait,
    /// [`Error::AlreadySuspended`] while a previous suspend is pending,
    /// and [`Error::ForeignSuspend`] when called from a context other
    /// than the owner.
    #[track_caller]
    pub fn suspend(&self) -> Suspend<T> {
        let fault = self.begin(Location::caller()).err();

        Suspend {
            armed: fault.is_none(),
            shared: self.shared.clone(),
            fault,
        }
    }

    fn begin(&self, site: Site) -> Result<()> {
        let stale = {
            let mut state = self.shared.state.borrow_mut();
            if state.dead {
                return Err(Error::DeadSuspension);
            }
            if state.pending {
                return Err(Error::AlreadySuspended);
            }
            if context::current_task() != self.shared.owner {
                return Err(Error::ForeignSuspend);
            }

            state.pending = true;
            state.suspended_at = Some(site);
            state.outcome.take()
        };

        drop(stale);
        Ok(())
    }

    /// Delivers `value` to the suspended context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSuspended`] when no suspend is pending. A dead
    /// suspension silently ignores the value.
    pub fn resume(&self, value: T) -> Result<()> {
        self.deliver(Ok(value))
    }

    /// Delivers `error` to the suspended context, which observes it as
    /// [`Error::Thrown`].
    pub fn throw(&self, error: impl Into<anyhow::Error>) -> Result<()> {
        self.deliver(Err(Error::Thrown(error.into())))
    }

    fn deliver(&self, outcome: Result<T>) -> Result<()> {
        {
            let state = self.shared.state.borrow();
            if state.dead {
                return Ok(());
            }
            if !state.pending {
                return Err(Error::NotSuspended);
            }
        }

        let inner = self.shared.driver.upgrade().ok_or(Error::DriverDropped)?;
        let driver = Driver { inner };
        self.shared.state.borrow_mut().pending = false;

        let shared = self.shared.clone();
        driver.enqueue_microtask(Box::new(move |driver| {
            shared.state.borrow_mut().outcome = Some(outcome);
            match shared.owner {
                Some(task) => driver.run_task(task),
                None => driver.set_interrupt(Interrupt::Resume),
            }
            Ok(())
        }));

        Ok(())
    }

    /// Whether a suspend is waiting for a value.
    pub fn is_pending(&self) -> bool {
        self.shared.is_pending()
    }
}

/// The pending side of a [`Suspension`].
///
/// Await it from the owning task, or call [`wait`](Self::wait) from the
/// top-level context. Dropping it before the value arrives abandons the
/// suspend, and the suspension can be suspended again.
#[must_use = "a suspend does nothing unless awaited or waited on"]
pub struct Suspend<T> {
    shared: Rc<Shared<T>>,
    fault: Option<Error>,
    armed: bool,
}

impl<T: 'static> Suspend<T> {
    fn take_outcome(&mut self) -> Option<Result<T>> {
        let outcome = self.shared.state.borrow_mut().outcome.take();
        if outcome.is_some() {
            self.armed = false;
        }
        outcome
    }

    fn kill(&mut self) {
        let mut state = self.shared.state.borrow_mut();
        state.dead = true;
        state.pending = false;
        self.armed = false;
    }

    /// Runs the loop until the value arrives.
    ///
    /// # Errors
    ///
    /// Besides the suspend faults, returns [`Error::BlockingInTask`] when
    /// the suspension belongs to a task and [`Error::AlreadyRunning`] when
    /// called from inside the loop. If the loop fails or runs out of work
    /// first, the suspension becomes dead and the failure, or
    /// [`Error::Deadlock`], is returned.
    pub fn wait(mut self) -> Result<T> {
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }
        if self.shared.owner.is_some() {
            return Err(Error::BlockingInTask);
        }

        let inner = self.shared.driver.upgrade().ok_or(Error::DriverDropped)?;
        let driver = Driver { inner };
        if driver.is_running() {
            return Err(Error::AlreadyRunning);
        }

        loop {
            if let Some(outcome) = self.take_outcome() {
                return outcome;
            }

            match driver.run_loop() {
                Ok(Exit::Resumed) => continue,
                Ok(Exit::Empty | Exit::Stopped) => {
                    if let Some(outcome) = self.take_outcome() {
                        return outcome;
                    }

                    let outstanding =
                        driver.outstanding_suspensions(Rc::as_ptr(&self.shared) as *const ());
                    self.kill();
                    log::debug!("top-level suspension deadlocked");
                    return Err(Error::Deadlock { outstanding });
                }
                Err(error) => {
                    if self.shared.is_pending() {
                        self.kill();
                    }
                    return Err(error);
                }
            }
        }
    }
}

impl<T: 'static> Future for Suspend<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(fault) = this.fault.take() {
            return Poll::Ready(Err(fault));
        }

        // The owning task is polled directly by the delivery microtask.
        match this.take_outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for Suspend<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Ok(mut state) = self.shared.state.try_borrow_mut() {
            state.pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::backend::VirtualBackend;

    fn driver() -> Driver {
        Driver::with_backend(Box::new(VirtualBackend::new()))
    }

    #[test]
    fn resume_without_suspend_is_rejected() {
        let driver = driver();
        let suspension = driver.suspension::<()>();

        assert!(matches!(suspension.resume(()), Err(Error::NotSuspended)));
    }

    #[test]
    fn second_suspend_reports_already_suspended() {
        let driver = driver();
        let suspension = driver.suspension::<()>();

        let _first = suspension.suspend();
        let second = suspension.suspend();
        assert!(matches!(second.wait(), Err(Error::AlreadySuspended)));
    }

    #[test]
    fn dropping_suspend_allows_suspending_again() {
        let driver = driver();
        let suspension = driver.suspension::<u8>();

        drop(suspension.suspend());
        assert!(!suspension.is_pending());

        let resumer = suspension.clone();
        driver.defer(move |_, _| {
            resumer.resume(3)?;
            Ok(())
        });
        assert_eq!(suspension.suspend().wait().unwrap(), 3);
    }

    #[test]
    fn dead_suspension_ignores_resume() {
        let driver = driver();
        let suspension = driver.suspension::<()>();

        assert!(matches!(suspension.suspend().wait(), Err(Error::Deadlock { .. })));
        assert!(suspension.resume(()).is_ok());
        assert!(matches!(suspension.suspend().wait(), Err(Error::DeadSuspension)));
    }

    #[test]
    fn deadlock_lists_other_pending_suspensions() {
        let driver = driver();
        let other = driver.suspension::<()>();
        let _held = other.suspend();

        let suspension = driver.suspension::<()>();
        match suspension.suspend().wait() {
            Err(Error::Deadlock { outstanding }) => {
                assert_eq!(outstanding.len(), 1);
                assert!(outstanding[0].contains("top-level context"), "{outstanding:?}");
            }
            result => panic!("expected a deadlock, got {:?}", result.err()),
        }
    }
}
