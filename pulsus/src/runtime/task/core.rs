use crate::error::panic_error;
use crate::reactor::Driver;
use crate::runtime::context;
use crate::runtime::suspension::Outstanding;
use crate::runtime::task::waker::make_waker;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a task spawned with [`Driver::spawn`].
///
/// Unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>>>>;

/// A spawned future and the suspensions it owns.
pub(crate) struct Task {
    pub(crate) id: TaskId,

    /// Taken out while polled, and dropped once the future completes.
    future: RefCell<Option<BoxFuture>>,

    /// Whether a poll is already queued as a microtask.
    pub(crate) scheduled: Cell<bool>,

    /// Suspensions created while this task was running.
    pub(crate) suspensions: RefCell<Vec<Rc<dyn Outstanding>>>,

    pub(crate) spawned_at: &'static Location<'static>,
}

impl Task {
    pub(crate) fn new(future: BoxFuture, spawned_at: &'static Location<'static>) -> Self {
        Self {
            id: TaskId::next(),
            future: RefCell::new(Some(future)),
            scheduled: Cell::new(false),
            suspensions: RefCell::new(Vec::new()),
            spawned_at,
        }
    }

    /// Polls the future once inside the task context.
    ///
    /// A panic is reported as the task's error. Polling a task whose
    /// future is already out (a re-entrant poll) does nothing.
    pub(crate) fn poll(&self, driver: &Driver) -> Poll<anyhow::Result<()>> {
        let Some(mut future) = self.future.borrow_mut().take() else {
            return Poll::Pending;
        };

        let waker = make_waker(driver.inner.id, self.id);
        let mut cx = Context::from_waker(&waker);

        let poll = context::enter_task(self.id, || {
            catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        });

        match poll {
            Ok(Poll::Pending) => {
                *self.future.borrow_mut() = Some(future);
                Poll::Pending
            }
            Ok(Poll::Ready(result)) => Poll::Ready(result),
            Err(payload) => Poll::Ready(Err(panic_error(payload))),
        }
    }
}
