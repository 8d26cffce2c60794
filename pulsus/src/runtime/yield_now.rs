use crate::reactor::{CallbackId, Driver, WeakDriver};

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// A future that yields execution back to the driver exactly once.
struct YieldOnce {
    deferred: Option<(WeakDriver, CallbackId)>,
    fired: Rc<Cell<bool>>,
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = ();

    /// On the first poll, a defer callback is registered that wakes the
    /// task at the next tick, letting ready callbacks and I/O run first.
    /// Outside a driver, the task is rescheduled immediately instead.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.yielded {
            if this.deferred.is_some() && !this.fired.get() {
                return Poll::Pending;
            }
            this.deferred = None;
            return Poll::Ready(());
        }

        this.yielded = true;

        match Driver::try_current() {
            Some(driver) => {
                let waker = cx.waker().clone();
                let fired = this.fired.clone();
                let id = driver.defer(move |_, _| {
                    fired.set(true);
                    waker.wake();
                    Ok(())
                });
                this.deferred = Some((driver.downgrade(), id));
            }
            None => cx.waker().wake_by_ref(),
        }

        Poll::Pending
    }
}

impl Drop for YieldOnce {
    fn drop(&mut self) {
        if let Some((driver, id)) = self.deferred.take()
            && !self.fired.get()
        {
            driver.cancel(id);
        }
    }
}

/// Yields execution back to the driver.
///
/// The task resumes at the next tick, after the callbacks that are
/// already ready have run.
///
/// # Examples
///
/// ```rust,ignore
/// driver.spawn(async {
///     // Allow other callbacks to run
///     yield_now().await;
///     Ok(())
/// });
/// ```
pub async fn yield_now() {
    YieldOnce {
        deferred: None,
        fired: Rc::new(Cell::new(false)),
        yielded: false,
    }
    .await
}
