use crate::reactor::{CallbackId, Driver, WeakDriver};

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Creates a future that completes after the given duration.
///
/// The returned sleep future registers a delay callback with the current
/// driver and completes once it has fired. The deadline is measured on
/// the driver's clock, so sleeps on a virtual-time driver complete
/// without any real waiting.
///
/// # Panics
///
/// Panics if polled outside of a running driver.
///
/// # Examples
///
/// ```rust,ignore
/// use std::time::Duration;
///
/// sleep(Duration::from_millis(10)).await;
/// ```
pub fn sleep(duration: Duration) -> Sleep {
    Sleep::new(duration)
}

#[derive(Default)]
struct Shared {
    fired: bool,
    waker: Option<Waker>,
}

/// A future that completes once a specific deadline is reached.
///
/// `Sleep` registers its delay callback on first poll. The callback is
/// cancelled if the future is dropped before completion, so an abandoned
/// sleep never keeps the loop alive.
pub struct Sleep {
    duration: Duration,

    /// Fixed at creation when a driver is current, otherwise on first poll.
    deadline: Option<Instant>,

    timer: Option<(WeakDriver, CallbackId)>,

    shared: Rc<RefCell<Shared>>,
}

impl Sleep {
    pub(crate) fn new(duration: Duration) -> Self {
        let deadline = Driver::try_current().and_then(|driver| driver.now().checked_add(duration));

        Self {
            duration,
            deadline,
            timer: None,
            shared: Rc::default(),
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        {
            let mut shared = this.shared.borrow_mut();
            if shared.fired {
                return Poll::Ready(());
            }
            shared.waker = Some(cx.waker().clone());
        }

        if this.timer.is_none() {
            let driver = Driver::current();
            let remaining = match this.deadline {
                Some(deadline) => deadline.saturating_duration_since(driver.now()),
                None => this.duration,
            };

            let shared = this.shared.clone();
            let id = driver.delay(remaining, move |_, _| {
                let waker = {
                    let mut shared = shared.borrow_mut();
                    shared.fired = true;
                    shared.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
                Ok(())
            });

            this.timer = Some((driver.downgrade(), id));
        }

        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((driver, id)) = self.timer.take()
            && !self.shared.borrow().fired
        {
            driver.cancel(id);
        }
    }
}
