//! Readiness futures for raw descriptors.
//!
//! These helpers wrap [`Driver::on_readable`] and
//! [`Driver::on_writable`] for use inside tasks: the watcher is
//! registered, the task is suspended until the first readiness
//! notification, and the watcher is cancelled again. Dropping the
//! future before that also cancels the watcher.
//!
//! ```rust,ignore
//! driver.spawn(async move {
//!     pulsus::io::readable(&stream).await?;
//!     let n = stream.read(&mut buf)?;
//!     Ok(())
//! });
//! ```

use crate::error::{Error, Result};
use crate::reactor::{CallbackId, Driver, WeakDriver};

use std::os::fd::{AsRawFd, RawFd};

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// Cancels the watcher when the waiting future is dropped early.
struct WatchGuard {
    driver: WeakDriver,
    id: CallbackId,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.driver.cancel(self.id);
    }
}

/// Waits until `handle` is readable.
///
/// # Errors
///
/// Returns [`Error::NoCurrentDriver`] outside a running driver, and
/// [`Error::ForeignSuspend`] when not awaited inside a task.
pub async fn readable<H: AsRawFd + ?Sized>(handle: &H) -> Result<()> {
    ready(handle.as_raw_fd(), Direction::Read).await
}

/// Waits until `handle` is writable.
///
/// # Errors
///
/// Same as [`readable`].
pub async fn writable<H: AsRawFd + ?Sized>(handle: &H) -> Result<()> {
    ready(handle.as_raw_fd(), Direction::Write).await
}

async fn ready(fd: RawFd, direction: Direction) -> Result<()> {
    let driver = Driver::try_current().ok_or(Error::NoCurrentDriver)?;
    let suspension = driver.suspension::<()>();
    let pending = suspension.suspend();

    let handler = move |driver: &Driver, id: CallbackId, _fd: RawFd| {
        driver.cancel(id);
        suspension.resume(())?;
        Ok(())
    };

    let id = match direction {
        Direction::Read => driver.on_readable(&fd, handler),
        Direction::Write => driver.on_writable(&fd, handler),
    };
    let _guard = WatchGuard {
        driver: driver.downgrade(),
        id,
    };
    drop(driver);

    pending.await
}
