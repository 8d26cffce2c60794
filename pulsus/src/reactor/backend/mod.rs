//! Pluggable polling backends.
//!
//! A backend waits for readiness of the file descriptors and signals the
//! driver has activated, bounded by a timeout the driver derives from its
//! timer queue, and reports every ready callback id in the order the
//! driver should invoke them. Timers never reach the backend.
//!
//! Available backends:
//! - [`EpollBackend`], level-triggered `epoll(7)` (Linux only),
//! - [`PollBackend`], portable `poll(2)`,
//! - [`VirtualBackend`], a deterministic clock without any I/O, for tests.
//!
//! The backend used by a driver is picked by
//! [`DriverBuilder`](crate::DriverBuilder), either explicitly or from
//! the `PULSUS_DRIVER` environment variable.

pub(crate) mod common;
pub(crate) mod signal;
pub(crate) mod unix;

#[cfg(target_os = "linux")]
mod epoll;
mod poll;
mod virtual_time;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;
pub use poll::PollBackend;
pub use virtual_time::VirtualBackend;

use crate::error::Error;
use crate::reactor::CallbackId;

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// What a watcher waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watch {
    Readable(RawFd),
    Writable(RawFd),
    Signal(i32),
}

/// A callback the backend is asked to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watcher {
    pub id: CallbackId,
    pub watch: Watch,
}

/// The contract between the driver and a polling mechanism.
pub trait Backend {
    /// Short name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Monotonic time as seen by this backend.
    fn now(&self) -> Instant;

    /// Starts watching a batch of newly enabled callbacks.
    fn activate(&mut self, watchers: &[Watcher]) -> io::Result<()>;

    /// Stops watching a callback. Unknown watchers are ignored.
    fn deactivate(&mut self, watcher: &Watcher);

    /// Waits for readiness for at most `timeout` (`None` waits
    /// indefinitely) and appends the ids of every ready callback to
    /// `ready`. Readable callbacks come before writable ones.
    fn dispatch(&mut self, timeout: Option<Duration>, ready: &mut Vec<CallbackId>)
    -> io::Result<()>;

    /// Whether [`Watch::Signal`] watchers can be activated.
    fn supports_signals(&self) -> bool {
        false
    }
}

/// The built-in backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Epoll,
    Poll,
    Virtual,
}

impl BackendKind {
    /// The highest-throughput backend available on this platform.
    pub fn best_available() -> Self {
        if cfg!(target_os = "linux") {
            BackendKind::Epoll
        } else {
            BackendKind::Poll
        }
    }

    pub fn is_supported(self) -> bool {
        match self {
            BackendKind::Epoll => cfg!(target_os = "linux"),
            BackendKind::Poll | BackendKind::Virtual => true,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Epoll => "epoll",
            BackendKind::Poll => "poll",
            BackendKind::Virtual => "virtual",
        }
    }

    /// The next more portable backend to try when this one fails to start.
    pub(crate) fn fallback(self) -> Option<Self> {
        match self {
            BackendKind::Epoll => Some(BackendKind::Poll),
            BackendKind::Poll | BackendKind::Virtual => None,
        }
    }

    pub(crate) fn create(self) -> io::Result<Box<dyn Backend>> {
        match self {
            #[cfg(target_os = "linux")]
            BackendKind::Epoll => Ok(Box::new(EpollBackend::new()?)),
            #[cfg(not(target_os = "linux"))]
            BackendKind::Epoll => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "epoll is only available on Linux",
            )),
            BackendKind::Poll => Ok(Box::new(PollBackend::new())),
            BackendKind::Virtual => Ok(Box::new(VirtualBackend::new())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "epoll" => Ok(BackendKind::Epoll),
            "poll" => Ok(BackendKind::Poll),
            "virtual" => Ok(BackendKind::Virtual),
            _ => Err(Error::UnknownBackend(s.to_string())),
        }
    }
}
