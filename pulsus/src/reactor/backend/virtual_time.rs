use super::{Backend, Watch, Watcher};
use crate::reactor::CallbackId;

use std::io;
use std::time::{Duration, Instant};

/// A backend with a virtual clock and no I/O.
///
/// Every bounded wait advances the clock by exactly the requested amount
/// and returns immediately, so timer-driven programs run deterministically
/// and instantly. Descriptor and signal watchers are rejected, and an
/// unbounded wait is reported as an error because nothing could ever end
/// it.
pub struct VirtualBackend {
    origin: Instant,
    elapsed: Duration,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Duration::ZERO,
        }
    }

    /// Time elapsed on the virtual clock since the backend was created.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for VirtualBackend {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn now(&self) -> Instant {
        self.origin + self.elapsed
    }

    fn activate(&mut self, watchers: &[Watcher]) -> io::Result<()> {
        match watchers.first().map(|watcher| watcher.watch) {
            None => Ok(()),
            Some(Watch::Signal(_)) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the virtual backend cannot watch signals",
            )),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the virtual backend cannot watch file descriptors",
            )),
        }
    }

    fn deactivate(&mut self, _watcher: &Watcher) {}

    fn dispatch(
        &mut self,
        timeout: Option<Duration>,
        _ready: &mut Vec<CallbackId>,
    ) -> io::Result<()> {
        match timeout {
            Some(timeout) => {
                self.elapsed += timeout;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "virtual clock asked to wait with nothing that could wake it",
            )),
        }
    }
}
