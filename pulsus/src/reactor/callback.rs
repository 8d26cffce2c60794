use crate::error::catch_panic;
use crate::reactor::Driver;
use crate::reactor::backend::{Watch, Watcher};

use std::fmt;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Identifier of a callback registered on a [`Driver`].
///
/// Identifiers are allocated from a monotonically increasing counter and
/// are never reused by the same driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of work a callback was registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackType {
    Defer,
    Delay,
    Repeat,
    Readable,
    Writable,
    Signal,
}

impl fmt::Display for CallbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallbackType::Defer => "defer",
            CallbackType::Delay => "delay",
            CallbackType::Repeat => "repeat",
            CallbackType::Readable => "readable",
            CallbackType::Writable => "writable",
            CallbackType::Signal => "signal",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum CallbackKind {
    Defer,
    Timer {
        interval: Duration,
        repeat: bool,
        expiration: Instant,
    },
    Readable {
        fd: RawFd,
    },
    Writable {
        fd: RawFd,
    },
    Signal {
        signal: i32,
    },
}

impl CallbackKind {
    pub(crate) fn callback_type(&self) -> CallbackType {
        match self {
            CallbackKind::Defer => CallbackType::Defer,
            CallbackKind::Timer { repeat: false, .. } => CallbackType::Delay,
            CallbackKind::Timer { repeat: true, .. } => CallbackType::Repeat,
            CallbackKind::Readable { .. } => CallbackType::Readable,
            CallbackKind::Writable { .. } => CallbackType::Writable,
            CallbackKind::Signal { .. } => CallbackType::Signal,
        }
    }

    /// The backend watcher for kinds the backend is responsible for.
    ///
    /// Defers never reach the backend and timers live in the driver's
    /// own timer queue.
    pub(crate) fn watcher(&self, id: CallbackId) -> Option<Watcher> {
        let watch = match *self {
            CallbackKind::Readable { fd } => Watch::Readable(fd),
            CallbackKind::Writable { fd } => Watch::Writable(fd),
            CallbackKind::Signal { signal } => Watch::Signal(signal),
            CallbackKind::Defer | CallbackKind::Timer { .. } => return None,
        };

        Some(Watcher { id, watch })
    }
}

/// Bound applied to timer expirations that would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// The instant `interval` after `now`, clamped to a far-future bound.
pub(crate) fn expiration_after(now: Instant, interval: Duration) -> Instant {
    now.checked_add(interval).unwrap_or_else(|| now + FAR_FUTURE)
}

pub(crate) type OnceFn = Box<dyn FnOnce(&Driver, CallbackId) -> anyhow::Result<()>>;
pub(crate) type RepeatFn = Box<dyn FnMut(&Driver, CallbackId) -> anyhow::Result<()>>;
pub(crate) type StreamFn = Box<dyn FnMut(&Driver, CallbackId, RawFd) -> anyhow::Result<()>>;
pub(crate) type SignalFn = Box<dyn FnMut(&Driver, CallbackId, i32) -> anyhow::Result<()>>;

/// The user closure attached to a callback record.
pub(crate) enum Handler {
    Once(OnceFn),
    Repeat(RepeatFn),
    Stream(StreamFn),
    Signal(SignalFn),
}

impl Handler {
    /// Runs the handler, converting panics into errors.
    ///
    /// Reusable handlers are handed back so the driver can reattach them
    /// to the record if it still exists.
    pub(crate) fn call(
        self,
        driver: &Driver,
        id: CallbackId,
        kind: &CallbackKind,
    ) -> (Option<Handler>, anyhow::Result<()>) {
        match (self, *kind) {
            (Handler::Once(f), _) => (None, catch_panic(|| f(driver, id))),
            (Handler::Repeat(mut f), _) => {
                let result = catch_panic(|| f(driver, id));
                (Some(Handler::Repeat(f)), result)
            }
            (Handler::Stream(mut f), CallbackKind::Readable { fd })
            | (Handler::Stream(mut f), CallbackKind::Writable { fd }) => {
                let result = catch_panic(|| f(driver, id, fd));
                (Some(Handler::Stream(f)), result)
            }
            (Handler::Signal(mut f), CallbackKind::Signal { signal }) => {
                let result = catch_panic(|| f(driver, id, signal));
                (Some(Handler::Signal(f)), result)
            }
            (handler, kind) => (
                Some(handler),
                Err(anyhow::anyhow!(
                    "handler does not match {} callback {id}",
                    kind.callback_type()
                )),
            ),
        }
    }
}

/// A unit of pending work owned by the driver.
pub(crate) struct CallbackRecord {
    pub(crate) kind: CallbackKind,
    /// Taken out while the handler runs.
    pub(crate) handler: Option<Handler>,
    pub(crate) enabled: bool,
    /// Set once the record has been activated at a tick boundary.
    pub(crate) invokable: bool,
    pub(crate) referenced: bool,
    /// Inserted into the timer queue or the backend.
    pub(crate) active: bool,
}

impl CallbackRecord {
    pub(crate) fn new(kind: CallbackKind, handler: Handler) -> Self {
        Self {
            kind,
            handler: Some(handler),
            enabled: true,
            invokable: false,
            referenced: true,
            active: false,
        }
    }
}
