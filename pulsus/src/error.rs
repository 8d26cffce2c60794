//! Error types returned by the driver.
//!
//! Configuration faults (unknown ids, negative delays, unsupported
//! signals) and suspension misuse are reported synchronously at the
//! call site. Backend faults and uncaught callback errors unwind the run
//! loop and surface from [`Driver::run`](crate::Driver::run) or
//! [`Suspend::wait`](crate::Suspend::wait).

use crate::reactor::{CallbackId, CallbackType};
use crate::runtime::task::TaskId;

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation referenced a callback id the driver does not know.
    #[error("invalid callback identifier {id}{detail}")]
    InvalidCallback { id: CallbackId, detail: String },

    #[error("delay must be a finite number of seconds greater than or equal to zero, got {0}")]
    NegativeDelay(f64),

    #[error("interval must be a finite number of seconds greater than or equal to zero, got {0}")]
    NegativeInterval(f64),

    #[error("cannot watch signal {signal}: {reason}")]
    UnsupportedSignal { signal: i32, reason: &'static str },

    #[error("unknown backend {0:?} (expected one of: epoll, poll, virtual)")]
    UnknownBackend(String),

    #[error("backend {0} is not supported on this platform")]
    UnsupportedBackend(&'static str),

    /// The polling backend failed; the loop cannot continue.
    #[error("backend failure: {0}")]
    Backend(#[from] io::Error),

    #[error(transparent)]
    Uncaught(#[from] UncaughtError),

    #[error("the event loop is already running")]
    AlreadyRunning,

    #[error("no event loop is running on this thread")]
    NoCurrentDriver,

    #[error("the driver owning this suspension has been dropped")]
    DriverDropped,

    #[error("must call suspend() before calling resume() or throw()")]
    NotSuspended,

    #[error("must call resume() or throw() before calling suspend() again")]
    AlreadySuspended,

    #[error("must not call suspend() from a task that does not own the suspension")]
    ForeignSuspend,

    #[error("cannot block on a suspension from inside a task; await it instead")]
    BlockingInTask,

    #[error("suspension cannot be suspended after an uncaught error was thrown from the event loop")]
    DeadSuspension,

    /// The loop ran out of work while the top-level suspension was still pending.
    #[error(
        "event loop terminated without resuming the current suspension (the cause is either a task deadlock, or an incorrectly unreferenced or cancelled callback){}",
        format_outstanding(.outstanding)
    )]
    Deadlock { outstanding: Vec<String> },

    /// An error delivered through [`Suspension::throw`](crate::Suspension::throw).
    #[error(transparent)]
    Thrown(anyhow::Error),
}

fn format_outstanding(outstanding: &[String]) -> String {
    outstanding
        .iter()
        .map(|entry| format!("\n  {entry}"))
        .collect()
}

/// Where an uncaught error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Callback { id: CallbackId, kind: CallbackType },
    Microtask,
    Task(TaskId),
    ErrorHandler,
}

impl Origin {
    fn hint(&self) -> &'static str {
        match self {
            Origin::ErrorHandler => "",
            _ => "; use Driver::set_error_handler() to gracefully handle such errors",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Callback { id, kind } => write!(f, "{kind} callback {id}"),
            Origin::Microtask => f.write_str("microtask"),
            Origin::Task(id) => write!(f, "task {id}"),
            Origin::ErrorHandler => f.write_str("error handler"),
        }
    }
}

/// An error that escaped a callback, microtask, task, or the error
/// handler and was converted into a loop interrupt.
#[derive(Debug, thiserror::Error)]
#[error("uncaught error thrown in event loop {origin}{hint}: {source}", hint = .origin.hint())]
pub struct UncaughtError {
    origin: Origin,
    #[source]
    source: anyhow::Error,
}

impl UncaughtError {
    /// Wraps `error`, unless it already is an uncaught error raised further
    /// down, in which case it is passed through unchanged.
    pub(crate) fn wrap(origin: Origin, error: anyhow::Error) -> Self {
        let error = match error.downcast::<UncaughtError>() {
            Ok(uncaught) => return uncaught,
            Err(error) => error,
        };

        match error.downcast::<Error>() {
            Ok(Error::Uncaught(uncaught)) => uncaught,
            Ok(other) => Self {
                origin,
                source: other.into(),
            },
            Err(error) => Self {
                origin,
                source: error,
            },
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// The error originally raised.
    pub fn error(&self) -> &anyhow::Error {
        &self.source
    }

    pub fn into_error(self) -> anyhow::Error {
        self.source
    }
}

/// Runs user code, turning a panic into an error value.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> anyhow::Result<R>) -> anyhow::Result<R> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(panic_error(payload)))
}

/// Converts a caught panic payload into an error value.
pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };

    anyhow::anyhow!("panicked: {message}")
}
