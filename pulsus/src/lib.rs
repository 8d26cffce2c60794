//! # Pulsus
//!
//! **Pulsus** is a single-threaded, cooperative event loop for the
//! **Nebula** ecosystem.
//!
//! A [`Driver`] multiplexes deferred callbacks, one-shot and repeating
//! timers, descriptor readiness, and POSIX signals on one thread. On top
//! of those callbacks it runs tasks (plain Rust futures) and
//! [`Suspension`]s, which let any context wait for a value delivered by
//! a callback.
//!
//! The driver offers:
//!
//! - **Deterministic ordering**: work registered during a tick runs at the
//!   next tick, ready callbacks run in FIFO order, and microtasks run
//!   before every callback
//! - **Pluggable backends**: epoll on Linux, poll(2) everywhere, and a
//!   virtual-time backend for tests
//! - **Error routing** through an installable error handler, or as an
//!   [`UncaughtError`] that stops the loop
//! - **Async helpers** such as [`time::sleep`], [`io::readable`], and
//!   [`yield_now`]
//! - **Ergonomic macros** like `#[pulsus::main]` and `#[pulsus::test]`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pulsus::time::sleep;
//! use std::time::Duration;
//!
//! #[pulsus::main]
//! async fn main() {
//!     let driver = pulsus::Driver::current();
//!     driver.delay(Duration::from_millis(50), |_, _| {
//!         println!("timer fired");
//!         Ok(())
//!     });
//!
//!     sleep(Duration::from_millis(100)).await;
//!     println!("done");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`backend`]: Readiness backends and backend selection
//! - [`io`]: Descriptor readiness futures
//! - [`time`]: Sleep and timeout
//!
//! ## Configuration
//!
//! [`Driver::new`] reads `PULSUS_DRIVER` (`epoll`, `poll` or `virtual`)
//! and `PULSUS_DRIVER_DEBUG_TRACE`. Use [`DriverBuilder`] to configure a
//! driver in code.

mod error;
mod reactor;
mod runtime;
mod utils;

pub mod io;
pub mod time;

pub use error::{Error, Origin, Result, UncaughtError};
pub use reactor::backend::{self, BackendKind};
pub use reactor::{CallbackId, CallbackType, Driver, ErrorHandler};
pub use runtime::builder::{DRIVER_ENV, DriverBuilder, TRACE_ENV};
pub use runtime::suspension::{Suspend, Suspension};
pub use runtime::task::TaskId;
pub use runtime::yield_now::yield_now;

pub use pulsus_macros::{main, test};
