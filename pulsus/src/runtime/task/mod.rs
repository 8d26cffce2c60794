//! Tasks spawned on a driver.
//!
//! A task wraps a future and is polled from the microtask queue whenever
//! its waker fires or one of its suspensions is resumed. Tasks never
//! migrate between threads: a waker invoked from another thread is
//! ignored with a warning.

mod core;
pub(crate) mod waker;

pub use self::core::TaskId;

pub(crate) use self::core::Task;
