//! The event loop driver.
//!
//! This module owns callback registration and the tick state machine.
//! Readiness of descriptors and signals is delegated to a [`backend`];
//! timers are ordered by the driver itself so every backend shares the
//! same expiration semantics.

mod callback;
mod core;
mod driver;
mod timer;
mod trace;

pub mod backend;

pub use self::core::ErrorHandler;
pub use callback::{CallbackId, CallbackType};
pub use driver::Driver;

pub(crate) use self::core::{Exit, Inner, Interrupt};
pub(crate) use driver::WeakDriver;
