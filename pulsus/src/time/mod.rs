//! Timer-based async utilities.
//!
//! This module provides futures driven by the driver's delay callbacks:
//! - [`sleep`] for suspending a task,
//! - [`timeout`] for bounding how long a future may take.

mod sleep;
mod timeout;

#[doc(inline)]
pub use sleep::{Sleep, sleep};

#[doc(inline)]
pub use timeout::{Elapsed, Timeout, timeout};
