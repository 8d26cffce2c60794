//! Task and suspension support layered on the driver.
//!
//! This module is responsible for:
//! - tracking which driver and task are active on the current thread,
//! - polling spawned tasks from the microtask queue,
//! - suspending and resuming contexts,
//! - configuring drivers.
//!
//! Most users interact with these through [`Driver`](crate::Driver)
//! methods and the async helpers built on top of them.

pub(crate) mod builder;
pub(crate) mod context;
pub(crate) mod suspension;
pub(crate) mod task;
pub(crate) mod yield_now;
