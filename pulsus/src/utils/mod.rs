//! Small data structures shared by the reactor.
//!
//! The [`Slab`] gives backends an arena of stable integer tokens for
//! the handles they watch.

mod slab;

pub(crate) use slab::Slab;
