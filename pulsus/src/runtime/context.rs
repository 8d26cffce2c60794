use crate::reactor::Driver;
use crate::reactor::Inner;
use crate::runtime::task::TaskId;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

thread_local! {
    /// The driver whose loop is running on this thread.
    ///
    /// Set for the duration of a run and restored afterwards, so nested
    /// loops of different drivers see their own driver.
    static CURRENT_DRIVER: RefCell<Option<Weak<Inner>>> = const { RefCell::new(None) };

    /// The task currently being polled, if any.
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };

    /// Every live driver created on this thread, keyed by id.
    ///
    /// Wakers only carry the driver id so they stay `Send`; they resolve
    /// it here when woken on the owning thread.
    static DRIVERS: RefCell<HashMap<u64, Weak<Inner>>> = RefCell::new(HashMap::new());
}

/// Enters the context of `driver` for the duration of `f`.
///
/// The previous context is restored afterwards.
pub(crate) fn enter_driver<R>(driver: &Driver, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_DRIVER.with(|cell| cell.replace(Some(Rc::downgrade(&driver.inner))));

    let out = f();

    CURRENT_DRIVER.with(|cell| cell.replace(previous));
    out
}

/// Marks `id` as the task being polled for the duration of `f`.
pub(crate) fn enter_task<R>(id: TaskId, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_TASK.with(|cell| cell.replace(Some(id)));

    let out = f();

    CURRENT_TASK.with(|cell| cell.set(previous));
    out
}

pub(crate) fn current_driver() -> Option<Driver> {
    CURRENT_DRIVER
        .with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
        .map(|inner| Driver { inner })
}

pub(crate) fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(Cell::get)
}

pub(crate) fn register_driver(inner: &Rc<Inner>) {
    DRIVERS.with(|drivers| {
        drivers.borrow_mut().insert(inner.id, Rc::downgrade(inner));
    });
}

pub(crate) fn unregister_driver(id: u64) {
    // The registry may already be gone while thread-locals are torn down.
    let _ = DRIVERS.try_with(|drivers| {
        if let Ok(mut drivers) = drivers.try_borrow_mut() {
            drivers.remove(&id);
        }
    });
}

pub(crate) fn lookup_driver(id: u64) -> Option<Driver> {
    DRIVERS
        .with(|drivers| drivers.borrow().get(&id).and_then(Weak::upgrade))
        .map(|inner| Driver { inner })
}
