use crate::runtime::context;
use crate::runtime::task::TaskId;

use std::mem;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};
use std::thread::{self, ThreadId};

/// What a task waker points at.
///
/// Only plain identifiers are stored so the waker is `Send` as the
/// `Waker` contract requires, even though tasks themselves are not.
struct TaskWaker {
    driver: u64,
    task: TaskId,
    thread: ThreadId,
}

impl TaskWaker {
    fn wake(&self) {
        if thread::current().id() != self.thread {
            log::warn!(
                "task {} woken from a foreign thread; drivers are single-threaded, wake ignored",
                self.task
            );
            return;
        }

        match context::lookup_driver(self.driver) {
            Some(driver) => driver.schedule_task(self.task),
            None => log::trace!("task {} woken after its driver was dropped", self.task),
        }
    }
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

/// Creates a [`Waker`] that schedules `task` on the driver `driver`.
pub(crate) fn make_waker(driver: u64, task: TaskId) -> Waker {
    let waker = Arc::new(TaskWaker {
        driver,
        task,
        thread: thread::current().id(),
    });

    // Safety: the pointer comes from `Arc::into_raw` and every vtable
    // function below balances the reference count.
    unsafe { Waker::from_raw(RawWaker::new(Arc::into_raw(waker) as *const (), &VTABLE)) }
}

fn clone_raw(ptr: *const ()) -> RawWaker {
    let arc = unsafe { Arc::<TaskWaker>::from_raw(ptr as *const TaskWaker) };
    let cloned = arc.clone();
    mem::forget(arc);

    RawWaker::new(Arc::into_raw(cloned) as *const (), &VTABLE)
}

fn wake_raw(ptr: *const ()) {
    let arc = unsafe { Arc::<TaskWaker>::from_raw(ptr as *const TaskWaker) };
    arc.wake();
}

fn wake_by_ref_raw(ptr: *const ()) {
    let arc = unsafe { Arc::<TaskWaker>::from_raw(ptr as *const TaskWaker) };
    arc.wake();
    mem::forget(arc);
}

fn drop_raw(ptr: *const ()) {
    drop(unsafe { Arc::<TaskWaker>::from_raw(ptr as *const TaskWaker) });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakes_from_other_threads_are_ignored() {
        let waker = make_waker(u64::MAX, TaskId::next());
        let remote = waker.clone();

        thread::spawn(move || remote.wake()).join().unwrap();
        waker.wake();
    }
}
