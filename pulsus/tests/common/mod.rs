#![allow(dead_code)]

use pulsus::{BackendKind, Driver, DriverBuilder};

use std::cell::RefCell;
use std::rc::Rc;

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

/// A traced driver on the virtual clock.
pub fn virtual_driver() -> Driver {
    driver(BackendKind::Virtual)
}

pub fn driver(kind: BackendKind) -> Driver {
    init_logging();
    DriverBuilder::new()
        .backend(kind)
        .tracing(true)
        .build()
        .expect("failed to build driver")
}

/// Backends able to watch descriptors on this platform.
pub fn io_backends() -> Vec<BackendKind> {
    if cfg!(target_os = "linux") {
        vec![BackendKind::Epoll, BackendKind::Poll]
    } else {
        vec![BackendKind::Poll]
    }
}

pub type Log = Rc<RefCell<Vec<String>>>;

pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn push(log: &Log, entry: impl Into<String>) {
    log.borrow_mut().push(entry.into());
}
