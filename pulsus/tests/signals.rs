mod common;

use pulsus::{BackendKind, Error};

use std::cell::Cell;
use std::rc::Rc;

fn deliver(kind: BackendKind, signal: i32) {
    let driver = common::driver(kind);
    let seen = Rc::new(Cell::new(0));

    let counter = seen.clone();
    driver
        .on_signal(signal, move |driver, id, received| {
            assert_eq!(received, signal);
            counter.set(counter.get() + 1);
            driver.cancel(id);
            Ok(())
        })
        .unwrap();

    driver.defer(move |_, _| {
        // Raised twice within one tick: deliveries are coalesced.
        unsafe {
            libc::raise(signal);
            libc::raise(signal);
        }
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(seen.get(), 1, "{kind} backend");
}

#[test]
fn test_signal_is_delivered_with_poll() {
    deliver(BackendKind::Poll, libc::SIGUSR1);
}

#[cfg(target_os = "linux")]
#[test]
fn test_signal_is_delivered_with_epoll() {
    deliver(BackendKind::Epoll, libc::SIGUSR2);
}

#[test]
fn test_uncatchable_signals_are_rejected() {
    let driver = common::driver(BackendKind::Poll);

    for signal in [libc::SIGKILL, libc::SIGSTOP, 0, 1000] {
        let result = driver.on_signal(signal, |_, _, _| Ok(()));
        assert!(
            matches!(result, Err(Error::UnsupportedSignal { .. })),
            "signal {signal} should be rejected"
        );
    }
    assert!(driver.identifiers().is_empty());
}

#[test]
fn test_virtual_backend_cannot_watch_signals() {
    let driver = common::virtual_driver();

    let result = driver.on_signal(libc::SIGUSR1, |_, _, _| Ok(()));
    assert!(matches!(result, Err(Error::UnsupportedSignal { .. })));
}
