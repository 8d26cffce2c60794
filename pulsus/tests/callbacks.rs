mod common;

use pulsus::{CallbackType, Error};

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn test_defers_run_in_registration_order() {
    let driver = common::virtual_driver();
    let log = common::log();

    for name in ["a", "b", "c"] {
        let log = log.clone();
        driver.defer(move |_, _| {
            common::push(&log, name);
            Ok(())
        });
    }

    driver.run().unwrap();
    assert_eq!(*log.borrow(), ["a", "b", "c"]);
}

#[test]
fn test_callback_registered_during_tick_runs_next_tick() {
    let driver = common::virtual_driver();
    let log = common::log();

    let outer = log.clone();
    driver.defer(move |driver, _| {
        common::push(&outer, "first");
        let inner = outer.clone();
        driver.defer(move |_, _| {
            common::push(&inner, "nested");
            Ok(())
        });
        Ok(())
    });

    let second = log.clone();
    driver.defer(move |_, _| {
        common::push(&second, "second");
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(*log.borrow(), ["first", "second", "nested"]);
}

#[test]
fn test_reenabled_callback_waits_for_next_tick() {
    let driver = common::virtual_driver();
    let log = common::log();

    let target_log = log.clone();
    let target = driver.defer(move |_, _| {
        common::push(&target_log, "target");
        Ok(())
    });
    driver.disable(target);

    let enabler_log = log.clone();
    driver.defer(move |driver, _| {
        driver.enable(target)?;
        common::push(&enabler_log, "enabled");
        Ok(())
    });

    let peer_log = log.clone();
    driver.defer(move |_, _| {
        common::push(&peer_log, "peer");
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(*log.borrow(), ["enabled", "peer", "target"]);
}

#[test]
fn test_microtasks_run_before_next_callback() {
    let driver = common::virtual_driver();
    let log = common::log();

    let first = log.clone();
    driver.defer(move |driver, _| {
        let queued = first.clone();
        driver.queue(move |_| {
            common::push(&queued, "microtask");
            Ok(())
        });
        common::push(&first, "first");
        Ok(())
    });

    let second = log.clone();
    driver.defer(move |_, _| {
        common::push(&second, "second");
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(*log.borrow(), ["first", "microtask", "second"]);
}

#[test]
fn test_unreferenced_callback_does_not_keep_loop_alive() {
    let driver = common::virtual_driver();
    let fired = Rc::new(Cell::new(0));

    let counter = fired.clone();
    let id = driver.repeat(Duration::from_secs(1), move |_, _| {
        counter.set(counter.get() + 1);
        Ok(())
    });
    driver.unreference(id).unwrap();

    driver.run().unwrap();
    assert_eq!(fired.get(), 0);
    assert!(driver.is_enabled(id).unwrap());
    assert!(!driver.is_referenced(id).unwrap());

    driver.reference(id).unwrap();
    assert!(driver.is_referenced(id).unwrap());
}

#[test]
fn test_disabled_callback_never_runs() {
    let driver = common::virtual_driver();
    let fired = Rc::new(Cell::new(false));

    let flag = fired.clone();
    let id = driver.delay(Duration::from_millis(5), move |_, _| {
        flag.set(true);
        Ok(())
    });
    driver.disable(id);

    driver.run().unwrap();
    assert!(!fired.get());
    assert!(!driver.is_enabled(id).unwrap());
}

#[test]
fn test_stop_exits_at_tick_boundary() {
    let driver = common::virtual_driver();
    let fired = Rc::new(Cell::new(0));

    let counter = fired.clone();
    driver.repeat(Duration::from_millis(1), move |driver, _| {
        counter.set(counter.get() + 1);
        if counter.get() == 3 {
            driver.stop();
        }
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(fired.get(), 3);
    assert!(!driver.is_running());

    // The repeat is still enabled, so running again resumes it.
    let counter = fired.clone();
    driver.delay(Duration::from_millis(2), move |driver, _| {
        assert!(counter.get() > 3);
        driver.stop();
        Ok(())
    });
    driver.run().unwrap();
}

#[test]
fn test_run_inside_callback_is_rejected() {
    let driver = common::virtual_driver();
    let nested = Rc::new(Cell::new(None));

    let slot = nested.clone();
    driver.defer(move |driver, _| {
        assert!(driver.is_running());
        slot.set(Some(matches!(driver.run(), Err(Error::AlreadyRunning))));
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(nested.get(), Some(true));
}

#[test]
fn test_unknown_ids_are_rejected() {
    let driver = common::virtual_driver();
    let id = driver.defer(|_, _| Ok(()));
    driver.cancel(id);
    driver.cancel(id);

    assert!(matches!(driver.enable(id), Err(Error::InvalidCallback { .. })));
    assert!(matches!(driver.reference(id), Err(Error::InvalidCallback { .. })));
    assert!(matches!(driver.unreference(id), Err(Error::InvalidCallback { .. })));
    assert!(matches!(driver.is_enabled(id), Err(Error::InvalidCallback { .. })));
    assert!(matches!(driver.callback_type(id), Err(Error::InvalidCallback { .. })));
    assert_eq!(driver.disable(id), id);
}

#[test]
fn test_callback_types_are_reported() {
    let driver = common::virtual_driver();

    let defer = driver.defer(|_, _| Ok(()));
    let delay = driver.delay(Duration::from_secs(1), |_, _| Ok(()));
    let repeat = driver.repeat(Duration::from_secs(1), |_, _| Ok(()));

    assert_eq!(driver.callback_type(defer).unwrap(), CallbackType::Defer);
    assert_eq!(driver.callback_type(delay).unwrap(), CallbackType::Delay);
    assert_eq!(driver.callback_type(repeat).unwrap(), CallbackType::Repeat);
    assert_eq!(driver.identifiers(), [defer, delay, repeat]);
    assert!(defer < delay && delay < repeat);
}
