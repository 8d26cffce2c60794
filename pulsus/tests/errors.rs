mod common;

use pulsus::{CallbackType, Error, Origin};

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn test_uncaught_callback_error_stops_the_loop() {
    let driver = common::virtual_driver();
    let id = driver.defer(|_, _| anyhow::bail!("boom"));

    let later = driver.delay(Duration::from_secs(1), |_, _| {
        panic!("must not run after an uncaught error");
    });

    match driver.run() {
        Err(Error::Uncaught(uncaught)) => {
            assert_eq!(
                uncaught.origin(),
                Origin::Callback {
                    id,
                    kind: CallbackType::Defer
                }
            );
            assert_eq!(uncaught.error().to_string(), "boom");
        }
        other => panic!("expected an uncaught error, got {other:?}"),
    }

    assert!(driver.is_enabled(later).unwrap());
    assert!(!driver.is_running());
}

#[test]
fn test_error_handler_receives_errors_and_loop_continues() {
    let driver = common::virtual_driver();
    let handled = Rc::new(RefCell::new(Vec::new()));

    let sink = handled.clone();
    driver.set_error_handler(move |_, error| {
        sink.borrow_mut().push(error.to_string());
        Ok(())
    });
    assert!(driver.has_error_handler());

    driver.defer(|_, _| anyhow::bail!("first"));
    driver.delay(Duration::from_millis(5), |_, _| panic!("second"));
    driver.queue(|_| anyhow::bail!("third"));

    driver.run().unwrap();
    assert_eq!(*handled.borrow(), ["third", "first", "panicked: second"]);

    driver.clear_error_handler();
    assert!(!driver.has_error_handler());
}

#[test]
fn test_failing_error_handler_is_reported() {
    let driver = common::virtual_driver();
    driver.set_error_handler(|_, error| Err(error.context("handler gave up")));
    driver.defer(|_, _| anyhow::bail!("original"));

    match driver.run() {
        Err(Error::Uncaught(uncaught)) => {
            assert_eq!(uncaught.origin(), Origin::ErrorHandler);
            assert_eq!(uncaught.error().to_string(), "handler gave up");
        }
        other => panic!("expected an uncaught error, got {other:?}"),
    }
}

#[test]
fn test_task_errors_are_routed_with_task_origin() {
    let driver = common::virtual_driver();
    let task = driver.spawn(async { Err::<(), _>(anyhow::anyhow!("task failed")) });

    match driver.run() {
        Err(Error::Uncaught(uncaught)) => {
            assert_eq!(uncaught.origin(), Origin::Task(task));
            assert!(uncaught.to_string().contains("task failed"));
        }
        other => panic!("expected an uncaught error, got {other:?}"),
    }
}

#[test]
fn test_loop_can_run_again_after_an_uncaught_error() {
    let driver = common::virtual_driver();
    driver.defer(|_, _| anyhow::bail!("once"));
    assert!(driver.run().is_err());

    let log = common::log();
    let entry = log.clone();
    driver.defer(move |_, _| {
        common::push(&entry, "recovered");
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(*log.borrow(), ["recovered"]);
}
