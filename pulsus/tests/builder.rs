mod common;

use pulsus::backend::VirtualBackend;
use pulsus::{BackendKind, Driver, DriverBuilder, Error};

#[test]
fn test_explicit_backend_is_used() {
    common::init_logging();

    let driver = DriverBuilder::new().backend(BackendKind::Poll).build().unwrap();
    assert_eq!(driver.backend_name(), "poll");

    let driver = DriverBuilder::new()
        .with_backend(Box::new(VirtualBackend::new()))
        .build()
        .unwrap();
    assert_eq!(driver.backend_name(), "virtual");
}

#[test]
fn test_default_driver_uses_a_native_backend() {
    common::init_logging();

    if std::env::var_os(pulsus::DRIVER_ENV).is_some() {
        return;
    }

    let driver = Driver::new().unwrap();
    assert_eq!(driver.backend_name(), BackendKind::best_available().name());
    assert!(BackendKind::best_available().is_supported());
}

#[test]
fn test_backend_names_parse() {
    assert_eq!("epoll".parse::<BackendKind>().unwrap(), BackendKind::Epoll);
    assert_eq!(" Poll ".parse::<BackendKind>().unwrap(), BackendKind::Poll);
    assert!(matches!(
        "select".parse::<BackendKind>(),
        Err(Error::UnknownBackend(_))
    ));
}

#[test]
fn test_tracing_explains_invalid_identifiers() {
    let driver = DriverBuilder::new()
        .backend(BackendKind::Virtual)
        .tracing(true)
        .build()
        .unwrap();

    let id = driver.defer(|_, _| Ok(()));
    driver.run().unwrap();

    let message = driver.enable(id).unwrap_err().to_string();
    assert!(message.contains("created at"), "{message}");
    assert!(message.contains("builder.rs"), "{message}");

    let untraced = DriverBuilder::new()
        .backend(BackendKind::Virtual)
        .build()
        .unwrap();
    let id = untraced.defer(|_, _| Ok(()));
    untraced.cancel(id);
    assert!(!untraced.enable(id).unwrap_err().to_string().contains("created at"));
}

#[test]
fn test_dump_lists_live_callbacks() {
    let driver = common::virtual_driver();
    let id = driver.delay(std::time::Duration::from_secs(1), |_, _| Ok(()));

    let dump = driver.dump();
    assert!(dump.contains(&format!("delay callback {id}")), "{dump}");
    assert!(dump.contains("virtual backend"), "{dump}");
}
