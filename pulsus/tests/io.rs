mod common;

use pulsus::{BackendKind, CallbackId, Driver};

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

fn for_each_backend(test: fn(BackendKind)) {
    for kind in common::io_backends() {
        test(kind);
    }
}

#[test]
fn test_readable_fires_once_per_readiness_and_on_eof() {
    for_each_backend(|kind| {
        let driver = common::driver(kind);
        let (mut reader, mut writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        writer.write_all(b"abc").unwrap();

        let reads = Rc::new(RefCell::new(Vec::new()));
        let writer = Rc::new(RefCell::new(Some(writer)));

        let fd = reader.as_raw_fd();
        let log = reads.clone();
        driver.on_readable(&fd, move |driver, id, _| {
            let mut buf = [0u8; 16];
            let n = reader.read(&mut buf)?;
            log.borrow_mut().push(n);

            if n == 0 {
                driver.cancel(id);
            } else {
                let writer = writer.clone();
                driver.defer(move |_, _| {
                    writer.borrow_mut().take();
                    Ok(())
                });
            }
            Ok(())
        });

        driver.run().unwrap();
        assert_eq!(*reads.borrow(), [3, 0], "{kind} backend");
    });
}

#[test]
fn test_cancelling_a_queued_watcher_prevents_it_from_running() {
    for_each_backend(|kind| {
        let driver = common::driver(kind);
        let (reader, mut writer) = UnixStream::pair().unwrap();
        writer.write_all(b"x").unwrap();

        let victim: Rc<Cell<Option<CallbackId>>> = Rc::default();
        let victim_ran = Rc::new(Cell::new(false));

        let target = victim.clone();
        driver.on_readable(&reader, move |driver, id, _| {
            if let Some(victim) = target.take() {
                driver.cancel(victim);
            }
            driver.cancel(id);
            Ok(())
        });

        let flag = victim_ran.clone();
        let id = driver.on_readable(&reader, move |driver, id, _| {
            flag.set(true);
            driver.cancel(id);
            Ok(())
        });
        victim.set(Some(id));

        driver.run().unwrap();
        assert!(!victim_ran.get(), "{kind} backend");
    });
}

#[test]
fn test_reader_and_writer_share_a_descriptor() {
    for_each_backend(|kind| {
        let driver = common::driver(kind);
        let (mut local, peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();

        let writes = Rc::new(Cell::new(0));
        let received = Rc::new(RefCell::new(Vec::new()));

        let counter = writes.clone();
        driver.on_writable(&local, move |driver, id, _| {
            counter.set(counter.get() + 1);
            driver.cancel(id);
            Ok(())
        });

        let fd = local.as_raw_fd();
        let buffer = received.clone();
        driver.on_readable(&fd, move |driver, id, _| {
            let mut buf = [0u8; 8];
            let n = local.read(&mut buf)?;
            buffer.borrow_mut().extend_from_slice(&buf[..n]);
            driver.cancel(id);
            Ok(())
        });

        let mut peer = Some(peer);
        driver.delay(Duration::from_millis(5), move |_, _| {
            if let Some(mut peer) = peer.take() {
                peer.write_all(b"ping")?;
            }
            Ok(())
        });

        driver.run().unwrap();
        assert_eq!(writes.get(), 1, "{kind} backend");
        assert_eq!(*received.borrow(), b"ping", "{kind} backend");
    });
}

#[test]
fn test_readable_future_resumes_task() {
    for_each_backend(|kind| {
        let driver = common::driver(kind);
        let (reader, mut writer) = UnixStream::pair().unwrap();

        let received = driver
            .block_on(async move {
                Driver::current().delay(Duration::from_millis(5), move |_, _| {
                    writer.write_all(b"pong")?;
                    Ok(())
                });

                pulsus::io::readable(&reader).await?;
                let mut buf = [0u8; 4];
                (&reader).read_exact(&mut buf)?;
                Ok::<_, anyhow::Error>(buf)
            })
            .unwrap()
            .unwrap();

        assert_eq!(&received, b"pong", "{kind} backend");
        assert!(driver.identifiers().is_empty(), "{kind} backend");
    });
}

#[test]
fn test_writable_future_completes_for_connected_socket() {
    for_each_backend(|kind| {
        let driver = common::driver(kind);
        let (local, _peer) = UnixStream::pair().unwrap();

        let result = driver.block_on(async move { pulsus::io::writable(&local).await });

        assert!(result.unwrap().is_ok(), "{kind} backend");
    });
}

#[test]
fn test_virtual_backend_rejects_descriptors() {
    let driver = common::virtual_driver();
    let (reader, _writer) = UnixStream::pair().unwrap();

    driver.on_readable(&reader, |_, _, _| Ok(()));

    assert!(matches!(driver.run(), Err(pulsus::Error::Backend(_))));
}
