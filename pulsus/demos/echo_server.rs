//! Example: TCP echo server on a Pulsus driver
//!
//! Every connection is served by its own task. Tasks wait for readiness
//! with `pulsus::io`; Ctrl-C resumes the main task, which then returns.

use pulsus::Driver;

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

#[pulsus::main]
async fn main() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:9000")?;
    listener.set_nonblocking(true)?;
    println!("Echo server listening on 127.0.0.1:9000 (Ctrl-C to stop)");

    let driver = Driver::current();

    let shutdown = driver.suspension::<()>();
    let stopped = shutdown.suspend();
    driver.on_signal(libc::SIGINT, move |driver, id, _| {
        driver.cancel(id);
        shutdown.resume(())?;
        Ok(())
    })?;

    driver.spawn(accept_loop(listener));

    stopped.await?;
    println!("Shutting down");
    Ok(())
}

async fn accept_loop(listener: TcpListener) -> anyhow::Result<()> {
    loop {
        pulsus::io::readable(&listener).await?;

        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        };
        println!("Accepted connection from {addr}");

        stream.set_nonblocking(true)?;
        Driver::current().spawn(handle_client(stream));
    }
}

// Echo handler: reads data and writes it back to the client
async fn handle_client(mut stream: TcpStream) -> anyhow::Result<()> {
    let mut buf = [0u8; 1024];

    loop {
        pulsus::io::readable(&stream).await?;

        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        };

        let mut written = 0;
        while written < n {
            match stream.write(&buf[written..n]) {
                Ok(count) => written += count,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    pulsus::io::writable(&stream).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
