//! Portable `poll(2)` backend.
//!
//! The pollfd set is rebuilt on every dispatch from the handle table, so
//! activation and deactivation are pure bookkeeping. An exceptional
//! condition on a descriptor is reported to its writable callbacks, which
//! is how failed non-blocking connects surface on some platforms.

use super::common::{Direction, HandleTable, Interest, timeout_ms};
use super::signal::SignalPipe;
use super::{Backend, Watch, Watcher};
use crate::reactor::CallbackId;

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI, nfds_t, pollfd};
use std::io;
use std::thread;
use std::time::{Duration, Instant};

const READABLE: i16 = POLLIN | POLLHUP | POLLERR | POLLNVAL;
const WRITABLE: i16 = POLLOUT | POLLHUP | POLLERR | POLLPRI | POLLNVAL;

/// Sentinel token for the signal pipe in `tokens`.
const SIGNAL_TOKEN: usize = usize::MAX;

/// `poll(2)` event flags for `interest`. Write interest also asks for
/// `POLLPRI` so exceptional conditions reach writable callbacks.
fn requested_events(interest: Interest) -> i16 {
    let mut events = 0;

    if interest.read {
        events |= POLLIN;
    }
    if interest.write {
        events |= POLLOUT | POLLPRI;
    }

    events
}

pub struct PollBackend {
    handles: HandleTable,
    signals: Option<SignalPipe>,
    /// Reusable pollfd buffer and the handle token of each entry.
    pollfds: Vec<pollfd>,
    tokens: Vec<usize>,
}

impl PollBackend {
    pub fn new() -> Self {
        Self {
            handles: HandleTable::new(),
            signals: None,
            pollfds: Vec::with_capacity(64),
            tokens: Vec::with_capacity(64),
        }
    }

    fn rebuild(&mut self) {
        self.pollfds.clear();
        self.tokens.clear();

        if let Some(signals) = &self.signals {
            self.pollfds.push(pollfd {
                fd: signals.fd(),
                events: POLLIN,
                revents: 0,
            });
            self.tokens.push(SIGNAL_TOKEN);
        }

        for (token, entry) in self.handles.iter() {
            self.pollfds.push(pollfd {
                fd: entry.fd,
                events: requested_events(entry.interest()),
                revents: 0,
            });
            self.tokens.push(token);
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

            let n = unsafe {
                libc::poll(
                    self.pollfds.as_mut_ptr(),
                    self.pollfds.len() as nfds_t,
                    timeout_ms(remaining),
                )
            };

            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Default for PollBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn activate(&mut self, watchers: &[Watcher]) -> io::Result<()> {
        for watcher in watchers {
            match watcher.watch {
                Watch::Readable(fd) => {
                    self.handles.insert(fd, Direction::Read, watcher.id);
                }
                Watch::Writable(fd) => {
                    self.handles.insert(fd, Direction::Write, watcher.id);
                }
                Watch::Signal(signal) => {
                    if self.signals.is_none() {
                        self.signals = Some(SignalPipe::new()?);
                    }
                    if let Some(signals) = self.signals.as_mut() {
                        signals.add(signal, watcher.id)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn deactivate(&mut self, watcher: &Watcher) {
        match watcher.watch {
            Watch::Readable(fd) => {
                self.handles.remove(fd, Direction::Read, watcher.id);
            }
            Watch::Writable(fd) => {
                self.handles.remove(fd, Direction::Write, watcher.id);
            }
            Watch::Signal(signal) => {
                if let Some(signals) = &mut self.signals {
                    signals.remove(signal, watcher.id);
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<CallbackId>,
    ) -> io::Result<()> {
        self.rebuild();

        if self.pollfds.is_empty() {
            if let Some(timeout) = timeout.filter(|timeout| !timeout.is_zero()) {
                thread::sleep(timeout);
            }
            return Ok(());
        }

        if self.wait(timeout)? == 0 {
            return Ok(());
        }

        for (pollfd, &token) in self.pollfds.iter().zip(&self.tokens) {
            if token == SIGNAL_TOKEN && pollfd.revents & POLLIN != 0 {
                if let Some(signals) = &self.signals {
                    signals.drain(ready)?;
                }
            }
        }

        for (pollfd, &token) in self.pollfds.iter().zip(&self.tokens) {
            if token == SIGNAL_TOKEN || pollfd.revents & READABLE == 0 {
                continue;
            }
            if let Some(entry) = self.handles.get(token) {
                ready.extend_from_slice(&entry.readers);
            }
        }

        for (pollfd, &token) in self.pollfds.iter().zip(&self.tokens) {
            if token == SIGNAL_TOKEN || pollfd.revents & WRITABLE == 0 {
                continue;
            }
            if let Some(entry) = self.handles.get(token) {
                ready.extend_from_slice(&entry.writers);
            }
        }

        Ok(())
    }

    fn supports_signals(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_interest_requests_priority_events() {
        let events = requested_events(Interest {
            read: true,
            write: true,
        });
        assert_eq!(events, POLLIN | POLLOUT | POLLPRI);

        let read_only = requested_events(Interest {
            read: true,
            write: false,
        });
        assert_eq!(read_only & POLLPRI, 0);
    }
}
