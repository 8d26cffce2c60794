//! Linux `epoll`-based backend.
//!
//! Descriptors are registered level-triggered. `epoll` keys its interest
//! set on the descriptor rather than on callbacks, so every activation or
//! deactivation goes through the handle table and the descriptor's flags
//! are re-derived from all callbacks sharing it.
//!
//! The signal self-pipe is registered under a reserved token and drained
//! before I/O readiness is reported.

use super::common::{Direction, HandleTable, Interest, Registration, timeout_ms};
use super::signal::SignalPipe;
use super::{Backend, Watch, Watcher};
use crate::reactor::CallbackId;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLPRI, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::{Duration, Instant};

/// Reserved token for the signal pipe.
///
/// This value must never collide with tokens produced by the slab.
/// Using `u64::MAX` guarantees uniqueness.
const SIGNAL_TOKEN: u64 = u64::MAX;

const READABLE: u32 = (EPOLLIN | EPOLLERR | EPOLLHUP) as u32;
const WRITABLE: u32 = (EPOLLOUT | EPOLLERR | EPOLLHUP | EPOLLPRI) as u32;

/// Linux `epoll` backend.
///
/// This backend owns:
/// - an `epoll` instance,
/// - the table of watched descriptors,
/// - a lazily created signal pipe,
/// - a reusable event buffer.
pub struct EpollBackend {
    /// Epoll file descriptor.
    epoll: RawFd,

    handles: HandleTable,

    signals: Option<SignalPipe>,

    /// Reusable buffer for epoll events.
    events: Vec<epoll_event>,
}

/// Kernel event flags for `interest`. Write interest also asks for
/// `EPOLLPRI`, which is reported to writable callbacks.
fn requested_events(interest: Interest) -> u32 {
    let mut flags = 0;

    if interest.read {
        flags |= EPOLLIN;
    }
    if interest.write {
        flags |= EPOLLOUT | EPOLLPRI;
    }

    flags as u32
}

impl EpollBackend {
    /// Creates the epoll instance.
    pub fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll,
            handles: HandleTable::new(),
            signals: None,
            events: Vec::with_capacity(64),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: requested_events(interest),
            u64: token,
        };

        let event_ptr = if op == EPOLL_CTL_DEL {
            ptr::null_mut()
        } else {
            &mut event as *mut epoll_event
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, event_ptr) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Brings the kernel interest set in line with a handle table update.
    fn apply(&self, registration: Registration) -> io::Result<()> {
        let Registration {
            token,
            fd,
            before,
            after,
        } = registration;
        let token = token as u64;

        if before == after {
            return Ok(());
        }

        if after.is_empty() {
            return match self.ctl(EPOLL_CTL_DEL, fd, token, after) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => Ok(()),
                other => other,
            };
        }

        if before.is_empty() {
            return match self.ctl(EPOLL_CTL_ADD, fd, token, after) {
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    self.ctl(EPOLL_CTL_MOD, fd, token, after)
                }
                other => other,
            };
        }

        match self.ctl(EPOLL_CTL_MOD, fd, token, after) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(EPOLL_CTL_ADD, fd, token, after)
            }
            other => other,
        }
    }

    fn signals(&mut self) -> io::Result<&mut SignalPipe> {
        if self.signals.is_none() {
            let signals = SignalPipe::new()?;
            let read = Interest {
                read: true,
                write: false,
            };
            self.ctl(EPOLL_CTL_ADD, signals.fd(), SIGNAL_TOKEN, read)?;
            self.signals = Some(signals);
        }

        self.signals
            .as_mut()
            .ok_or_else(|| io::Error::other("signal pipe unavailable"))
    }

    /// Waits for events, retrying with the remaining time when a signal
    /// interrupts the call.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

            let n = unsafe {
                epoll_wait(
                    self.epoll,
                    self.events.as_mut_ptr(),
                    self.events.capacity() as i32,
                    timeout_ms(remaining),
                )
            };

            if n >= 0 {
                unsafe {
                    self.events.set_len(n as usize);
                }
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn activate(&mut self, watchers: &[Watcher]) -> io::Result<()> {
        for watcher in watchers {
            match watcher.watch {
                Watch::Readable(fd) => {
                    let registration = self.handles.insert(fd, Direction::Read, watcher.id);
                    self.apply(registration)?;
                }
                Watch::Writable(fd) => {
                    let registration = self.handles.insert(fd, Direction::Write, watcher.id);
                    self.apply(registration)?;
                }
                Watch::Signal(signal) => {
                    self.signals()?.add(signal, watcher.id)?;
                }
            }
        }

        Ok(())
    }

    fn deactivate(&mut self, watcher: &Watcher) {
        let registration = match watcher.watch {
            Watch::Readable(fd) => self.handles.remove(fd, Direction::Read, watcher.id),
            Watch::Writable(fd) => self.handles.remove(fd, Direction::Write, watcher.id),
            Watch::Signal(signal) => {
                if let Some(signals) = &mut self.signals {
                    signals.remove(signal, watcher.id);
                }
                None
            }
        };

        if let Some(registration) = registration {
            if let Err(e) = self.apply(registration) {
                log::warn!(
                    "failed to update epoll interest for fd {}: {e}",
                    registration.fd
                );
            }
        }
    }

    fn dispatch(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<CallbackId>,
    ) -> io::Result<()> {
        self.events.clear();
        self.events.reserve(self.handles.len() + 1);

        let n = self.wait(timeout)?;

        let mut readable = Vec::new();
        let mut writable = Vec::new();

        for event in &self.events[..n] {
            let token = event.u64;
            let flags = event.events;

            if token == SIGNAL_TOKEN {
                if let Some(signals) = &self.signals {
                    signals.drain(ready)?;
                }
                continue;
            }

            if flags & READABLE != 0 {
                readable.push(token as usize);
            }
            if flags & WRITABLE != 0 {
                writable.push(token as usize);
            }
        }

        for token in readable {
            if let Some(entry) = self.handles.get(token) {
                ready.extend_from_slice(&entry.readers);
            }
        }

        for token in writable {
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

impl Drop for EpollBackend {
    fn drop(&mut self) {
        self.signals = None;
        super::unix::sys_close(self.epoll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceptional_conditions_are_requested_with_write_interest() {
        let write = requested_events(Interest {
            read: false,
            write: true,
        });
        assert_ne!(write & EPOLLPRI as u32, 0);
        assert_ne!(write & WRITABLE, 0);

        let read = requested_events(Interest {
            read: true,
            write: false,
        });
        assert_eq!(read & EPOLLPRI as u32, 0);
        assert_eq!(read & EPOLLOUT as u32, 0);
    }
}
