//! Signal delivery through a self-pipe.
//!
//! The process-wide handler only writes the signal number into the pipe
//! registered for that signal, which is async-signal-safe. The backend
//! polls the read end like any other descriptor and drains it during
//! dispatch. When two drivers watch the same signal, the one that
//! activated it most recently receives it.

use super::unix::{sys_close, sys_pipe, sys_read};
use crate::reactor::CallbackId;

use libc::c_int;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

/// Highest signal number accepted by [`validate`].
pub(crate) const MAX_SIGNAL: i32 = 64;

static WAKE_FDS: [AtomicI32; MAX_SIGNAL as usize + 1] =
    [const { AtomicI32::new(-1) }; MAX_SIGNAL as usize + 1];

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__error() }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
unsafe fn errno_location() -> *mut c_int {
    ptr::null_mut()
}

extern "C" fn on_signal(signal: c_int) {
    let Some(slot) = WAKE_FDS.get(signal as usize) else {
        return;
    };

    let fd = slot.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    unsafe {
        let errno = errno_location();
        let saved = if errno.is_null() { 0 } else { *errno };

        let byte = signal as u8;
        libc::write(fd, &byte as *const u8 as *const _, 1);

        if !errno.is_null() {
            *errno = saved;
        }
    }
}

/// Checks that `signal` can be watched at all.
pub(crate) fn validate(signal: i32) -> Result<(), &'static str> {
    if signal <= 0 || signal > MAX_SIGNAL {
        return Err("not a valid signal number");
    }
    if signal == libc::SIGKILL || signal == libc::SIGSTOP {
        return Err("the signal cannot be caught");
    }

    Ok(())
}

pub(crate) struct SignalPipe {
    read: RawFd,
    write: RawFd,
    watchers: HashMap<i32, Vec<CallbackId>>,
    previous: HashMap<i32, libc::sigaction>,
}

impl SignalPipe {
    pub(crate) fn new() -> io::Result<Self> {
        let (read, write) = sys_pipe()?;

        Ok(Self {
            read,
            write,
            watchers: HashMap::new(),
            previous: HashMap::new(),
        })
    }

    /// The descriptor to poll for readability.
    pub(crate) fn fd(&self) -> RawFd {
        self.read
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Adds a watcher, installing the process handler for the first
    /// watcher of a signal.
    pub(crate) fn add(&mut self, signal: i32, id: CallbackId) -> io::Result<()> {
        validate(signal).map_err(|reason| io::Error::new(io::ErrorKind::InvalidInput, reason))?;

        if !self.watchers.contains_key(&signal) {
            let previous = self.install(signal)?;
            self.previous.insert(signal, previous);
            log::debug!("installed handler for signal {signal}");
        }

        let watchers = self.watchers.entry(signal).or_default();
        if !watchers.contains(&id) {
            watchers.push(id);
        }

        Ok(())
    }

    /// Removes a watcher, restoring the previous disposition once the
    /// last watcher of a signal is gone.
    pub(crate) fn remove(&mut self, signal: i32, id: CallbackId) {
        let Some(watchers) = self.watchers.get_mut(&signal) else {
            return;
        };

        watchers.retain(|watcher| *watcher != id);
        if !watchers.is_empty() {
            return;
        }

        self.watchers.remove(&signal);
        self.restore(signal);
    }

    /// Reads every pending signal number and appends the watchers of
    /// each received signal to `ready`, once per dispatch.
    pub(crate) fn drain(&self, ready: &mut Vec<CallbackId>) -> io::Result<()> {
        let mut received: Vec<i32> = Vec::new();
        let mut buffer = [0u8; 64];

        loop {
            match sys_read(self.read, &mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buffer[..n] {
                        let signal = byte as i32;
                        if !received.contains(&signal) {
                            received.push(signal);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        for signal in received {
            if let Some(watchers) = self.watchers.get(&signal) {
                log::trace!("signal {signal} received, {} watcher(s)", watchers.len());
                ready.extend_from_slice(watchers);
            }
        }

        Ok(())
    }

    fn install(&self, signal: i32) -> io::Result<libc::sigaction> {
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };

        let slot = &WAKE_FDS[signal as usize];
        let displaced = slot.swap(self.write, Ordering::SeqCst);

        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        let rc = unsafe { libc::sigaction(signal, &action, &mut previous) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            let _ = slot.compare_exchange(self.write, displaced, Ordering::SeqCst, Ordering::SeqCst);
            return Err(err);
        }

        Ok(previous)
    }

    fn restore(&mut self, signal: i32) {
        if let Some(previous) = self.previous.remove(&signal) {
            unsafe { libc::sigaction(signal, &previous, ptr::null_mut()) };
        }

        let _ = WAKE_FDS[signal as usize].compare_exchange(
            self.write,
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        log::debug!("restored previous handler for signal {signal}");
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let signals: Vec<i32> = self.watchers.keys().copied().collect();
        for signal in signals {
            self.restore(signal);
        }

        sys_close(self.read);
        sys_close(self.write);
    }
}
