use crate::reactor::CallbackId;
use crate::utils::Slab;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Every callback watching one file descriptor.
pub(crate) struct HandleEntry {
    pub(crate) fd: RawFd,
    pub(crate) readers: Vec<CallbackId>,
    pub(crate) writers: Vec<CallbackId>,
}

impl HandleEntry {
    /// Interest derived from all callbacks sharing the descriptor.
    pub(crate) fn interest(&self) -> Interest {
        Interest {
            read: !self.readers.is_empty(),
            write: !self.writers.is_empty(),
        }
    }
}

/// Result of a handle table update, describing how the OS-level
/// interest of the descriptor changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Registration {
    pub(crate) token: usize,
    pub(crate) fd: RawFd,
    pub(crate) before: Interest,
    pub(crate) after: Interest,
}

/// Watched descriptors, keyed by a stable slab token and looked up by
/// descriptor value.
pub(crate) struct HandleTable {
    entries: Slab<HandleEntry>,
    by_fd: HashMap<RawFd, usize>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Slab::new(64),
            by_fd: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, fd: RawFd, direction: Direction, id: CallbackId) -> Registration {
        let token = match self.by_fd.get(&fd) {
            Some(&token) => token,
            None => {
                let token = self.entries.insert(HandleEntry {
                    fd,
                    readers: Vec::new(),
                    writers: Vec::new(),
                });
                self.by_fd.insert(fd, token);
                token
            }
        };

        let mut before = Interest::default();
        let mut after = Interest::default();

        if let Some(entry) = self.entries.get_mut(token) {
            before = entry.interest();
            let list = match direction {
                Direction::Read => &mut entry.readers,
                Direction::Write => &mut entry.writers,
            };
            if !list.contains(&id) {
                list.push(id);
            }
            after = entry.interest();
        }

        Registration {
            token,
            fd,
            before,
            after,
        }
    }

    /// Removes a callback. The descriptor's entry is dropped together
    /// with its last callback.
    pub(crate) fn remove(
        &mut self,
        fd: RawFd,
        direction: Direction,
        id: CallbackId,
    ) -> Option<Registration> {
        let token = *self.by_fd.get(&fd)?;
        let entry = self.entries.get_mut(token)?;

        let before = entry.interest();
        let list = match direction {
            Direction::Read => &mut entry.readers,
            Direction::Write => &mut entry.writers,
        };
        let position = list.iter().position(|watcher| *watcher == id)?;
        list.remove(position);
        let after = entry.interest();

        if after.is_empty() {
            self.entries.remove(token);
            self.by_fd.remove(&fd);
        }

        Some(Registration {
            token,
            fd,
            before,
            after,
        })
    }

    pub(crate) fn get(&self, token: usize) -> Option<&HandleEntry> {
        self.entries.get(token)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &HandleEntry)> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Converts a wait bound to the millisecond timeout taken by `poll(2)`
/// and `epoll_wait(2)`, rounding up so a pending timer is never polled
/// before it expires.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => {
            let ms = timeout.as_nanos().div_ceil(1_000_000);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> CallbackId {
        CallbackId::from_raw(raw)
    }

    #[test]
    fn interest_follows_every_callback_on_a_descriptor() {
        let mut table = HandleTable::new();

        let first = table.insert(5, Direction::Read, id(1));
        assert!(first.before.is_empty());
        assert_eq!(first.after, Interest { read: true, write: false });

        let second = table.insert(5, Direction::Write, id(2));
        assert_eq!(second.token, first.token);
        assert_eq!(second.after, Interest { read: true, write: true });

        let third = table.insert(5, Direction::Read, id(3));
        assert_eq!(third.before, third.after);

        let removed = table.remove(5, Direction::Read, id(1)).unwrap();
        assert_eq!(removed.after, Interest { read: true, write: true });

        let removed = table.remove(5, Direction::Read, id(3)).unwrap();
        assert_eq!(removed.after, Interest { read: false, write: true });

        let removed = table.remove(5, Direction::Write, id(2)).unwrap();
        assert!(removed.after.is_empty());
        assert_eq!(table.len(), 0);
        assert!(table.remove(5, Direction::Write, id(2)).is_none());
    }

    #[test]
    fn descriptors_get_distinct_tokens() {
        let mut table = HandleTable::new();
        let a = table.insert(3, Direction::Read, id(1));
        let b = table.insert(4, Direction::Read, id(2));

        assert_ne!(a.token, b.token);
        assert_eq!(table.get(b.token).map(|entry| entry.fd), Some(4));
    }

    #[test]
    fn timeouts_round_up_to_whole_milliseconds() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(20))), 20);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }
}
