//! Timer queue.
//!
//! An array-backed binary min-heap of timer entries plus an index from
//! callback id to heap slot, so any timer can be removed in `O(log n)`
//! when its callback is disabled or cancelled.

use crate::reactor::CallbackId;

use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    id: CallbackId,
    expiration: Instant,
}

impl TimerEntry {
    /// Heap ordering key. Ids break ties so timers sharing an expiration
    /// fire in registration order.
    fn key(&self) -> (Instant, CallbackId) {
        (self.expiration, self.id)
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    entries: Vec<TimerEntry>,
    pointers: HashMap<CallbackId, usize>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a timer. The id must not already be queued.
    pub(crate) fn insert(&mut self, id: CallbackId, expiration: Instant) {
        debug_assert!(!self.pointers.contains_key(&id));

        let node = self.entries.len();
        self.entries.push(TimerEntry { id, expiration });
        self.pointers.insert(id, node);

        self.heapify_up(node);
    }

    /// Removes the timer with the given id, returning whether it was queued.
    pub(crate) fn remove(&mut self, id: CallbackId) -> bool {
        match self.pointers.get(&id) {
            Some(&node) => {
                self.remove_at(node);
                true
            }
            None => false,
        }
    }

    /// Removes and returns the earliest timer if it has expired at `now`.
    ///
    /// Leaves the queue untouched when the earliest timer is still pending.
    pub(crate) fn extract(&mut self, now: Instant) -> Option<CallbackId> {
        let root = self.entries.first()?;
        if root.expiration > now {
            return None;
        }

        let id = root.id;
        self.remove_at(0);

        Some(id)
    }

    /// Expiration of the earliest timer.
    pub(crate) fn peek(&self) -> Option<Instant> {
        self.entries.first().map(|entry| entry.expiration)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn heapify_up(&mut self, mut node: usize) {
        while node > 0 {
            let parent = (node - 1) / 2;
            if self.entries[node].key() >= self.entries[parent].key() {
                break;
            }

            self.swap(node, parent);
            node = parent;
        }
    }

    fn heapify_down(&mut self, mut node: usize) {
        let len = self.entries.len();

        loop {
            let left = 2 * node + 1;
            let right = left + 1;
            let mut smallest = node;

            if left < len && self.entries[left].key() < self.entries[smallest].key() {
                smallest = left;
            }
            if right < len && self.entries[right].key() < self.entries[smallest].key() {
                smallest = right;
            }
            if smallest == node {
                break;
            }

            self.swap(node, smallest);
            node = smallest;
        }
    }

    fn swap(&mut self, left: usize, right: usize) {
        self.entries.swap(left, right);
        self.pointers.insert(self.entries[left].id, left);
        self.pointers.insert(self.entries[right].id, right);
    }

    /// Moves the last entry into `node` and restores the heap property in
    /// whichever direction the moved entry needs.
    fn remove_at(&mut self, node: usize) {
        let removed = self.entries.swap_remove(node);
        self.pointers.remove(&removed.id);

        if node >= self.entries.len() {
            return;
        }

        self.pointers.insert(self.entries[node].id, node);

        if node > 0 && self.entries[node].key() < self.entries[(node - 1) / 2].key() {
            self.heapify_up(node);
        } else {
            self.heapify_down(node);
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for (node, entry) in self.entries.iter().enumerate() {
            assert_eq!(self.pointers.get(&entry.id), Some(&node));
            if node > 0 {
                assert!(self.entries[(node - 1) / 2].key() <= entry.key());
            }
        }
        assert_eq!(self.pointers.len(), self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::TimerQueue;
    use crate::reactor::CallbackId;

    use std::time::{Duration, Instant};

    fn id(raw: u64) -> CallbackId {
        CallbackId::from_raw(raw)
    }

    #[test]
    fn extracts_in_expiration_order() {
        let base = Instant::now();
        let mut queue = TimerQueue::new();

        let delays = [50, 10, 40, 30, 70, 20, 60, 0];
        for (n, ms) in delays.iter().enumerate() {
            queue.insert(id(n as u64), base + Duration::from_millis(*ms));
            queue.assert_invariants();
        }

        let mut fired = Vec::new();
        while let Some(timer) = queue.extract(base + Duration::from_secs(1)) {
            fired.push(delays[timer.as_u64() as usize]);
            queue.assert_invariants();
        }

        assert_eq!(fired, vec![0, 10, 20, 30, 40, 50, 60, 70]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn extract_leaves_pending_timers_alone() {
        let base = Instant::now();
        let mut queue = TimerQueue::new();
        queue.insert(id(1), base + Duration::from_millis(5));

        assert_eq!(queue.extract(base), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek(), Some(base + Duration::from_millis(5)));

        assert_eq!(queue.extract(base + Duration::from_millis(5)), Some(id(1)));
        assert_eq!(queue.peek(), None);
    }

    #[test]
    fn remove_keeps_heap_consistent() {
        let base = Instant::now();
        let mut queue = TimerQueue::new();

        for n in 0..32u64 {
            let ms = (n * 37) % 101;
            queue.insert(id(n), base + Duration::from_millis(ms));
        }

        for n in [0u64, 31, 7, 15, 16, 3] {
            assert!(queue.remove(id(n)));
            queue.assert_invariants();
        }
        assert!(!queue.remove(id(7)));

        let mut last = None;
        let mut count = 0;
        while let Some(timer) = queue.extract(base + Duration::from_secs(1)) {
            assert!(![0, 31, 7, 15, 16, 3].contains(&timer.as_u64()));
            let expiration = (timer.as_u64() * 37) % 101;
            assert!(last.is_none_or(|prev| prev <= expiration));
            last = Some(expiration);
            count += 1;
        }
        assert_eq!(count, 26);
    }

    #[test]
    fn equal_expirations_fire_in_id_order() {
        let at = Instant::now();
        let mut queue = TimerQueue::new();
        for n in [3u64, 1, 2] {
            queue.insert(id(n), at);
        }

        let fired: Vec<_> = std::iter::from_fn(|| queue.extract(at))
            .map(CallbackId::as_u64)
            .collect();
        assert_eq!(fired, vec![1, 2, 3]);
    }
}
