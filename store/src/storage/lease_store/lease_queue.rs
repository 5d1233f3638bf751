use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Instant,
};

/// A min-heap of lease ids ordered by expiry, used by the expiry ticker
/// (§4.3) to find leases whose `granted_at + ttl < now` without scanning
/// every lease on every tick.
///
/// Lease renewal moves an id to a new expiry arbitrarily often; rather than
/// supporting decrease-key on a binary heap, stale entries are left in
/// place and discarded lazily on pop (the `current` map is the source of
/// truth for "is this entry still valid").
#[derive(Debug, Default)]
pub struct LeaseQueue {
    heap: BinaryHeap<Reverse<(Instant, i64)>>,
    current: HashMap<i64, Instant>,
}

impl LeaseQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` next expires at `expiry`, pushing a fresh heap
    /// entry. Any previously pushed entry for `id` becomes stale and is
    /// discarded the next time it would be popped.
    pub fn insert(&mut self, id: i64, expiry: Instant) {
        let _ignore = self.current.insert(id, expiry);
        self.heap.push(Reverse((expiry, id)));
    }

    /// Equivalent to [`LeaseQueue::insert`]; kept as a distinct name at call
    /// sites that are conceptually updating rather than first-inserting
    /// (lease renewal).
    pub fn update(&mut self, id: i64, expiry: Instant) -> bool {
        let existed = self.current.contains_key(&id);
        self.insert(id, expiry);
        existed
    }

    /// The earliest still-valid expiry in the queue, if any.
    pub fn peek(&mut self) -> Option<&Instant> {
        self.drain_stale();
        self.heap.peek().map(|Reverse((expiry, _))| expiry)
    }

    /// Pop the lease id with the earliest still-valid expiry.
    pub fn pop(&mut self) -> Option<i64> {
        self.drain_stale();
        self.heap.pop().map(|Reverse((expiry, id))| {
            // The entry just popped is the current one for `id`; forget it
            // so a later re-insert for the same id isn't mistaken for
            // stale.
            if self.current.get(&id) == Some(&expiry) {
                let _ignore = self.current.remove(&id);
            }
            id
        })
    }

    /// Drop all entries, used on leader demotion (§4.3 `demote`) when every
    /// lease is pinned to never expire locally.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.current.clear();
    }

    fn drain_stale(&mut self) {
        while let Some(Reverse((expiry, id))) = self.heap.peek().copied() {
            if self.current.get(&id) == Some(&expiry) {
                break;
            }
            let _ignore = self.heap.pop();
        }
    }
}
