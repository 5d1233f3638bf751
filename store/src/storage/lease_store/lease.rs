use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

/// A far-future instant used to mark a lease that must never expire on this
/// node: a follower tracking leases it did not grant (§4.3, `demote`), or a
/// lease granted while this node was not the leader.
fn forever_instant() -> Instant {
    Instant::now() + Duration::from_secs(100 * 365 * 24 * 3600)
}

/// A TTL-bound identifier (§3 `Lease`). The leader tracks `expiry` as a wall
/// clock instant and drives revocation from it (§4.3); followers carry the
/// same record with `expiry` pinned to [`forever_instant`] so they never
/// independently decide to expire a lease the leader hasn't revoked yet.
#[derive(Debug, Clone)]
pub struct Lease {
    id: i64,
    ttl: Duration,
    expiry: Instant,
    keys: HashSet<Vec<u8>>,
}

impl Lease {
    /// Grant a new lease with the given ttl (seconds). Starts with no
    /// expiry set; callers call [`Lease::refresh`] or [`Lease::forever`]
    /// depending on whether this node is the leader (§4.3 `grant`).
    pub fn new(id: i64, ttl_secs: u64) -> Self {
        Self {
            id,
            ttl: Duration::from_secs(ttl_secs),
            expiry: forever_instant(),
            keys: HashSet::new(),
        }
    }

    /// This lease's id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// This lease's granted ttl.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Push `expiry` out to `now + ttl + extend`, returning the new expiry
    /// so the caller can update the expiry-ordered queue. `extend` is used
    /// on leader promotion (§4.3 `promote`) to give newly-leading leases a
    /// grace window before the expiry ticker starts scanning them.
    pub fn refresh(&mut self, extend: Duration) -> Instant {
        self.expiry = Instant::now() + self.ttl + extend;
        self.expiry
    }

    /// Pin this lease to never expire locally (follower tracking, or a
    /// lease granted while not leader).
    pub fn forever(&mut self) {
        self.expiry = forever_instant();
    }

    /// Whether `expiry` has already passed.
    pub fn expired(&self) -> bool {
        self.expiry <= Instant::now()
    }

    /// Time remaining until expiry, 0 if already expired.
    pub fn remaining(&self) -> Duration {
        self.expiry.saturating_duration_since(Instant::now())
    }

    /// `remaining()` in whole seconds, the unit the wire protocol uses.
    pub fn remaining_ttl(&self) -> Duration {
        Duration::from_secs(self.remaining().as_secs())
    }

    /// Attach `key` to this lease (§4.1 Put step 4).
    pub fn insert_key(&mut self, key: Vec<u8>) {
        let _ignore = self.keys.insert(key);
    }

    /// Detach `key` from this lease.
    pub fn remove_key(&mut self, key: &[u8]) {
        let _ignore = self.keys.remove(key);
    }

    /// Every key currently bound to this lease, in arbitrary order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.keys.iter().cloned().collect()
    }

    /// This lease's expiry instant, for the expiry-ordered queue.
    pub fn expiry(&self) -> Instant {
        self.expiry
    }
}
