use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

/// A single mutation's coordinate: `main` is the global revision bumped once
/// per apply (§3), `sub` disambiguates multiple keys touched within the same
/// apply (a multi-key delete, a lease revoke, a transaction with several
/// then-ops). Ordering is `(main, sub)` lexicographic, which is exactly the
/// big-endian byte encoding used under the `kv:` table prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision {
    /// The global MVCC revision.
    pub main: i64,
    /// Disambiguates multiple keys within one apply.
    pub sub: i64,
}

impl Revision {
    /// Build a revision coordinate.
    pub const fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }
}

/// The global, monotonically increasing revision clock (§3 `Revision`). One
/// successful mutating apply — regardless of how many keys it touches —
/// bumps this exactly once (§9 "batched proposals and revisions").
///
/// Shared via `Arc` so the header generator, kv store and lease store all
/// observe the same counter without copying it around.
#[derive(Debug)]
pub struct RevisionNumber {
    current: AtomicI64,
}

impl RevisionNumber {
    /// Start a fresh counter at `initial` (0 before any mutation, or the
    /// revision recorded in a restored snapshot).
    pub fn new(initial: i64) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicI64::new(initial),
        })
    }

    /// The current revision, without bumping it.
    pub fn get(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    /// Atomically bump and return the new revision. Only the single apply
    /// task may call this (§5 single-writer discipline); the atomic is
    /// still used so reads never observe a torn value.
    pub fn next(&self) -> i64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Force the counter to `revision`, used when restoring a snapshot
    /// (§4.8) to re-establish exactly the revision the snapshot was taken
    /// at (invariant 3, §3).
    pub fn restore(&self, revision: i64) {
        self.current.store(revision, Ordering::Release);
    }
}

/// The highest revision below which historical versions may have been
/// discarded (§3 `CompactedRevision`). A read at or below this revision
/// fails with `Compacted` (§7).
#[derive(Debug)]
pub struct CompactedRevision {
    value: AtomicI64,
}

impl CompactedRevision {
    /// Start with nothing compacted.
    pub fn new(initial: i64) -> Arc<Self> {
        Arc::new(Self {
            value: AtomicI64::new(initial),
        })
    }

    /// The current compacted revision.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Record a new compacted revision. Callers must have already validated
    /// `rev` via [`crate::error::CoreError`] rules (§4.8).
    pub fn set(&self, rev: i64) {
        self.value.store(rev, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_starts_at_zero_and_bumps_once_per_mutation() {
        let rev = RevisionNumber::new(0);
        assert_eq!(rev.get(), 0);
        assert_eq!(rev.next(), 1);
        assert_eq!(rev.next(), 2);
        assert_eq!(rev.get(), 2);
    }

    #[test]
    fn restore_reestablishes_snapshot_revision() {
        let rev = RevisionNumber::new(0);
        let _ = rev.next();
        let _ = rev.next();
        rev.restore(42);
        assert_eq!(rev.get(), 42);
        assert_eq!(rev.next(), 43);
    }

    #[test]
    fn coordinate_ordering_is_main_then_sub() {
        assert!(Revision::new(1, 5) < Revision::new(2, 0));
        assert!(Revision::new(3, 0) < Revision::new(3, 1));
    }
}
