use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Thin wrapper documenting the lock-hold discipline used by the watch hub
/// and pending-proposal map: readers snapshot under a short-lived guard and
/// do the actual work (channel sends, I/O) after dropping it.
#[derive(Debug, Default)]
pub struct SnapshotGuard<T> {
    inner: RwLock<T>,
}

impl<T> SnapshotGuard<T> {
    /// Wrap a value behind a read/write guard.
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Take a read lock and project out a clone, releasing the lock before
    /// returning.
    pub fn snapshot<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard: RwLockReadGuard<'_, T> = self.inner.read();
        f(&guard)
    }

    /// Take a write lock for a short, non-blocking mutation.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard: RwLockWriteGuard<'_, T> = self.inner.write();
        f(&mut guard)
    }
}

/// A small helper used by slow-consumer deadlines (§4.4) and proposal
/// timeouts (§4.5) so callers express an absolute deadline instead of
/// threading `Instant::now()` through call sites.
pub fn deadline_from(timeout: Duration) -> std::time::Instant {
    std::time::Instant::now() + timeout
}
