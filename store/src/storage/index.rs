use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{revision::Revision, rpc::KeyRange};

/// One entry in a key's revision history: either a live version (with its
/// own `create_revision`/`mod_revision`/`version` triple, invariant 1 of
/// §3) or a tombstone recording that the key was deleted at `revision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRevision {
    /// The `(main, sub)` coordinate this entry was written at.
    pub revision: Revision,
    /// `create_revision` as of this entry, 0 if this entry is a tombstone.
    pub create_revision: i64,
    /// `mod_revision` as of this entry (always `revision.main`).
    pub mod_revision: i64,
    /// `version` as of this entry, 0 if this entry is a tombstone.
    pub version: i64,
}

impl KeyRevision {
    fn tombstone(revision: Revision) -> Self {
        Self {
            revision,
            create_revision: 0,
            mod_revision: revision.main,
            version: 0,
        }
    }

    /// Whether this entry represents a delete rather than a live version.
    pub fn is_tombstone(&self) -> bool {
        self.version == 0 && self.create_revision == 0
    }
}

/// The in-memory, per-key revision history (§9 "Polymorphic backend": all
/// MVCC logic, including this index, lives above the storage-engine
/// boundary and is rebuilt on recovery by replaying `KV_TABLE`). Maps a key
/// to the ordered list of revisions it has ever been written or deleted at.
#[derive(Debug, Default)]
pub struct Index {
    history: RwLock<BTreeMap<Vec<u8>, Vec<KeyRevision>>>,
}

/// What a Put needs to know to build the new [`crate::rpc::KeyValue`] fields
/// (§4.1 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// The revision this write landed at.
    pub revision: Revision,
    /// `create_revision` for the resulting live key.
    pub create_revision: i64,
    /// `mod_revision` for the resulting live key (== `revision.main`).
    pub mod_revision: i64,
    /// `version` for the resulting live key.
    pub version: i64,
}

impl Index {
    /// An empty index, used for a fresh store or as the target of snapshot
    /// restore / recovery replay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently has a live (non-tombstoned) entry.
    pub fn contains_live(&self, key: &[u8]) -> bool {
        self.history
            .read()
            .get(key)
            .and_then(|entries| entries.last())
            .is_some_and(|entry| !entry.is_tombstone())
    }

    /// Record a Put, returning the fields needed to build the new
    /// [`crate::rpc::KeyValue`] (§4.1 step 3: create_revision carries
    /// forward from the previous live version, or starts at this
    /// revision if the key is new or was deleted).
    pub fn put(&self, key: &[u8], revision: Revision) -> PutOutcome {
        let mut history = self.history.write();
        let entries = history.entry(key.to_vec()).or_default();
        let prev_live = entries.last().filter(|entry| !entry.is_tombstone());
        let (create_revision, version) = match prev_live {
            Some(prev) => (prev.create_revision, prev.version + 1),
            None => (revision.main, 1),
        };
        entries.push(KeyRevision {
            revision,
            create_revision,
            mod_revision: revision.main,
            version,
        });
        PutOutcome {
            revision,
            create_revision,
            mod_revision: revision.main,
            version,
        }
    }

    /// Record a delete for every currently-live key in `range`, each at its
    /// own `sub_revision` offset from `revision` (§4.1 "Delete"). Returns
    /// the deleted keys together with the revision each was deleted at, in
    /// key order — callers use this to fetch the pre-delete `KeyValue` from
    /// the backing store and to build the tombstone write.
    pub fn delete(&self, range: &KeyRange, revision: i64, sub_start: i64) -> Vec<(Vec<u8>, Revision)> {
        let mut history = self.history.write();
        let mut out = Vec::new();
        let mut sub = sub_start;
        for (key, entries) in history.iter_mut() {
            if !range.contains(key) {
                continue;
            }
            let is_live = entries.last().is_some_and(|entry| !entry.is_tombstone());
            if !is_live {
                continue;
            }
            let del_rev = Revision::new(revision, sub);
            entries.push(KeyRevision::tombstone(del_rev));
            out.push((key.clone(), del_rev));
            sub += 1;
        }
        out
    }

    /// Live keys (and their current revision coordinate) in `range`, for a
    /// current-state read (`as_of = 0`) or a historical one (`as_of > 0`,
    /// §6.1 Range's `revision` parameter).
    pub fn get(&self, range: &KeyRange, as_of: i64) -> Vec<(Vec<u8>, Revision)> {
        let history = self.history.read();
        let mut out = Vec::new();
        for (key, entries) in history.iter() {
            if !range.contains(key) {
                continue;
            }
            let entry = if as_of <= 0 {
                entries.last()
            } else {
                entries.iter().rev().find(|e| e.revision.main <= as_of)
            };
            if let Some(entry) = entry {
                if !entry.is_tombstone() {
                    out.push((key.clone(), entry.revision));
                }
            }
        }
        out
    }

    /// Insert a single live entry straight into a key's history, bypassing
    /// the `create_revision`/`version` recomputation [`Index::put`] does
    /// from prior entries. Used by the snapshotter (§4.8) while restoring
    /// from a manifest, and by node startup while replaying `KV_TABLE` to
    /// rebuild this in-memory index from what was last persisted — both
    /// already carry each key's exact `create_revision`/`mod_revision`/
    /// `version` triple, before normal traffic resumes.
    pub fn restore_entry(&self, key: Vec<u8>, entry: KeyRevision) {
        self.history.write().entry(key).or_default().push(entry);
    }

    /// Discard history entries at or below `compacted_revision`, keeping
    /// only the most recent entry at-or-below that mark so reads exactly at
    /// the compaction boundary still resolve correctly (§4.8 Compact). Keys
    /// whose only remaining entry is a tombstone are dropped entirely.
    pub fn compact(&self, compacted_revision: i64) {
        let mut history = self.history.write();
        history.retain(|_, entries| {
            let keep_from = entries
                .iter()
                .rposition(|entry| entry.revision.main <= compacted_revision);
            if let Some(idx) = keep_from {
                entries.drain(..idx);
            }
            !(entries.len() == 1 && entries[0].is_tombstone())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_on_new_key_creates_at_its_own_revision() {
        let index = Index::new();
        let outcome = index.put(b"k", Revision::new(1, 0));
        assert_eq!(outcome.create_revision, 1);
        assert_eq!(outcome.version, 1);
    }

    #[test]
    fn delete_then_put_restores_create_revision_to_recreation_point() {
        let index = Index::new();
        let _ = index.put(b"k", Revision::new(1, 0));
        let deleted = index.delete(&KeyRange::single(b"k".to_vec()), 2, 0);
        assert_eq!(deleted.len(), 1);
        let outcome = index.put(b"k", Revision::new(3, 0));
        assert_eq!(outcome.create_revision, 3);
        assert_eq!(outcome.version, 1);
    }

    #[test]
    fn delete_of_absent_key_is_a_no_op() {
        let index = Index::new();
        let deleted = index.delete(&KeyRange::single(b"missing".to_vec()), 1, 0);
        assert!(deleted.is_empty());
    }

    #[test]
    fn get_at_revision_zero_returns_current_live_keys() {
        let index = Index::new();
        let _ = index.put(b"a", Revision::new(1, 0));
        let _ = index.delete(&KeyRange::single(b"a".to_vec()), 2, 0);
        let _ = index.put(b"b", Revision::new(3, 0));
        let live = index.get(&KeyRange::new(b"a".to_vec(), [0xff].to_vec()), 0);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, b"b");
    }

    #[test]
    fn get_at_historical_revision_sees_key_before_its_deletion() {
        let index = Index::new();
        let _ = index.put(b"a", Revision::new(1, 0));
        let _ = index.delete(&KeyRange::single(b"a".to_vec()), 2, 0);
        let at_one = index.get(&KeyRange::single(b"a".to_vec()), 1);
        assert_eq!(at_one.len(), 1);
        let at_two = index.get(&KeyRange::single(b"a".to_vec()), 2);
        assert!(at_two.is_empty());
    }

    #[test]
    fn compact_drops_history_below_the_compacted_revision_but_keeps_boundary_entry() {
        let index = Index::new();
        let _ = index.put(b"a", Revision::new(1, 0));
        let _ = index.put(b"a", Revision::new(2, 0));
        let _ = index.put(b"a", Revision::new(3, 0));
        index.compact(2);
        let at_two = index.get(&KeyRange::single(b"a".to_vec()), 2);
        assert_eq!(at_two.len(), 1);
        assert_eq!(at_two[0].1, Revision::new(2, 0));
    }
}
