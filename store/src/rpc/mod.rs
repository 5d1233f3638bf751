//! Wire types for the MVCC core's request/response surface, generated from
//! `proto/mvcc.proto` at build time via `prost-build` — the same mechanism
//! etcd-compatible front-ends use to keep their message shapes interop-safe
//! with existing etcd clients.

#![allow(clippy::all)]
include!(concat!(env!("OUT_DIR"), "/storecore.rs"));

use crate::revision::Revision;

/// The sentinel `range_end` byte string meaning "open ended to the right".
pub const RANGE_END_OPEN: &[u8] = &[0];

/// A half-open key range `[start, end)`. An empty `end` means "this exact
/// key only"; `end == RANGE_END_OPEN` means "everything ≥ start".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub start: Vec<u8>,
    /// Exclusive upper bound; empty means single-key, `\x00` means open.
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Build a range from raw `(key, range_end)` wire fields.
    pub fn new(key: impl Into<Vec<u8>>, range_end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: key.into(),
            end: range_end.into(),
        }
    }

    /// A range matching exactly one key.
    pub fn single(key: impl Into<Vec<u8>>) -> Self {
        Self {
            start: key.into(),
            end: Vec::new(),
        }
    }

    /// Whether this range is open-ended to the right (`range_end ==
    /// "\x00"`).
    pub fn is_open_ended(&self) -> bool {
        self.end == RANGE_END_OPEN
    }

    /// Whether this range matches exactly one key (`range_end` empty).
    pub fn is_single_key(&self) -> bool {
        self.end.is_empty()
    }

    /// Whether `key` falls inside this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        if self.is_single_key() {
            return key == self.start.as_slice();
        }
        if key < self.start.as_slice() {
            return false;
        }
        self.is_open_ended() || key < self.end.as_slice()
    }

    /// Whether `other` overlaps this range at all — used by the watch hub to
    /// decide if a subscription should see an event on a given key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        if other.is_single_key() {
            return self.contains(&other.start);
        }
        if self.is_single_key() {
            return other.contains(&self.start);
        }
        let self_end_ok = self.is_open_ended() || other.start < self.end;
        let other_end_ok = other.is_open_ended() || self.start < other.end;
        self_end_ok && other_end_ok
    }
}

impl EventType {
    /// Build a [`Event`] of this type from a kv and optional previous value.
    pub fn event(self, kv: KeyValue, prev_kv: Option<KeyValue>) -> Event {
        Event {
            r#type: self as i32,
            kv: Some(kv),
            prev_kv,
        }
    }
}

impl KeyValue {
    /// The tombstone representation written for a deleted key: empty value,
    /// zeroed version/create_revision, `mod_revision` set to the deleting
    /// revision (§4.1 "Delete").
    pub fn tombstone(key: Vec<u8>, mod_revision: i64) -> Self {
        Self {
            key,
            value: Vec::new(),
            create_revision: 0,
            mod_revision,
            version: 0,
            lease: 0,
        }
    }

    /// Whether this record represents a live key (as opposed to a tombstone
    /// synthesized for a Delete event).
    pub fn is_tombstone(&self) -> bool {
        self.version == 0 && self.create_revision == 0
    }
}

impl Revision {
    /// Encode as the big-endian sortable key bytes used under the `kv:`
    /// table prefix (§6.3), so iteration order matches revision order.
    pub fn encode(self) -> [u8; 16] {
        let mut buf = [0_u8; 16];
        buf[..8].copy_from_slice(&self.main.to_be_bytes());
        buf[8..].copy_from_slice(&self.sub.to_be_bytes());
        buf
    }

    /// Decode revision key bytes produced by [`Revision::encode`].
    pub fn decode(bytes: &[u8]) -> Self {
        let mut main_bytes = [0_u8; 8];
        let mut sub_bytes = [0_u8; 8];
        main_bytes.copy_from_slice(&bytes[..8]);
        sub_bytes.copy_from_slice(&bytes[8..16]);
        Self {
            main: i64::from_be_bytes(main_bytes),
            sub: i64::from_be_bytes(sub_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_key_range_matches_only_that_key() {
        let range = KeyRange::single(b"foo".to_vec());
        assert!(range.contains(b"foo"));
        assert!(!range.contains(b"foobar"));
    }

    #[test]
    fn open_ended_range_matches_everything_after_start() {
        let range = KeyRange::new(b"m".to_vec(), RANGE_END_OPEN.to_vec());
        assert!(range.contains(b"m"));
        assert!(range.contains(b"zzz"));
        assert!(!range.contains(b"a"));
    }

    #[test]
    fn bounded_range_is_half_open() {
        let range = KeyRange::new(b"a".to_vec(), b"c".to_vec());
        assert!(range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(!range.contains(b"c"));
    }

    #[test]
    fn revision_encoding_round_trips_and_sorts() {
        let a = Revision::new(1, 0);
        let b = Revision::new(1, 1);
        let c = Revision::new(2, 0);
        assert!(a.encode() < b.encode());
        assert!(b.encode() < c.encode());
        assert_eq!(Revision::decode(&a.encode()), a);
    }
}
