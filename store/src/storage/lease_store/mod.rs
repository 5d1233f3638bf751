/// Lease record and expiry bookkeeping.
mod lease;
/// Expiry-ordered queue backing the leader-side revocation ticker.
mod lease_queue;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use engine::{StorageEngine, WriteOp};
use parking_lot::RwLock;
use prost::Message;
use rand::Rng;

pub use self::lease::Lease;
use self::lease_queue::LeaseQueue;
use super::{
    db::{Db, KV_TABLE, LEASE_TABLE},
    index::Index,
};
use crate::{
    error::{CoreError, FatalError},
    header_gen::HeaderGenerator,
    revision::{Revision, RevisionNumber},
    rpc::{
        Event, EventType, KeyRange, KeyValue, LeaseGrantResponse, LeaseRevokeResponse,
        LeaseTimeToLiveResponse, PersistedLease,
    },
    state::State,
};

/// Largest ttl a `LeaseGrant` may request.
const MAX_LEASE_TTL: i64 = 9_000_000_000;
/// Smallest ttl a `LeaseGrant` is clamped up to.
const MIN_LEASE_TTL: i64 = 1;

/// In-memory collection of lease records and key bindings (§3 `Lease`).
/// Owned behind an `Arc<RwLock<_>>` shared between the [`LeaseStore`] (grant
/// / revoke / renew) and the kv store's Put path (attach, §4.1 step 4),
/// since both need to mutate it inside a single atomic apply.
#[derive(Debug, Default)]
pub struct LeaseCollection {
    lease_map: std::collections::HashMap<i64, Lease>,
    item_map: std::collections::HashMap<Vec<u8>, i64>,
    expired_queue: LeaseQueue,
}

impl LeaseCollection {
    /// An empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases whose expiry has already passed, removed from the queue (but
    /// not yet from `lease_map` — the caller still has to propose and apply
    /// a `LeaseRevoke` for each, §4.3).
    fn find_expired_leases(&mut self) -> Vec<i64> {
        let mut expired = Vec::new();
        while let Some(&expiry) = self.expired_queue.peek() {
            if expiry > Instant::now() {
                break;
            }
            if let Some(id) = self.expired_queue.pop() {
                if self.lease_map.contains_key(&id) {
                    expired.push(id);
                }
            }
        }
        expired
    }

    fn renew(&mut self, lease_id: i64) -> Result<i64, CoreError> {
        let lease = self
            .lease_map
            .get_mut(&lease_id)
            .ok_or_else(|| CoreError::NotFound("lease".to_string()))?;
        if lease.expired() {
            return Err(CoreError::NotFound("lease".to_string()));
        }
        let expiry = lease.refresh(Duration::default());
        let _ignore = self.expired_queue.update(lease_id, expiry);
        Ok(lease.ttl().as_secs() as i64)
    }

    /// Attach `key` to `lease_id` (§4.1 Put step 4). Fails the whole Put
    /// apply with `LeaseNotFound` if the lease does not exist.
    pub fn attach(&mut self, lease_id: i64, key: Vec<u8>) -> Result<(), CoreError> {
        let lease = self
            .lease_map
            .get_mut(&lease_id)
            .ok_or(CoreError::LeaseNotFound(lease_id))?;
        lease.insert_key(key.clone());
        let _ignore = self.item_map.insert(key, lease_id);
        Ok(())
    }

    /// Detach `key` from whichever lease it is bound to, if any.
    pub fn detach(&mut self, lease_id: i64, key: &[u8]) {
        if let Some(lease) = self.lease_map.get_mut(&lease_id) {
            lease.remove_key(key);
        }
        let _ignore = self.item_map.remove(key);
    }

    /// The lease id a key is currently bound to, 0 if unattached.
    pub fn get_lease(&self, key: &[u8]) -> i64 {
        self.item_map.get(key).copied().unwrap_or(0)
    }

    /// Whether `lease_id` is currently granted.
    pub fn contains_lease(&self, lease_id: i64) -> bool {
        self.lease_map.contains_key(&lease_id)
    }

    fn grant(&mut self, lease_id: i64, ttl: i64, is_leader: bool) -> Lease {
        let mut lease = Lease::new(lease_id, ttl.max(MIN_LEASE_TTL) as u64);
        if is_leader {
            let expiry = lease.refresh(Duration::ZERO);
            let _ignore = self.expired_queue.insert(lease_id, expiry);
        } else {
            lease.forever();
        }
        let _ignore = self.lease_map.insert(lease_id, lease.clone());
        lease
    }

    fn revoke(&mut self, lease_id: i64) -> Option<Lease> {
        self.lease_map.remove(&lease_id)
    }

    /// Stop expiring leases locally (lost leadership): every lease is
    /// pinned to never expire until a new leader's ticker revokes it
    /// (§4.3).
    pub fn demote(&mut self) {
        for lease in self.lease_map.values_mut() {
            lease.forever();
        }
        self.expired_queue.clear();
    }

    /// Resume expiring leases locally (gained leadership). `extend` gives
    /// every lease a grace window before its first possible expiry so a
    /// leadership flap doesn't immediately revoke leases a client was
    /// actively renewing against the old leader.
    pub fn promote(&mut self, extend: Duration) {
        for lease in self.lease_map.values_mut() {
            let expiry = lease.refresh(extend);
            let _ignore = self.expired_queue.insert(lease.id(), expiry);
        }
    }
}

/// The lease subsystem (§4.3): grant, revoke, renew, and the leader-driven
/// expiry ticker that turns an expired lease into a `LeaseRevoke` proposal.
#[derive(Debug)]
pub struct LeaseStore<E> {
    collection: Arc<RwLock<LeaseCollection>>,
    db: Arc<Db<E>>,
    index: Arc<Index>,
    state: Arc<State>,
    revision: Arc<RevisionNumber>,
    header_gen: Arc<HeaderGenerator>,
}

impl<E: StorageEngine> LeaseStore<E> {
    /// Build a lease store sharing `collection` with the kv store's Put
    /// path (so attaching a key to a lease and writing the key happen
    /// inside the same atomic apply).
    pub fn new(
        collection: Arc<RwLock<LeaseCollection>>,
        db: Arc<Db<E>>,
        index: Arc<Index>,
        state: Arc<State>,
        header_gen: Arc<HeaderGenerator>,
    ) -> Self {
        Self {
            collection,
            db,
            index,
            revision: header_gen.revision_arc(),
            state,
            header_gen,
        }
    }

    /// Expose the shared lease collection so the kv store's Put apply can
    /// attach newly-written keys without a second lock type.
    pub fn collection(&self) -> Arc<RwLock<LeaseCollection>> {
        Arc::clone(&self.collection)
    }

    fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    /// Apply a `LeaseGrant` (§4.1 `LeaseGrant`). Idempotent: granting an
    /// existing id replaces its ttl and resets its expiry clock.
    pub fn apply_grant(&self, id: i64, ttl: i64) -> Result<LeaseGrantResponse, FatalError> {
        if ttl > MAX_LEASE_TTL {
            return Ok(LeaseGrantResponse {
                header: Some(self.header_gen.gen_header_without_revision()),
                id,
                ttl: 0,
                error: format!("requested ttl {ttl} exceeds maximum {MAX_LEASE_TTL}"),
            });
        }
        let resolved_id = if id == 0 {
            self.allocate_lease_id()
        } else {
            id
        };
        let lease = self
            .collection
            .write()
            .grant(resolved_id, ttl, self.is_leader());
        let persisted = PersistedLease {
            id: lease.id(),
            ttl: lease.ttl().as_secs() as i64,
        };
        self.db.commit(
            vec![WriteOp::Put {
                table: LEASE_TABLE,
                key: lease_key(lease.id()),
                value: persisted.encode_to_vec(),
            }],
            None,
            None,
        )?;
        Ok(LeaseGrantResponse {
            header: Some(self.header_gen.gen_header_without_revision()),
            id: lease.id(),
            ttl: lease.ttl().as_secs() as i64,
            error: String::new(),
        })
    }

    fn allocate_lease_id(&self) -> i64 {
        let collection = self.collection.read();
        loop {
            let candidate: i64 = rand::thread_rng().gen_range(1..i64::MAX);
            if !collection.contains_lease(candidate) {
                return candidate;
            }
        }
    }

    /// Apply a `LeaseRevoke` (§4.1 `LeaseRevoke`). Deletes every key bound
    /// to the lease as one atomic batch bumping the revision exactly once,
    /// then drops the lease record. Revoking an unknown lease is a no-op
    /// (§8 idempotence), not an error — a delivered revoke on a lease this
    /// node already garbage-collected must not fail the apply loop.
    pub fn apply_revoke(&self, id: i64) -> Result<(LeaseRevokeResponse, Vec<Event>), FatalError> {
        let keys = match self.collection.read().lease_map.get(&id) {
            Some(lease) => lease.keys(),
            None => {
                return Ok((
                    LeaseRevokeResponse {
                        header: Some(self.header_gen.gen_header_without_revision()),
                    },
                    Vec::new(),
                ))
            }
        };

        if keys.is_empty() {
            let _ignore = self.collection.write().revoke(id);
            self.db.commit(
                vec![WriteOp::Delete {
                    table: LEASE_TABLE,
                    key: lease_key(id),
                }],
                None,
                None,
            )?;
            return Ok((
                LeaseRevokeResponse {
                    header: Some(self.header_gen.gen_header_without_revision()),
                },
                Vec::new(),
            ));
        }

        let revision = self.revision.next();
        let mut ops = vec![WriteOp::Delete {
            table: LEASE_TABLE,
            key: lease_key(id),
        }];
        let mut events = Vec::with_capacity(keys.len());
        for (sub, key) in keys.iter().enumerate() {
            let prev_bytes = self.db.engine().get(KV_TABLE, key.as_slice())?;
            let prev_kv = prev_bytes
                .map(|bytes| KeyValue::decode(bytes.as_slice()))
                .transpose()
                .map_err(|e| FatalError::Decode(e.to_string()))?;
            let del_rev = Revision::new(revision, sub as i64);
            let _deleted = self
                .index
                .delete(&KeyRange::single(key.clone()), revision, sub as i64);
            let tombstone = KeyValue::tombstone(key.clone(), revision);
            ops.push(WriteOp::Put {
                table: KV_TABLE,
                key: del_rev.encode().to_vec(),
                value: tombstone.encode_to_vec(),
            });
            self.collection.write().detach(id, key);
            events.push(EventType::Delete.event(tombstone, prev_kv));
        }
        let _ignore = self.collection.write().revoke(id);
        self.db.commit(ops, Some(revision), None)?;
        Ok((
            LeaseRevokeResponse {
                header: Some(self.header_gen.gen_header()),
            },
            events,
        ))
    }

    /// `LeaseRenew` (§4.3): leader-local, does not go through Raft — see
    /// DESIGN.md for the tradeoff this accepts. Rejected off the leader so
    /// a stale follower can't silently extend a lease the real leader is
    /// about to expire.
    pub fn keep_alive(&self, lease_id: i64) -> Result<i64, CoreError> {
        if !self.is_leader() {
            return Err(CoreError::NotLeader(Some(self.state.leader_id())));
        }
        self.collection.write().renew(lease_id)
    }

    /// `LeaseTimeToLive` (§6.1).
    pub fn time_to_live(
        &self,
        lease_id: i64,
        include_keys: bool,
    ) -> Result<LeaseTimeToLiveResponse, CoreError> {
        let collection = self.collection.read();
        let lease = collection
            .lease_map
            .get(&lease_id)
            .ok_or_else(|| CoreError::NotFound("lease".to_string()))?;
        Ok(LeaseTimeToLiveResponse {
            header: Some(self.header_gen.gen_header()),
            id: lease_id,
            ttl: lease.remaining_ttl().as_secs() as i64,
            granted_ttl: lease.ttl().as_secs() as i64,
            keys: if include_keys {
                lease.keys()
            } else {
                Vec::new()
            },
        })
    }

    /// Every granted lease, soonest-to-expire first.
    pub fn leases(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.collection.read().lease_map.values().cloned().collect();
        leases.sort_by_key(Lease::remaining);
        leases
    }

    /// Leases whose expiry has passed; the caller (expiry ticker, §4.3)
    /// turns each into a `LeaseRevoke` proposal.
    pub fn find_expired_leases(&self) -> Vec<i64> {
        self.collection.write().find_expired_leases()
    }

    /// Stop expiring leases locally (lost leadership).
    pub fn demote(&self) {
        self.collection.write().demote();
    }

    /// Resume expiring leases locally (gained leadership), giving every
    /// lease `extend` grace before its first possible expiry.
    pub fn promote(&self, extend: Duration) {
        self.collection.write().promote(extend);
    }

    /// Rebuild the in-memory lease map from persisted records on startup.
    /// Key bindings are rebuilt separately when the kv store replays
    /// `KV_TABLE` and re-attaches each live key's `lease_id`.
    pub fn recover(&self) -> Result<(), FatalError> {
        for (_, bytes) in self.db.engine().get_all(LEASE_TABLE)? {
            let persisted = PersistedLease::decode(bytes.as_slice())
                .map_err(|e| FatalError::Decode(e.to_string()))?;
            let _ignore = self
                .collection
                .write()
                .grant(persisted.id, persisted.ttl, false);
        }
        Ok(())
    }
}

fn lease_key(id: i64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use engine::MemoryEngine;

    use super::*;
    use crate::{header_gen::HeaderGenerator, storage::db::TABLES};

    fn new_store() -> (LeaseStore<MemoryEngine>, Arc<RwLock<LeaseCollection>>) {
        let engine = Arc::new(MemoryEngine::new(TABLES));
        let db = Arc::new(Db::new(engine));
        let index = Arc::new(Index::new());
        let state = Arc::new(State::default());
        state.update(1, 1, true);
        let header_gen = Arc::new(HeaderGenerator::new(1, 1));
        let collection = Arc::new(RwLock::new(LeaseCollection::new()));
        let store = LeaseStore::new(Arc::clone(&collection), db, index, state, header_gen);
        (store, collection)
    }

    #[test]
    fn grant_then_revoke_round_trips() {
        let (store, _collection) = new_store();
        let granted = store.apply_grant(1, 10).unwrap();
        assert_eq!(granted.id, 1);
        assert_eq!(granted.ttl, 10);
        assert_eq!(store.leases().len(), 1);

        let (_, events) = store.apply_revoke(1).unwrap();
        assert!(events.is_empty());
        assert!(store.leases().is_empty());
    }

    #[test]
    fn revoke_of_unknown_lease_is_a_no_op() {
        let (store, _collection) = new_store();
        let (resp, events) = store.apply_revoke(999).unwrap();
        assert!(events.is_empty());
        assert!(resp.header.is_some());
    }

    #[test]
    fn grant_with_id_zero_allocates_one() {
        let (store, _collection) = new_store();
        let granted = store.apply_grant(0, 10).unwrap();
        assert_ne!(granted.id, 0);
    }

    #[test]
    fn ttl_above_maximum_is_rejected_without_failing_the_apply() {
        let (store, _collection) = new_store();
        let granted = store.apply_grant(1, MAX_LEASE_TTL + 1).unwrap();
        assert!(!granted.error.is_empty());
    }

    #[test]
    fn keep_alive_rejects_when_not_leader() {
        let (store, _collection) = new_store();
        store.state.update(2, 2, false);
        let _ = store.apply_grant(1, 10).unwrap();
        assert!(store.keep_alive(1).is_err());
    }
}
