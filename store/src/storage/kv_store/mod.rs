/// Compare-predicate evaluation for `Txn` (§4.2).
mod txn;

use std::sync::Arc;

use engine::{StorageEngine, WriteOp};
use parking_lot::RwLock;
use prost::Message;

use super::{
    db::{Db, KV_TABLE},
    index::Index,
    lease_store::LeaseCollection,
};
use crate::{
    error::{ApplyError, CoreError, FatalError},
    header_gen::HeaderGenerator,
    revision::{CompactedRevision, Revision, RevisionNumber},
    rpc::{
        request_op, response_op, DeleteRangeRequest, DeleteRangeResponse, Event, EventType,
        KeyRange, KeyValue, PutRequest, PutResponse, RangeRequest, RangeResponse, RequestOp,
        RequestWrapper, ResponseOp, ResponseWrapper, SortOrder, SortTarget, TxnRequest,
        TxnResponse,
    },
};

/// The MVCC apply engine (§4.1): executes a single committed operation
/// against the local store, advances the revision clock, and returns the
/// events it produced for the Watch Hub.
#[derive(Debug)]
pub struct KvStore<E> {
    db: Arc<Db<E>>,
    index: Arc<Index>,
    lease_collection: Arc<RwLock<LeaseCollection>>,
    revision: Arc<RevisionNumber>,
    compacted_revision: Arc<CompactedRevision>,
    header_gen: Arc<HeaderGenerator>,
}

impl<E: StorageEngine> KvStore<E> {
    /// Build a store over `db`/`index`, sharing `lease_collection` with the
    /// lease subsystem so a Put's lease attach and a Delete's lease detach
    /// happen inside the same apply.
    pub fn new(
        db: Arc<Db<E>>,
        index: Arc<Index>,
        lease_collection: Arc<RwLock<LeaseCollection>>,
        compacted_revision: Arc<CompactedRevision>,
        header_gen: Arc<HeaderGenerator>,
    ) -> Self {
        Self {
            db,
            index,
            lease_collection,
            revision: header_gen.revision_arc(),
            compacted_revision,
            header_gen,
        }
    }

    /// Share the compacted-revision marker with the snapshotter (§4.8).
    pub fn compacted_revision(&self) -> Arc<CompactedRevision> {
        Arc::clone(&self.compacted_revision)
    }

    fn fetch(&self, revision: Revision) -> Result<KeyValue, FatalError> {
        let bytes = self
            .db
            .engine()
            .get(KV_TABLE, revision.encode())?
            .ok_or_else(|| FatalError::Decode(format!("missing kv record at {revision:?}")))?;
        KeyValue::decode(bytes.as_slice()).map_err(|e| FatalError::Decode(e.to_string()))
    }

    fn kvs_in_range(&self, range: &KeyRange, as_of: i64) -> Result<Vec<KeyValue>, FatalError> {
        self.index
            .get(range, as_of)
            .into_iter()
            .map(|(_, revision)| self.fetch(revision))
            .collect()
    }

    /// `Range` (§6.1). Read-only, bypasses Raft entirely.
    pub fn range(&self, req: &RangeRequest) -> Result<RangeResponse, CoreError> {
        let compacted = self.compacted_revision.get();
        if req.revision > 0 && req.revision <= compacted {
            return Err(CoreError::Compacted {
                requested: req.revision,
                compacted,
            });
        }
        let current = self.revision.get();
        if req.revision > current {
            return Err(CoreError::Unavailable {
                requested: req.revision,
                applied: current,
            });
        }
        let range = KeyRange::new(req.key.clone(), req.range_end.clone());
        let mut kvs = self
            .kvs_in_range(&range, req.revision)
            .map_err(|e| CoreError::FailedPrecondition(e.to_string()))?;

        let mut response = RangeResponse {
            header: Some(self.header_gen.gen_header()),
            count: kvs.len() as i64,
            kvs: Vec::new(),
            more: false,
        };
        if !req.count_only {
            sort_kvs(&mut kvs, req.sort_target(), req.sort_order());
            if req.limit > 0 && kvs.len() as i64 > req.limit {
                response.more = true;
                kvs.truncate(req.limit as usize);
            }
            if req.keys_only {
                for kv in &mut kvs {
                    kv.value.clear();
                }
            }
            response.kvs = kvs;
        }
        Ok(response)
    }

    /// `Put` (§4.1 "Put"), as a standalone top-level apply.
    pub fn apply_put(&self, req: PutRequest) -> Result<(PutResponse, Vec<Event>), ApplyError> {
        let candidate = self.revision.get() + 1;
        let (response, events) = self.do_put(req, candidate, 0)?;
        if !events.is_empty() {
            self.revision.restore(candidate);
        }
        Ok((response, events))
    }

    fn do_put(
        &self,
        req: PutRequest,
        revision: i64,
        sub: i64,
    ) -> Result<(PutResponse, Vec<Event>), ApplyError> {
        let single = KeyRange::single(req.key.clone());
        let prev = self.kvs_in_range(&single, 0)?.into_iter().next();
        if prev.is_none() && (req.ignore_value || req.ignore_lease) {
            return Err(ApplyError::Core(CoreError::FailedPrecondition(
                "ignore_value or ignore_lease requires an existing key".to_string(),
            )));
        }
        if req.lease != 0 && !self.lease_collection.read().contains_lease(req.lease) {
            return Err(ApplyError::Core(CoreError::LeaseNotFound(req.lease)));
        }

        let rev = Revision::new(revision, sub);
        let outcome = self.index.put(&req.key, rev);
        let mut value = req.value.clone();
        let mut lease = req.lease;
        if req.ignore_value {
            value = prev.as_ref().expect("checked above").value.clone();
        }
        if req.ignore_lease {
            lease = prev.as_ref().expect("checked above").lease;
        }
        let kv = KeyValue {
            key: req.key.clone(),
            value,
            create_revision: outcome.create_revision,
            mod_revision: outcome.mod_revision,
            version: outcome.version,
            lease,
        };
        self.db.commit(
            vec![WriteOp::Put {
                table: KV_TABLE,
                key: rev.encode().to_vec(),
                value: kv.encode_to_vec(),
            }],
            Some(revision),
            None,
        )?;

        {
            let mut collection = self.lease_collection.write();
            if let Some(prev_kv) = &prev {
                if prev_kv.lease != 0 && prev_kv.lease != lease {
                    collection.detach(prev_kv.lease, &req.key);
                }
            }
            if lease != 0 {
                collection
                    .attach(lease, req.key.clone())
                    .map_err(ApplyError::Core)?;
            }
        }

        let event = EventType::Put.event(kv.clone(), prev.clone());
        let response = PutResponse {
            header: Some(self.header_gen.gen_header()),
            prev_kv: if req.prev_kv { prev } else { None },
        };
        Ok((response, vec![event]))
    }

    /// `DeleteRange` (§4.1 "Delete"), as a standalone top-level apply.
    pub fn apply_delete_range(
        &self,
        req: DeleteRangeRequest,
    ) -> Result<(DeleteRangeResponse, Vec<Event>), ApplyError> {
        let candidate = self.revision.get() + 1;
        let (response, events, _next_sub) =
            self.do_delete(req.key, req.range_end, req.prev_kv, candidate, 0)?;
        if !events.is_empty() {
            self.revision.restore(candidate);
        }
        Ok((response, events))
    }

    fn do_delete(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        want_prev_kv: bool,
        revision: i64,
        sub_start: i64,
    ) -> Result<(DeleteRangeResponse, Vec<Event>, i64), ApplyError> {
        let range = KeyRange::new(key, range_end);
        let prev_kvs = self.kvs_in_range(&range, 0)?;
        if prev_kvs.is_empty() {
            return Ok((
                DeleteRangeResponse {
                    header: Some(self.header_gen.gen_header_without_revision()),
                    deleted: 0,
                    prev_kvs: Vec::new(),
                },
                Vec::new(),
                sub_start,
            ));
        }

        let deleted = self.index.delete(&range, revision, sub_start);
        let mut ops = Vec::with_capacity(deleted.len());
        let mut events = Vec::with_capacity(deleted.len());
        {
            let mut collection = self.lease_collection.write();
            for (prev, (key, rev)) in prev_kvs.iter().zip(deleted.iter()) {
                let tombstone = KeyValue::tombstone(key.clone(), rev.main);
                ops.push(WriteOp::Put {
                    table: KV_TABLE,
                    key: rev.encode().to_vec(),
                    value: tombstone.encode_to_vec(),
                });
                if prev.lease != 0 {
                    collection.detach(prev.lease, key);
                }
                events.push(EventType::Delete.event(tombstone, Some(prev.clone())));
            }
        }
        self.db.commit(ops, Some(revision), None)?;

        let next_sub = sub_start + deleted.len() as i64;
        let deleted_count = prev_kvs.len() as i64;
        Ok((
            DeleteRangeResponse {
                header: Some(self.header_gen.gen_header()),
                deleted: deleted_count,
                prev_kvs: if want_prev_kv { prev_kvs } else { Vec::new() },
            },
            events,
            next_sub,
        ))
    }

    fn check_compare(&self, cmp: &crate::rpc::Compare) -> Result<bool, ApplyError> {
        let range = KeyRange::new(cmp.key.clone(), cmp.range_end.clone());
        let kvs = self.kvs_in_range(&range, 0)?;
        Ok(if kvs.is_empty() {
            txn::compare_holds(cmp, None)
        } else {
            kvs.iter().all(|kv| txn::compare_holds(cmp, Some(kv)))
        })
    }

    /// `Txn` (§4.1 "Txn", §4.2). Sub-ops are applied sequentially against
    /// live store state — a Range sub-op sees the effects of any Put/Delete
    /// sub-op that ran earlier in the same branch (§9 "potential source
    /// bug", preserved deliberately). Each sub-op that actually mutates
    /// (a Put always does; a DeleteRange does only if it matches a live
    /// key) gets its own revision bump, the same as it would standalone —
    /// a branch of two Puts advances `current_revision` by two, not one.
    pub fn apply_txn(&self, req: TxnRequest) -> Result<(TxnResponse, Vec<Event>), ApplyError> {
        let mut succeeded = true;
        for cmp in &req.compare {
            if !self.check_compare(cmp)? {
                succeeded = false;
                break;
            }
        }
        let ops = if succeeded { &req.success } else { &req.failure };

        let mut running_revision = self.revision.get();
        let mut responses = Vec::with_capacity(ops.len());
        let mut all_events = Vec::new();
        for op in ops {
            let (response_op, events) = self.apply_request_op(op, running_revision)?;
            if !events.is_empty() {
                running_revision += 1;
            }
            all_events.extend(events);
            responses.push(response_op);
        }
        if running_revision != self.revision.get() {
            self.revision.restore(running_revision);
        }

        Ok((
            TxnResponse {
                header: Some(self.header_gen.gen_header()),
                succeeded,
                responses,
            },
            all_events,
        ))
    }

    /// Apply one `Txn` sub-op. `base_revision` is the revision the branch
    /// has committed up to so far; a mutating sub-op lands at
    /// `base_revision + 1`, mirroring `apply_put`/`apply_delete_range`'s own
    /// standalone `self.revision.get() + 1`.
    fn apply_request_op(
        &self,
        op: &RequestOp,
        base_revision: i64,
    ) -> Result<(ResponseOp, Vec<Event>), ApplyError> {
        match &op.request {
            Some(request_op::Request::RequestRange(req)) => {
                let range_response = self.range(req).map_err(ApplyError::Core)?;
                Ok((
                    ResponseOp {
                        response: Some(response_op::Response::ResponseRange(range_response)),
                    },
                    Vec::new(),
                ))
            }
            Some(request_op::Request::RequestPut(req)) => {
                let (response, events) = self.do_put(req.clone(), base_revision + 1, 0)?;
                Ok((
                    ResponseOp {
                        response: Some(response_op::Response::ResponsePut(response)),
                    },
                    events,
                ))
            }
            Some(request_op::Request::RequestDeleteRange(req)) => {
                let (response, events, _next_sub) = self.do_delete(
                    req.key.clone(),
                    req.range_end.clone(),
                    req.prev_kv,
                    base_revision + 1,
                    0,
                )?;
                Ok((
                    ResponseOp {
                        response: Some(response_op::Response::ResponseDeleteRange(response)),
                    },
                    events,
                ))
            }
            None => Err(ApplyError::Core(CoreError::TxnFailed(
                "empty request_op".to_string(),
            ))),
        }
    }

    /// Explicit `Compact(rev)` (§4.8). Validated, then best-effort triggers
    /// native store compaction and evicts index history at or below `rev`.
    pub fn compact(&self, rev: i64) -> Result<(), CoreError> {
        let current = self.revision.get();
        let compacted = self.compacted_revision.get();
        if rev <= 0 || rev > current {
            return Err(CoreError::FailedPrecondition(format!(
                "compact revision {rev} must be in (0, {current}]"
            )));
        }
        if rev <= compacted {
            return Err(CoreError::FailedPrecondition(format!(
                "revision {rev} already compacted at {compacted}"
            )));
        }
        self.compacted_revision.set(rev);
        self.index.compact(rev);
        self.db
            .commit(Vec::new(), None, Some(rev))
            .map_err(|e| CoreError::FailedPrecondition(e.to_string()))?;
        let _ = self
            .db
            .engine()
            .compact(KV_TABLE, Revision::new(rev, i64::MAX).encode().as_slice());
        Ok(())
    }

    /// Dispatch a mutating [`RequestWrapper`] produced by the Proposal
    /// Router/Batcher (§4.5/§4.6). `Range`, `LeaseGrant` and `LeaseRevoke`
    /// are not handled here: reads bypass Raft (§4.7) and lease ops are
    /// routed to the lease store (§4.3) by the caller.
    pub fn apply(
        &self,
        request: RequestWrapper,
    ) -> Result<(ResponseWrapper, Vec<Event>), ApplyError> {
        match request {
            RequestWrapper::PutRequest(req) => {
                let (response, events) = self.apply_put(req)?;
                Ok((ResponseWrapper::PutResponse(response), events))
            }
            RequestWrapper::DeleteRangeRequest(req) => {
                let (response, events) = self.apply_delete_range(req)?;
                Ok((ResponseWrapper::DeleteRangeResponse(response), events))
            }
            RequestWrapper::TxnRequest(req) => {
                let (response, events) = self.apply_txn(req)?;
                Ok((ResponseWrapper::TxnResponse(response), events))
            }
            RequestWrapper::RangeRequest(_)
            | RequestWrapper::LeaseGrantRequest(_)
            | RequestWrapper::LeaseRevokeRequest(_) => {
                unreachable!("range and lease requests are not applied through KvStore::apply")
            }
        }
    }
}

fn sort_kvs(kvs: &mut [KeyValue], target: SortTarget, order: SortOrder) {
    match (target, order) {
        (SortTarget::Key, SortOrder::None) => {}
        (SortTarget::Key, SortOrder::Ascend) => kvs.sort_by(|a, b| a.key.cmp(&b.key)),
        (SortTarget::Key, SortOrder::Descend) => kvs.sort_by(|a, b| b.key.cmp(&a.key)),
        (SortTarget::Version, SortOrder::Ascend | SortOrder::None) => {
            kvs.sort_by(|a, b| a.version.cmp(&b.version));
        }
        (SortTarget::Version, SortOrder::Descend) => kvs.sort_by(|a, b| b.version.cmp(&a.version)),
        (SortTarget::Create, SortOrder::Ascend | SortOrder::None) => {
            kvs.sort_by(|a, b| a.create_revision.cmp(&b.create_revision));
        }
        (SortTarget::Create, SortOrder::Descend) => {
            kvs.sort_by(|a, b| b.create_revision.cmp(&a.create_revision));
        }
        (SortTarget::Mod, SortOrder::Ascend | SortOrder::None) => {
            kvs.sort_by(|a, b| a.mod_revision.cmp(&b.mod_revision));
        }
        (SortTarget::Mod, SortOrder::Descend) => {
            kvs.sort_by(|a, b| b.mod_revision.cmp(&a.mod_revision));
        }
        (SortTarget::Value, SortOrder::Ascend | SortOrder::None) => {
            kvs.sort_by(|a, b| a.value.cmp(&b.value));
        }
        (SortTarget::Value, SortOrder::Descend) => kvs.sort_by(|a, b| b.value.cmp(&a.value)),
    }
}
