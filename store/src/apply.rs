//! The apply loop (§5 "single-writer discipline"): the one task that drains
//! committed entries from the Raft Glue layer, in commit order, and is the
//! only thing ever allowed to mutate the local store. Everything else in
//! this crate reads state concurrently or waits on this loop's output.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use engine::StorageEngine;
use tokio::sync::mpsc;

use crate::{
    error::{ApplyError, CoreError, FatalError},
    propose::{decode_entry, DecodedEntry, PendingWaiters},
    raft_glue::{CommittedEntry, RaftGlue},
    rpc::{raft_operation, Event, PutRequest, RaftOperation, ResponseWrapper},
    storage::{kv_store::KvStore, lease_store::LeaseStore},
    watch::WatchHub,
};

/// Drains [`CommittedEntry`] values and applies each one's operation(s)
/// against the local store, publishing produced events to the Watch Hub and
/// waking up whichever `ProposalRouter` waiter is waiting on it.
#[derive(Debug)]
pub struct ApplyLoop<E, G> {
    committed_rx: mpsc::Receiver<CommittedEntry>,
    kv_store: Arc<KvStore<E>>,
    lease_store: Arc<LeaseStore<E>>,
    watch_hub: Arc<WatchHub>,
    waiters: Arc<PendingWaiters>,
    raft: Arc<G>,
    healthy: Arc<AtomicBool>,
}

impl<E: StorageEngine + 'static, G: RaftGlue> ApplyLoop<E, G> {
    /// Build an apply loop over the already-wired store components.
    pub fn new(
        committed_rx: mpsc::Receiver<CommittedEntry>,
        kv_store: Arc<KvStore<E>>,
        lease_store: Arc<LeaseStore<E>>,
        watch_hub: Arc<WatchHub>,
        waiters: Arc<PendingWaiters>,
        raft: Arc<G>,
    ) -> Self {
        Self {
            committed_rx,
            kv_store,
            lease_store,
            watch_hub,
            waiters,
            raft,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shared flag the `Engine` facade polls to report node health (§7
    /// "Apply-time errors that are not user-visible" — once this flips
    /// false the node has stopped applying and should refuse new writes).
    pub fn healthy_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.healthy)
    }

    /// Spawn the loop as its own task. There must be exactly one of these
    /// running per node (§5).
    pub fn spawn(self) -> tokio::task::JoinHandle<()>
    where
        E: Send + Sync,
        G: Send + Sync,
    {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(entry) = self.committed_rx.recv().await {
            let outcome = match decode_entry(&entry.payload) {
                Ok(DecodedEntry::Single(op)) => self.apply_one(op),
                Ok(DecodedEntry::Batch(batch)) => {
                    let mut result = Ok(());
                    for op in batch.ops {
                        result = self.apply_one(op);
                        if result.is_err() {
                            break;
                        }
                    }
                    result
                }
                Err(err) => Err(FatalError::Decode(err.to_string())),
            };
            if let Err(fatal) = outcome {
                tracing::error!(error = %fatal, "fatal error in apply loop; stopping");
                self.healthy.store(false, Ordering::Release);
                return;
            }
            self.raft.mark_applied(entry.index);
        }
    }

    /// Apply one logged operation. A `CoreError` is a user-visible,
    /// per-operation failure: it is routed to whichever waiter proposed
    /// this operation and the loop keeps going. Only a `FatalError`
    /// propagates out and stops the loop.
    fn apply_one(&self, op: RaftOperation) -> Result<(), FatalError> {
        let seq_num = op.seq_num.clone();
        match self.dispatch(op) {
            Ok((response, events)) => {
                if !events.is_empty() {
                    self.watch_hub.publish(&events);
                }
                if !seq_num.is_empty() {
                    self.waiters.resolve(&seq_num, Ok(response));
                }
                Ok(())
            }
            Err(ApplyError::Core(core_err)) => {
                if !seq_num.is_empty() {
                    self.waiters.resolve(&seq_num, Err(core_err));
                }
                Ok(())
            }
            Err(ApplyError::Fatal(fatal)) => Err(fatal),
        }
    }

    fn dispatch(&self, op: RaftOperation) -> Result<(ResponseWrapper, Vec<Event>), ApplyError> {
        match op.op {
            Some(raft_operation::Op::Put(req)) => {
                let (response, events) = self.kv_store.apply_put(req)?;
                Ok((ResponseWrapper::PutResponse(response), events))
            }
            Some(raft_operation::Op::Delete(req)) => {
                let (response, events) = self.kv_store.apply_delete_range(req)?;
                Ok((ResponseWrapper::DeleteRangeResponse(response), events))
            }
            Some(raft_operation::Op::Txn(req)) => {
                let (response, events) = self.kv_store.apply_txn(req)?;
                Ok((ResponseWrapper::TxnResponse(response), events))
            }
            Some(raft_operation::Op::LeaseGrant(req)) => {
                let response = self.lease_store.apply_grant(req.id, req.ttl)?;
                Ok((ResponseWrapper::LeaseGrantResponse(response), Vec::new()))
            }
            Some(raft_operation::Op::LeaseRevoke(req)) => {
                let (response, events) = self.lease_store.apply_revoke(req.id)?;
                Ok((ResponseWrapper::LeaseRevokeResponse(response), events))
            }
            Some(raft_operation::Op::Legacy(legacy)) => {
                // The two-field legacy wire form (§6.2): an unconditional
                // Put with no lease and no prev-kv echo.
                let (response, events) = self.kv_store.apply_put(PutRequest {
                    key: legacy.key,
                    value: legacy.value,
                    lease: 0,
                    prev_kv: false,
                    ignore_value: false,
                    ignore_lease: false,
                })?;
                Ok((ResponseWrapper::PutResponse(response), events))
            }
            None => Err(ApplyError::Core(CoreError::TxnFailed(
                "empty raft operation".to_string(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use engine::MemoryEngine;
    use parking_lot::RwLock;

    use super::*;
    use crate::{
        header_gen::HeaderGenerator,
        raft_glue::LocalRaftGlue,
        revision::CompactedRevision,
        rpc::RequestWrapper,
        state::State,
        storage::{
            db::{Db, TABLES},
            index::Index,
            lease_store::LeaseCollection,
        },
    };

    #[tokio::test]
    async fn applying_a_put_publishes_an_event_and_resolves_the_waiter() {
        let engine = Arc::new(MemoryEngine::new(TABLES));
        let db = Arc::new(Db::new(engine));
        let index = Arc::new(Index::new());
        let lease_collection = Arc::new(RwLock::new(LeaseCollection::new()));
        let header_gen = Arc::new(HeaderGenerator::new(1, 1));
        let state = Arc::new(State::default());
        state.update(1, 1, true);

        let kv_store = Arc::new(KvStore::new(
            Arc::clone(&db),
            Arc::clone(&index),
            Arc::clone(&lease_collection),
            CompactedRevision::new(0),
            Arc::clone(&header_gen),
        ));
        let lease_store = Arc::new(LeaseStore::new(
            lease_collection,
            db,
            index,
            state,
            header_gen,
        ));
        let watch_hub = WatchHub::new(
            Arc::new(HeaderGenerator::new(1, 1)),
            16,
            std::time::Duration::from_secs(1),
        );
        let waiters = PendingWaiters::new();
        let (glue, committed_rx) = LocalRaftGlue::new(1, 16);
        let glue = Arc::new(glue);

        let (watch_id, mut watch_rx) = watch_hub
            .subscribe(
                crate::rpc::WatchCreateRequest {
                    key: b"k".to_vec(),
                    range_end: Vec::new(),
                    start_revision: 0,
                    progress_notify: false,
                    filters: Vec::new(),
                    prev_kv: false,
                    watch_id: 0,
                    fragment: false,
                },
                Vec::new(),
            )
            .unwrap();
        let _created = watch_rx.recv().await.unwrap();

        let apply_loop = ApplyLoop::new(
            committed_rx,
            kv_store,
            lease_store,
            Arc::clone(&watch_hub),
            Arc::clone(&waiters),
            Arc::clone(&glue),
        );

        let request = RequestWrapper::PutRequest(PutRequest {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            lease: 0,
            prev_kv: false,
            ignore_value: false,
            ignore_lease: false,
        });
        let op = RaftOperation::from_request("1-1".to_string(), request);
        let payload = crate::propose::encode_single(&op);
        glue.propose(payload).await.unwrap();

        let healthy = apply_loop.healthy_flag();
        let handle = apply_loop.spawn();

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), watch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.watch_id, watch_id);
        assert_eq!(delivered.events.len(), 1);
        assert_eq!(delivered.events[0].kv.as_ref().unwrap().value, b"v");

        handle.abort();
        assert!(healthy.load(Ordering::Acquire));
    }
}
