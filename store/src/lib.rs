//! The replicated MVCC key-value core (§1-§9 of the design). This crate
//! owns everything above the Raft Glue seam: the revisioned keyspace, lease
//! subsystem, watch fan-out, linearizable reads, and snapshotting. A
//! front-end (gRPC, HTTP, the MySQL wire protocol, ...) translates its own
//! wire format into the [`rpc`] request/response types and drives an
//! [`Engine`]; a real Raft integration implements [`raft_glue::RaftGlue`]
//! and feeds committed entries into the [`apply::ApplyLoop`] this crate
//! spawns for it.

pub mod apply;
pub mod error;
pub mod header_gen;
pub mod lease_ticker;
pub mod propose;
pub mod raft_glue;
pub mod read_path;
pub mod revision;
pub mod rpc;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod watch;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use engine::{EngineError, MemoryEngine, RocksEngine, StorageEngine, Table};
use parking_lot::RwLock;
use prost::Message;
use tokio::sync::mpsc;
use utils::config::{EngineConfig, StorageConfig};

use crate::{
    apply::ApplyLoop,
    error::{CoreError, FatalError},
    header_gen::HeaderGenerator,
    lease_ticker::LeaseTicker,
    propose::{PendingWaiters, ProposalBatcher, ProposalRouter},
    raft_glue::{CommittedEntry, RaftGlue},
    read_path::ReadPath,
    revision::{CompactedRevision, Revision},
    rpc::{
        CompactionResponse, DeleteRangeRequest, DeleteRangeResponse, KeyValue,
        LeaseGrantRequest, LeaseGrantResponse, LeaseKeepAliveResponse, LeaseRevokeRequest,
        LeaseRevokeResponse, LeaseTimeToLiveResponse, NodeState, PutRequest, PutResponse,
        RangeRequest, RangeResponse, RequestWrapper, ResponseWrapper, StatusResponse,
        TransferLeadershipResponse, TxnRequest, TxnResponse, WatchCreateRequest, WatchResponse,
    },
    snapshot::Snapshotter,
    state::State,
    storage::{
        db::{Db, KV_TABLE, TABLES},
        index::{Index, KeyRevision},
        kv_store::KvStore,
        lease_store::{LeaseCollection, LeaseStore},
    },
    watch::WatchHub,
};

/// Capacity of the channel carrying proposals from every [`ProposalRouter`]
/// caller to the single [`ProposalBatcher`] task (§4.6). Sized well above
/// the batcher's own `max_batch_size` default so a burst of concurrent
/// callers queues rather than blocks while a batch is in flight.
const PROPOSAL_CHANNEL_CAPACITY: usize = 1024;

/// Backend-erased [`StorageEngine`]: picks between [`MemoryEngine`] and
/// [`RocksEngine`] at startup based on [`StorageConfig`], so callers that
/// don't care which backend is in use can hold one concrete `Engine<E, G>`
/// type regardless of deployment. `StorageEngine`'s generic methods keep it
/// from being object-safe (`Box<dyn StorageEngine>` doesn't work here), so
/// this enum delegates by hand instead.
#[derive(Debug)]
pub enum AnyEngine {
    /// In-memory backend; state does not survive a restart.
    Memory(MemoryEngine),
    /// RocksDB-backed backend.
    RocksDb(RocksEngine),
}

impl StorageEngine for AnyEngine {
    fn get(&self, table: Table, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, EngineError> {
        match self {
            AnyEngine::Memory(e) => e.get(table, key),
            AnyEngine::RocksDb(e) => e.get(table, key),
        }
    }

    fn get_multi(
        &self,
        table: Table,
        keys: &[impl AsRef<[u8]>],
    ) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        match self {
            AnyEngine::Memory(e) => e.get_multi(table, keys),
            AnyEngine::RocksDb(e) => e.get_multi(table, keys),
        }
    }

    fn scan(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        match self {
            AnyEngine::Memory(e) => e.scan(table, start, end),
            AnyEngine::RocksDb(e) => e.scan(table, start, end),
        }
    }

    fn get_all(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        match self {
            AnyEngine::Memory(e) => e.get_all(table),
            AnyEngine::RocksDb(e) => e.get_all(table),
        }
    }

    fn write_batch(&self, ops: Vec<engine::WriteOperation<'_>>) -> Result<(), EngineError> {
        match self {
            AnyEngine::Memory(e) => e.write_batch(ops),
            AnyEngine::RocksDb(e) => e.write_batch(ops),
        }
    }

    fn reset(&self) -> Result<(), EngineError> {
        match self {
            AnyEngine::Memory(e) => e.reset(),
            AnyEngine::RocksDb(e) => e.reset(),
        }
    }

    fn compact(&self, table: Table, until_key: &[u8]) -> Result<(), EngineError> {
        match self {
            AnyEngine::Memory(e) => e.compact(table, until_key),
            AnyEngine::RocksDb(e) => e.compact(table, until_key),
        }
    }
}

/// Open the backend named by `config`.
///
/// # Errors
/// Returns an error if the RocksDB backend fails to open its data
/// directory.
pub fn open_storage(config: &StorageConfig) -> Result<AnyEngine, EngineError> {
    match config {
        StorageConfig::Memory => Ok(AnyEngine::Memory(MemoryEngine::new(TABLES))),
        StorageConfig::RocksDB { data_dir } => {
            Ok(AnyEngine::RocksDb(RocksEngine::open(data_dir, TABLES)?))
        }
    }
}

/// The facade a front-end drives: every operation in §6.1 of the design, as
/// one async method apiece, wired over the already-built store components
/// (kv store, lease store, watch hub, proposal pipeline, read path,
/// snapshotter) plus the single apply loop and lease expiry ticker this
/// constructor spawns.
#[derive(Debug)]
pub struct Engine<E, G> {
    kv_store: Arc<KvStore<E>>,
    lease_store: Arc<LeaseStore<E>>,
    watch_hub: Arc<WatchHub>,
    router: Arc<ProposalRouter>,
    read_path: Arc<ReadPath<G>>,
    snapshotter: Snapshotter<E>,
    raft: Arc<G>,
    state: Arc<State>,
    header_gen: Arc<HeaderGenerator>,
    healthy: Arc<AtomicBool>,
    _apply_handle: tokio::task::JoinHandle<()>,
    _batcher_handle: tokio::task::JoinHandle<()>,
    _ticker_handle: tokio::task::JoinHandle<()>,
}

impl<E: StorageEngine + Send + Sync + 'static, G: RaftGlue> Engine<E, G> {
    /// Build a node's store over an already-open backend and an already
    /// wired-up [`RaftGlue`], recovering local state from whatever was last
    /// persisted, then spawn the apply loop, proposal batcher and lease
    /// expiry ticker.
    ///
    /// `committed_rx` is the receiving half of whatever channel `raft`
    /// feeds committed entries into — the same one a concrete `RaftGlue`
    /// implementation would build alongside itself (cf.
    /// [`raft_glue::LocalRaftGlue::new`]).
    ///
    /// # Errors
    /// Returns [`FatalError`] if recovering persisted state from `storage`
    /// fails.
    pub fn new(
        node_id: u64,
        cluster_id: u64,
        storage: Arc<E>,
        raft: Arc<G>,
        committed_rx: mpsc::Receiver<CommittedEntry>,
        config: EngineConfig,
    ) -> Result<Self, FatalError> {
        let db = Arc::new(Db::new(storage));
        let index = Arc::new(Index::new());
        let lease_collection = Arc::new(RwLock::new(LeaseCollection::new()));
        let header_gen = Arc::new(HeaderGenerator::new(cluster_id, node_id));
        let state = Arc::new(State::default());

        let persisted_revision = db.load_revision()?;
        let persisted_compacted = db.load_compacted_revision()?;
        header_gen.revision_arc().restore(persisted_revision);
        let compacted_revision = CompactedRevision::new(persisted_compacted);

        let kv_store = Arc::new(KvStore::new(
            Arc::clone(&db),
            Arc::clone(&index),
            Arc::clone(&lease_collection),
            Arc::clone(&compacted_revision),
            Arc::clone(&header_gen),
        ));
        let lease_store = Arc::new(LeaseStore::new(
            lease_collection,
            Arc::clone(&db),
            Arc::clone(&index),
            Arc::clone(&state),
            Arc::clone(&header_gen),
        ));
        recover_local_state(&db, &index, &lease_store)?;

        let watch_hub = WatchHub::new(
            Arc::clone(&header_gen),
            *config.watch_channel_size(),
            *config.timeout().watch_send_timeout(),
        );

        let waiters = PendingWaiters::new();
        let pending_depth = Arc::new(AtomicUsize::new(0));
        let (batch_tx, batch_rx) = mpsc::channel(PROPOSAL_CHANNEL_CAPACITY);
        let router = Arc::new(ProposalRouter::new(
            node_id,
            Arc::clone(&state),
            config.timeout().clone(),
            batch_tx,
            Arc::clone(&pending_depth),
            Arc::clone(&waiters),
        ));
        let batcher = ProposalBatcher::new(
            batch_rx,
            Arc::clone(&raft),
            Arc::clone(&waiters),
            pending_depth,
            config.batch().clone(),
        );
        let batcher_handle = batcher.spawn();

        let apply_loop = ApplyLoop::new(
            committed_rx,
            Arc::clone(&kv_store),
            Arc::clone(&lease_store),
            Arc::clone(&watch_hub),
            waiters,
            Arc::clone(&raft),
        );
        let healthy = apply_loop.healthy_flag();
        let apply_handle = apply_loop.spawn();

        let read_path = Arc::new(ReadPath::new(
            Arc::clone(&state),
            Arc::clone(&raft),
            config.read_path().clone(),
        ));

        let ticker = LeaseTicker::new(
            Arc::clone(&lease_store),
            Arc::clone(&router),
            Arc::clone(&state),
            *config.lease().max_ticker_interval(),
        );
        let ticker_handle = ticker.spawn();

        let snapshotter = Snapshotter::new(
            Arc::clone(&db),
            Arc::clone(&index),
            Arc::clone(&kv_store),
            Arc::clone(&lease_store),
            header_gen.revision_arc(),
            compacted_revision,
            *config.snapshot().chunk_size(),
        );

        Ok(Self {
            kv_store,
            lease_store,
            watch_hub,
            router,
            read_path,
            snapshotter,
            raft,
            state,
            header_gen,
            healthy,
            _apply_handle: apply_handle,
            _batcher_handle: batcher_handle,
            _ticker_handle: ticker_handle,
        })
    }

    /// `Range` (§6.1): a linearizable read, gated on the read path so it
    /// reflects every mutation ordered before it arrived.
    ///
    /// # Errors
    /// [`CoreError::NotLeader`] off the leader, [`CoreError::Compacted`] for
    /// a historical read at or below the compacted revision, or
    /// [`CoreError::Unavailable`] if the read-index fallback times out.
    pub async fn range(&self, req: RangeRequest) -> Result<RangeResponse, CoreError> {
        self.read_path.linearize().await?;
        self.kv_store.range(&req)
    }

    /// `Put` (§6.1): goes through Raft.
    ///
    /// # Errors
    /// See [`ProposalRouter::propose`]; additionally
    /// [`CoreError::LeaseNotFound`] if `req.lease` is non-zero and unknown.
    pub async fn put(&self, req: PutRequest) -> Result<PutResponse, CoreError> {
        match self.router.propose(RequestWrapper::PutRequest(req)).await? {
            ResponseWrapper::PutResponse(resp) => Ok(resp),
            other => unreachable!("Put proposal resolved to {other:?}"),
        }
    }

    /// `DeleteRange` (§6.1): goes through Raft.
    ///
    /// # Errors
    /// See [`ProposalRouter::propose`].
    pub async fn delete_range(
        &self,
        req: DeleteRangeRequest,
    ) -> Result<DeleteRangeResponse, CoreError> {
        match self
            .router
            .propose(RequestWrapper::DeleteRangeRequest(req))
            .await?
        {
            ResponseWrapper::DeleteRangeResponse(resp) => Ok(resp),
            other => unreachable!("DeleteRange proposal resolved to {other:?}"),
        }
    }

    /// `Txn` (§6.1): goes through Raft, applied atomically.
    ///
    /// # Errors
    /// See [`ProposalRouter::propose`]; additionally
    /// [`CoreError::TxnFailed`] if a branch sub-operation is malformed.
    pub async fn txn(&self, req: TxnRequest) -> Result<TxnResponse, CoreError> {
        match self.router.propose(RequestWrapper::TxnRequest(req)).await? {
            ResponseWrapper::TxnResponse(resp) => Ok(resp),
            other => unreachable!("Txn proposal resolved to {other:?}"),
        }
    }

    /// `LeaseGrant` (§6.1): goes through Raft so every node allocates the
    /// same id for an `id == 0` request.
    ///
    /// # Errors
    /// See [`ProposalRouter::propose`].
    pub async fn lease_grant(
        &self,
        req: LeaseGrantRequest,
    ) -> Result<LeaseGrantResponse, CoreError> {
        match self
            .router
            .propose(RequestWrapper::LeaseGrantRequest(req))
            .await?
        {
            ResponseWrapper::LeaseGrantResponse(resp) => Ok(resp),
            other => unreachable!("LeaseGrant proposal resolved to {other:?}"),
        }
    }

    /// `LeaseRevoke` (§6.1): goes through Raft; idempotent.
    ///
    /// # Errors
    /// See [`ProposalRouter::propose`].
    pub async fn lease_revoke(
        &self,
        req: LeaseRevokeRequest,
    ) -> Result<LeaseRevokeResponse, CoreError> {
        match self
            .router
            .propose(RequestWrapper::LeaseRevokeRequest(req))
            .await?
        {
            ResponseWrapper::LeaseRevokeResponse(resp) => Ok(resp),
            other => unreachable!("LeaseRevoke proposal resolved to {other:?}"),
        }
    }

    /// `LeaseRenew` (§6.1): leader-local (§4.3), bypasses Raft entirely.
    ///
    /// # Errors
    /// [`CoreError::NotLeader`] off the leader, [`CoreError::NotFound`] for
    /// an unknown lease id.
    pub fn lease_renew(&self, lease_id: i64) -> Result<LeaseKeepAliveResponse, CoreError> {
        let ttl = self.lease_store.keep_alive(lease_id)?;
        Ok(LeaseKeepAliveResponse {
            header: Some(self.header_gen.gen_header()),
            id: lease_id,
            ttl,
        })
    }

    /// `LeaseTimeToLive` (§6.1): a local read of this node's lease
    /// bookkeeping.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] for an unknown lease id.
    pub fn lease_time_to_live(
        &self,
        lease_id: i64,
        include_keys: bool,
    ) -> Result<LeaseTimeToLiveResponse, CoreError> {
        self.lease_store.time_to_live(lease_id, include_keys)
    }

    /// `Watch` (§6.1): resolves `start_revision` against the current and
    /// compacted revisions and, if a catch-up is needed, supplies the Watch
    /// Hub with whatever currently-live keys fall in range before
    /// registering the subscription (§9 "historical watch synthesis", see
    /// DESIGN.md).
    ///
    /// # Errors
    /// [`CoreError::Compacted`] if `start_revision` is at or below the
    /// compacted revision, or [`CoreError::AlreadyExists`] if the caller
    /// requested a `watch_id` already in use.
    pub fn watch(
        &self,
        req: WatchCreateRequest,
    ) -> Result<(i64, mpsc::Receiver<WatchResponse>), CoreError> {
        let initial_kvs = if req.start_revision > 0 {
            let compacted = self.kv_store.compacted_revision().get();
            if req.start_revision <= compacted {
                return Err(CoreError::Compacted {
                    requested: req.start_revision,
                    compacted,
                });
            }
            self.kv_store
                .range(&RangeRequest {
                    key: req.key.clone(),
                    range_end: req.range_end.clone(),
                    limit: 0,
                    revision: 0,
                    sort_order: 0,
                    sort_target: 0,
                    count_only: false,
                    keys_only: false,
                })?
                .kvs
        } else {
            Vec::new()
        };
        self.watch_hub.subscribe(req, initial_kvs)
    }

    /// `CancelWatch` (§6.1): idempotent — cancelling an already-cancelled
    /// or never-existent `watch_id` is a no-op success, not an error.
    pub fn cancel_watch(&self, watch_id: i64) -> Result<(), CoreError> {
        self.watch_hub.cancel(watch_id, "client requested cancellation")
    }

    /// `Compact` (§6.1): validated, then best-effort triggers native store
    /// compaction. Not itself proposed through Raft — every node compacts
    /// independently once it has seen the same `revision` committed, which
    /// a front-end typically drives by broadcasting the same `Compact` call
    /// cluster-wide rather than routing it through this core.
    ///
    /// # Errors
    /// [`CoreError::FailedPrecondition`] if `revision` is out of bounds or
    /// already compacted.
    pub fn compact(&self, revision: i64) -> Result<CompactionResponse, CoreError> {
        self.kv_store.compact(revision)?;
        Ok(CompactionResponse {
            header: Some(self.header_gen.gen_header()),
        })
    }

    /// `GetSnapshot` (§6.1): the full live keyspace and lease state,
    /// chunked for streaming.
    ///
    /// # Errors
    /// Returns [`FatalError`] if the underlying range read fails.
    pub fn get_snapshot(&self) -> Result<Vec<rpc::SnapshotChunk>, FatalError> {
        self.snapshotter.take()
    }

    /// Install a snapshot a real Raft integration delivered to catch this
    /// node up (e.g. after it fell too far behind for log replication
    /// alone). Not itself one of §6.1's client-facing operations — the
    /// Raft Glue layer calls this directly once it has reassembled a full
    /// `SnapshotChunk` sequence.
    ///
    /// # Errors
    /// Returns [`FatalError`] if the local engine reset/write fails or the
    /// chunks don't reassemble into a valid manifest.
    pub fn install_snapshot(&self, chunks: &[rpc::SnapshotChunk]) -> Result<(), FatalError> {
        self.snapshotter.restore(chunks)
    }

    /// `Status` (§6.1): a thin passthrough over the Raft Glue layer's own
    /// view of node identity and progress.
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            header: Some(self.header_gen.gen_header()),
            node_id: self.raft.node_id(),
            leader_id: self.raft.leader_id(),
            state: if self.raft.is_leader() {
                NodeState::Leader as i32
            } else {
                NodeState::Follower as i32
            },
            applied_index: self.raft.applied_index(),
            commit_index: self.raft.commit_index(),
        }
    }

    /// `TransferLeadership` (§6.1): leader-only, a thin passthrough to the
    /// Raft Glue layer.
    ///
    /// # Errors
    /// [`CoreError::NotLeader`] if this node is not the current leader.
    pub async fn transfer_leadership(
        &self,
        target_id: u64,
    ) -> Result<TransferLeadershipResponse, CoreError> {
        self.raft.transfer_leadership(target_id).await?;
        Ok(TransferLeadershipResponse {
            header: Some(self.header_gen.gen_header()),
        })
    }

    /// Whether the apply loop is still running. A real front-end should
    /// stop accepting new writes (and let a load balancer route around
    /// this node) once this goes false (§7 "Apply-time errors that are not
    /// user-visible").
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record a Raft soft-state change (leadership, term). The Raft Glue
    /// layer calls this whenever a `Ready` batch reports one.
    pub fn report_soft_state(&self, leader_id: u64, term: u64, is_leader: bool) {
        self.state.update(leader_id, term, is_leader);
        self.header_gen.update_term(term);
        if !is_leader {
            self.read_path.clear_lease();
        }
    }

    /// Record a quorum-confirmed heartbeat round, extending the window in
    /// which the Read Path's leader-lease fast path (§4.7) can be trusted.
    /// The Raft Glue layer calls this once per confirmed heartbeat round.
    pub fn confirm_leader_lease(&self) {
        self.read_path.confirm_leadership();
    }
}

/// Rebuild the in-memory [`Index`] and lease bindings from whatever was
/// last persisted, replaying `KV_TABLE` in revision order (§9 "Polymorphic
/// backend": the index itself is never persisted). Lease records
/// themselves are recovered by [`LeaseStore::recover`]; this function
/// re-attaches each live key to its lease afterward, mirroring the
/// snapshotter's restore path (`snapshot.rs`).
fn recover_local_state<E: StorageEngine>(
    db: &Db<E>,
    index: &Index,
    lease_store: &LeaseStore<E>,
) -> Result<(), FatalError> {
    lease_store.recover()?;
    let collection = lease_store.collection();
    for (key_bytes, value_bytes) in db.engine().get_all(KV_TABLE)? {
        let revision = Revision::decode(&key_bytes);
        let kv = KeyValue::decode(value_bytes.as_slice())
            .map_err(|e| FatalError::Decode(e.to_string()))?;
        let is_tombstone = kv.is_tombstone();
        index.restore_entry(
            kv.key.clone(),
            KeyRevision {
                revision,
                create_revision: kv.create_revision,
                mod_revision: kv.mod_revision,
                version: kv.version,
            },
        );
        if kv.lease != 0 && !is_tombstone {
            let _ignore = collection.write().attach(kv.lease, kv.key.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use engine::MemoryEngine;

    use super::*;
    use crate::raft_glue::LocalRaftGlue;

    fn wire_up() -> (Engine<MemoryEngine, LocalRaftGlue>, Arc<LocalRaftGlue>) {
        let storage = Arc::new(MemoryEngine::new(TABLES));
        let (glue, committed_rx) = LocalRaftGlue::new(1, 64);
        let glue = Arc::new(glue);
        let engine = Engine::new(1, 1, storage, Arc::clone(&glue), committed_rx, EngineConfig::default())
            .expect("fresh store recovers cleanly");
        (engine, glue)
    }

    #[tokio::test]
    async fn put_then_range_observes_the_write() {
        let (engine, _glue) = wire_up();
        engine
            .put(PutRequest {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                lease: 0,
                prev_kv: false,
                ignore_value: false,
                ignore_lease: false,
            })
            .await
            .unwrap();

        let resp = engine
            .range(RangeRequest {
                key: b"k".to_vec(),
                range_end: Vec::new(),
                limit: 0,
                revision: 0,
                sort_order: 0,
                sort_target: 0,
                count_only: false,
                keys_only: false,
            })
            .await
            .unwrap();
        assert_eq!(resp.kvs.len(), 1);
        assert_eq!(resp.kvs[0].value, b"v");
    }

    #[tokio::test]
    async fn a_lease_bound_key_is_deleted_and_watchers_are_notified_on_expiry() {
        let (engine, _glue) = wire_up();
        let grant = engine
            .lease_grant(LeaseGrantRequest { ttl: 0, id: 0 })
            .await
            .unwrap();

        let (_watch_id, mut watch_rx) = engine
            .watch(WatchCreateRequest {
                key: b"k".to_vec(),
                range_end: Vec::new(),
                start_revision: 0,
                progress_notify: false,
                filters: Vec::new(),
                prev_kv: false,
                watch_id: 0,
                fragment: false,
            })
            .unwrap();
        let _created = watch_rx.recv().await.unwrap();

        engine
            .put(PutRequest {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                lease: grant.id,
                prev_kv: false,
                ignore_value: false,
                ignore_lease: false,
            })
            .await
            .unwrap();
        let put_event = tokio::time::timeout(Duration::from_secs(1), watch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(put_event.events[0].r#type, crate::rpc::EventType::Put as i32);

        let delete_event = tokio::time::timeout(Duration::from_secs(3), watch_rx.recv())
            .await
            .expect("lease expiry should delete the bound key")
            .unwrap();
        assert_eq!(
            delete_event.events[0].r#type,
            crate::rpc::EventType::Delete as i32
        );

        let resp = engine
            .range(RangeRequest {
                key: b"k".to_vec(),
                range_end: Vec::new(),
                limit: 0,
                revision: 0,
                sort_order: 0,
                sort_target: 0,
                count_only: false,
                keys_only: false,
            })
            .await
            .unwrap();
        assert!(resp.kvs.is_empty());
    }

    #[tokio::test]
    async fn status_reports_this_node_as_leader() {
        let (engine, _glue) = wire_up();
        let status = engine.status();
        assert_eq!(status.node_id, 1);
        assert_eq!(status.state, NodeState::Leader as i32);
        assert!(engine.is_healthy());
    }
}
