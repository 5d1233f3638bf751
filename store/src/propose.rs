//! Proposal Router (§4.5) and Proposal Batcher (§4.6): the path a mutating
//! operation takes from an `Engine` method call to a committed, applied
//! entry and back to the caller.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use prost::Message;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::{
    error::CoreError,
    raft_glue::RaftGlue,
    rpc::{raft_operation, RaftOperation, RaftOperationBatch, RequestWrapper, ResponseWrapper},
    state::State,
};
use utils::config::{BatchConfig, TimeoutConfig};

/// First byte of a committed entry's payload (§6.2): distinguishes the
/// primary single-op form, a batch envelope, and the legacy two-field form
/// kept for backward compatibility during upgrades.
const TAG_SINGLE: u8 = 0;
const TAG_BATCH: u8 = 1;
const TAG_LEGACY: u8 = 2;

/// A decoded committed-entry payload, ready for the apply loop to dispatch.
#[derive(Debug)]
pub enum DecodedEntry {
    /// One `RaftOperation` (possibly carrying a `seq_num` to wake a waiter).
    Single(RaftOperation),
    /// A batch produced by the [`ProposalBatcher`]; each contained op still
    /// produces its own revision (§9 "batched proposals and revisions").
    Batch(RaftOperationBatch),
}

/// Encode a single op as a committed-entry payload.
pub fn encode_single(op: &RaftOperation) -> Vec<u8> {
    let mut buf = Vec::with_capacity(op.encoded_len() + 1);
    buf.push(TAG_SINGLE);
    op.encode(&mut buf).expect("buffer has reserved capacity");
    buf
}

/// Encode a batch as a committed-entry payload.
pub fn encode_batch(batch: &RaftOperationBatch) -> Vec<u8> {
    let mut buf = Vec::with_capacity(batch.encoded_len() + 1);
    buf.push(TAG_BATCH);
    batch.encode(&mut buf).expect("buffer has reserved capacity");
    buf
}

/// Decode a committed-entry payload produced by [`encode_single`],
/// [`encode_batch`], or a legacy two-field writer.
///
/// # Errors
/// Returns an error if the tag byte is unrecognized or the payload fails to
/// decode as the type the tag names.
pub fn decode_entry(bytes: &[u8]) -> Result<DecodedEntry, prost::DecodeError> {
    let (&tag, rest) = bytes
        .split_first()
        .ok_or_else(|| prost::DecodeError::new("empty committed-entry payload"))?;
    match tag {
        TAG_SINGLE => Ok(DecodedEntry::Single(RaftOperation::decode(rest)?)),
        TAG_BATCH => Ok(DecodedEntry::Batch(RaftOperationBatch::decode(rest)?)),
        TAG_LEGACY => {
            let legacy = crate::rpc::LegacyLogEntry::decode(rest)?;
            Ok(DecodedEntry::Single(RaftOperation {
                seq_num: String::new(),
                op: Some(raft_operation::Op::Legacy(legacy)),
            }))
        }
        other => Err(prost::DecodeError::new(format!(
            "unrecognized committed-entry tag {other}"
        ))),
    }
}

impl RaftOperation {
    /// Wrap a mutating [`RequestWrapper`] for replication, tagged with
    /// `seq_num` so the apply loop can wake the waiter that proposed it.
    ///
    /// # Panics
    /// Panics if given a `RangeRequest` — reads never go through Raft
    /// (§4.7), so the Proposal Router never constructs one of these for a
    /// range.
    pub fn from_request(seq_num: String, request: RequestWrapper) -> Self {
        let op = match request {
            RequestWrapper::PutRequest(r) => raft_operation::Op::Put(r),
            RequestWrapper::DeleteRangeRequest(r) => raft_operation::Op::Delete(r),
            RequestWrapper::TxnRequest(r) => raft_operation::Op::Txn(r),
            RequestWrapper::LeaseGrantRequest(r) => raft_operation::Op::LeaseGrant(r),
            RequestWrapper::LeaseRevokeRequest(r) => raft_operation::Op::LeaseRevoke(r),
            RequestWrapper::RangeRequest(_) => {
                unreachable!("Range requests bypass Raft and are never proposed")
            }
        };
        Self {
            seq_num,
            op: Some(op),
        }
    }
}

/// One outstanding proposal's wakeup slot: the apply loop sends the applied
/// result (or a fatal-adjacent per-op error) here once it finishes applying
/// the entry carrying this `seq_num`.
type Waiter = oneshot::Sender<Result<ResponseWrapper, CoreError>>;

/// The pending-proposals map (§5 "Shared state and its guards"): a coarse
/// mutex held only for insert/remove/lookup, shared between the
/// [`ProposalRouter`] (insert, remove-on-timeout) and the apply loop
/// (remove-on-completion).
#[derive(Debug, Default)]
pub struct PendingWaiters {
    inner: Mutex<HashMap<String, Waiter>>,
}

impl PendingWaiters {
    /// An empty map.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, seq_num: String, waiter: Waiter) {
        let _ignore = self.inner.lock().insert(seq_num, waiter);
    }

    fn remove(&self, seq_num: &str) -> Option<Waiter> {
        self.inner.lock().remove(seq_num)
    }

    /// Called by the apply loop once an op with this `seq_num` has been
    /// applied; wakes the router's waiter with the op's result. A missing
    /// entry (already timed out, or a legacy/no-seq_num entry) is silently
    /// ignored.
    pub fn resolve(&self, seq_num: &str, result: Result<ResponseWrapper, CoreError>) {
        if let Some(waiter) = self.remove(seq_num) {
            let _ignore = waiter.send(result);
        }
    }

    /// Called by the [`ProposalBatcher`] when a whole batch fails to reach
    /// Raft — every op in the batch fails fast instead of waiting out its
    /// full commit-wait deadline.
    fn fail_all(&self, seq_nums: impl IntoIterator<Item = String>, err: CoreError) {
        for seq_num in seq_nums {
            if let Some(waiter) = self.remove(&seq_num) {
                let _ignore = waiter.send(Err(err.clone()));
            }
        }
    }
}

/// The Proposal Router (§4.5): turns a mutating `Engine` call into a
/// sequenced, replicated proposal and blocks the caller until the Apply
/// Engine has processed the resulting committed entry.
#[derive(Debug)]
pub struct ProposalRouter {
    node_id: u64,
    seq: AtomicU64,
    waiters: Arc<PendingWaiters>,
    batch_tx: mpsc::Sender<RaftOperation>,
    pending_depth: Arc<AtomicUsize>,
    state: Arc<State>,
    timeout: TimeoutConfig,
}

impl ProposalRouter {
    /// Build a router that feeds the given batcher input channel, sharing
    /// `waiters` and `pending_depth` with the [`ProposalBatcher`] reading
    /// from the other end.
    pub fn new(
        node_id: u64,
        state: Arc<State>,
        timeout: TimeoutConfig,
        batch_tx: mpsc::Sender<RaftOperation>,
        pending_depth: Arc<AtomicUsize>,
        waiters: Arc<PendingWaiters>,
    ) -> Self {
        Self {
            node_id,
            seq: AtomicU64::new(0),
            waiters,
            batch_tx,
            pending_depth,
            state,
            timeout,
        }
    }

    /// Propose `request` and wait for it to be applied (§4.5 steps 1-4).
    /// Fails fast with [`CoreError::NotLeader`] without touching the
    /// sequence counter or batcher channel if this node isn't the leader.
    ///
    /// # Errors
    /// [`CoreError::NotLeader`], [`CoreError::DeadlineExceeded`] (either
    /// deadline expired), or [`CoreError::Unavailable`] (batcher channel
    /// closed).
    pub async fn propose(&self, request: RequestWrapper) -> Result<ResponseWrapper, CoreError> {
        self.propose_cancellable(request, None).await
    }

    /// As [`Self::propose`], but also races a caller cancellation signal.
    /// A cancellation delivered after the proposal has already been sent
    /// to the batcher still returns [`CoreError::Cancelled`] to the caller
    /// even though the mutation may still commit and apply (§5
    /// "Cancellation": an acceptable at-most-once-outcome policy).
    ///
    /// # Errors
    /// See [`Self::propose`]; additionally returns
    /// [`CoreError::Cancelled`] if `cancel` resolves first.
    pub async fn propose_cancellable(
        &self,
        request: RequestWrapper,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<ResponseWrapper, CoreError> {
        if !self.state.is_leader() {
            return Err(CoreError::NotLeader(Some(self.state.leader_id())));
        }
        let seq_num = format!(
            "{}-{}",
            self.node_id,
            self.seq.fetch_add(1, Ordering::AcqRel)
        );
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(seq_num.clone(), tx);
        self.pending_depth.fetch_add(1, Ordering::AcqRel);

        let op = RaftOperation::from_request(seq_num.clone(), request);
        let submit = tokio::time::timeout(
            *self.timeout.propose_timeout(),
            self.batch_tx.send(op),
        )
        .await;
        match submit {
            Err(_elapsed) => {
                let _ignore = self.waiters.remove(&seq_num);
                return Err(CoreError::DeadlineExceeded(format!(
                    "proposal submission for {seq_num}"
                )));
            }
            Ok(Err(_closed)) => {
                let _ignore = self.waiters.remove(&seq_num);
                return Err(CoreError::Unavailable {
                    requested: 0,
                    applied: 0,
                });
            }
            Ok(Ok(())) => {}
        }

        match cancel {
            None => self.await_commit(&seq_num, rx).await,
            Some(cancel_rx) => {
                tokio::select! {
                    outcome = self.await_commit(&seq_num, rx) => outcome,
                    _ = cancel_rx => {
                        let _ignore = self.waiters.remove(&seq_num);
                        Err(CoreError::Cancelled(seq_num))
                    }
                }
            }
        }
    }

    async fn await_commit(
        &self,
        seq_num: &str,
        rx: oneshot::Receiver<Result<ResponseWrapper, CoreError>>,
    ) -> Result<ResponseWrapper, CoreError> {
        match tokio::time::timeout(*self.timeout.commit_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_dropped)) => Err(CoreError::Cancelled(seq_num.to_owned())),
            Err(_elapsed) => {
                let _ignore = self.waiters.remove(seq_num);
                Err(CoreError::DeadlineExceeded(format!(
                    "commit wait for {seq_num}"
                )))
            }
        }
    }
}

/// The Proposal Batcher (§4.6): a single task draining the router's output
/// channel and grouping concurrent proposals into one Raft entry, with
/// batch size and flush timeout scaled between the configured bounds by
/// observed queue depth relative to `load_threshold`.
#[derive(Debug)]
pub struct ProposalBatcher<G> {
    rx: mpsc::Receiver<RaftOperation>,
    raft: Arc<G>,
    waiters: Arc<PendingWaiters>,
    pending_depth: Arc<AtomicUsize>,
    config: BatchConfig,
}

impl<G: RaftGlue> ProposalBatcher<G> {
    /// Build a batcher draining `rx`, submitting flushed batches to `raft`.
    pub fn new(
        rx: mpsc::Receiver<RaftOperation>,
        raft: Arc<G>,
        waiters: Arc<PendingWaiters>,
        pending_depth: Arc<AtomicUsize>,
        config: BatchConfig,
    ) -> Self {
        Self {
            rx,
            raft,
            waiters,
            pending_depth,
            config,
        }
    }

    /// Spawn the batcher's drain loop as a background task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            self.pending_depth.fetch_sub(1, Ordering::AcqRel);
            let depth = self.pending_depth.load(Ordering::Acquire);
            let (batch_size, flush_timeout) = self.sizing_for(depth);

            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + flush_timeout;
            while batch.len() < batch_size {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::select! {
                    biased;
                    maybe = self.rx.recv() => match maybe {
                        Some(op) => {
                            self.pending_depth.fetch_sub(1, Ordering::AcqRel);
                            batch.push(op);
                        }
                        None => break,
                    },
                    () = tokio::time::sleep(remaining) => break,
                }
            }
            self.flush(batch).await;
        }
    }

    /// Linearly interpolate `(batch_size, flush_timeout)` between the
    /// configured min/max bounds by how far `depth` is past `0` relative to
    /// `load_threshold` — heavier load yields bigger batches and shorter
    /// flush timeouts, trading a little latency for throughput.
    fn sizing_for(&self, depth: usize) -> (usize, Duration) {
        let threshold = (*self.config.load_threshold()).max(1) as f64;
        let ratio = (depth as f64 / threshold).min(1.0);

        let min_size = *self.config.min_batch_size() as f64;
        let max_size = *self.config.max_batch_size() as f64;
        let batch_size = (min_size + (max_size - min_size) * ratio).round() as usize;

        let min_to = *self.config.min_flush_timeout();
        let max_to = *self.config.max_flush_timeout();
        let flush_timeout = max_to.saturating_sub(
            max_to
                .saturating_sub(min_to)
                .mul_f64(ratio),
        );
        (batch_size.max(1), flush_timeout)
    }

    async fn flush(&self, batch: Vec<RaftOperation>) {
        let payload = if batch.len() == 1 {
            encode_single(&batch[0])
        } else {
            encode_batch(&RaftOperationBatch { ops: batch.clone() })
        };
        if let Err(err) = self.raft.propose(payload).await {
            warn!(error = %err, batch_size = batch.len(), "failed to submit proposal batch to raft");
            self.waiters.fail_all(
                batch.into_iter().map(|op| op.seq_num).filter(|s| !s.is_empty()),
                err,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft_glue::LocalRaftGlue;
    use crate::rpc::PutRequest;

    fn put_request() -> RequestWrapper {
        RequestWrapper::PutRequest(PutRequest {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            lease: 0,
            prev_kv: false,
            ignore_value: false,
            ignore_lease: false,
        })
    }

    fn wire_router() -> (
        ProposalRouter,
        ProposalBatcher<LocalRaftGlue>,
        mpsc::Receiver<crate::raft_glue::CommittedEntry>,
        Arc<PendingWaiters>,
    ) {
        let (glue, committed_rx) = LocalRaftGlue::new(1, 16);
        let glue = Arc::new(glue);
        let state = Arc::new(State::default());
        state.update(1, 1, true);
        let waiters = PendingWaiters::new();
        let pending_depth = Arc::new(AtomicUsize::new(0));
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let router = ProposalRouter::new(
            1,
            state,
            TimeoutConfig::default(),
            batch_tx,
            Arc::clone(&pending_depth),
            Arc::clone(&waiters),
        );
        let batcher = ProposalBatcher::new(
            batch_rx,
            glue,
            Arc::clone(&waiters),
            pending_depth,
            BatchConfig::default(),
        );
        (router, batcher, committed_rx, waiters)
    }

    #[tokio::test]
    async fn propose_fails_fast_when_not_leader() {
        let (router, _batcher, _rx, _waiters) = wire_router();
        router.state.update(2, 2, false);
        let result = router.propose(put_request()).await;
        assert!(matches!(result, Err(CoreError::NotLeader(_))));
    }

    #[tokio::test]
    async fn proposal_reaches_the_committed_entry_stream_and_resolves_the_waiter() {
        let (router, batcher, mut committed_rx, waiters) = wire_router();
        let _handle = batcher.spawn();

        let propose_task = tokio::spawn(async move { router.propose(put_request()).await });

        let entry = tokio::time::timeout(Duration::from_secs(1), committed_rx.recv())
            .await
            .expect("entry should arrive")
            .expect("channel open");
        let seq_num = match decode_entry(&entry.payload).unwrap() {
            DecodedEntry::Single(op) => {
                assert!(matches!(op.op, Some(raft_operation::Op::Put(_))));
                op.seq_num
            }
            DecodedEntry::Batch(_) => panic!("expected a single op"),
        };

        waiters.resolve(
            &seq_num,
            Ok(ResponseWrapper::PutResponse(crate::rpc::PutResponse {
                header: None,
                prev_kv: None,
            })),
        );

        let result = tokio::time::timeout(Duration::from_secs(1), propose_task)
            .await
            .expect("propose task should finish")
            .expect("task should not panic");
        assert!(matches!(result, Ok(ResponseWrapper::PutResponse(_))));
    }

    #[test]
    fn sizing_scales_between_bounds_with_depth() {
        let (glue, _crx) = LocalRaftGlue::new(1, 4);
        let waiters = PendingWaiters::new();
        let pending_depth = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::channel(4);
        let batcher = ProposalBatcher::new(
            rx,
            Arc::new(glue),
            waiters,
            pending_depth,
            BatchConfig::default(),
        );
        let (low_size, low_to) = batcher.sizing_for(0);
        let (high_size, high_to) = batcher.sizing_for(1000);
        assert!(high_size >= low_size);
        assert!(high_to <= low_to);
    }
}
