//! Bridges Raft ready-state to the Apply Engine and the Snapshotter (§2
//! "Raft Glue"). The consensus protocol itself is out of scope (§1) — this
//! module only defines the seam a real Raft library's driver task would sit
//! behind: submit a serialized proposal, receive committed entries back in
//! the order Raft decided, and answer leadership/index questions.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CoreError;

/// One entry the Apply Engine consumes, in commit order. `index` is the
/// Raft log index it landed at — the applied index the Read Path compares
/// against a `ReadIndex` response (§4.7).
#[derive(Debug, Clone)]
pub struct CommittedEntry {
    /// Serialized [`crate::propose::RaftOperation`] or
    /// [`crate::propose::RaftOperationBatch`] bytes (§6.2).
    pub payload: Vec<u8>,
    /// The Raft log index this entry committed at.
    pub index: i64,
}

/// What the Raft Glue layer exposes to the rest of the core. A real
/// integration wraps a consensus library's driver; [`LocalRaftGlue`] below
/// is a single-node stand-in used by tests and single-process embeddings.
#[async_trait]
pub trait RaftGlue: Send + Sync + std::fmt::Debug + 'static {
    /// Submit a serialized proposal for replication. Resolves once the
    /// proposal has been accepted for replication, not once it has
    /// committed — the caller learns about commit by watching the
    /// committed-entry stream.
    ///
    /// # Errors
    /// Returns [`CoreError::NotLeader`] if this node cannot accept
    /// proposals right now.
    async fn propose(&self, payload: Vec<u8>) -> Result<(), CoreError>;

    /// Request a read index: a commit index that, once locally applied,
    /// guarantees this node has seen every mutation ordered before the
    /// read arrived (§4.7 "Read-index fallback"). Requires quorum
    /// confirmation of leadership.
    ///
    /// # Errors
    /// Returns [`CoreError::NotLeader`] if this node is not the leader, or
    /// [`CoreError::Unavailable`] if quorum confirmation times out.
    async fn read_index(&self) -> Result<i64, CoreError>;

    /// This node's cluster member id.
    fn node_id(&self) -> u64;

    /// The current Raft term this node observes.
    fn term(&self) -> u64;

    /// The node id this node believes is the current leader.
    fn leader_id(&self) -> u64;

    /// Whether this node currently believes itself to be the leader.
    fn is_leader(&self) -> bool;

    /// The highest log index this node has applied locally.
    fn applied_index(&self) -> i64;

    /// The highest log index this node knows to be committed.
    fn commit_index(&self) -> i64;

    /// Record that the apply loop has finished applying the entry at
    /// `index`, so [`RaftGlue::applied_index`] and the Read Path's
    /// read-index wait condition (§4.7) stay accurate.
    fn mark_applied(&self, index: i64);

    /// Transfer leadership to `target_id`.
    ///
    /// # Errors
    /// Returns [`CoreError::NotLeader`] if this node is not the leader.
    async fn transfer_leadership(&self, target_id: u64) -> Result<(), CoreError>;
}

/// A single-node stand-in for a real consensus library: every proposal
/// "commits" immediately, in submission order, and this node is always the
/// leader. Used by tests and by embeddings that don't need replication
/// (the teacher's test suite uses an equivalent in-process harness rather
/// than standing up a multi-node cluster for every unit test).
#[derive(Debug)]
pub struct LocalRaftGlue {
    node_id: u64,
    committed_tx: mpsc::Sender<CommittedEntry>,
    next_index: std::sync::atomic::AtomicI64,
    applied_index: std::sync::atomic::AtomicI64,
}

impl LocalRaftGlue {
    /// Build a glue instance and the receiver the apply loop drains.
    pub fn new(node_id: u64, channel_capacity: usize) -> (Self, mpsc::Receiver<CommittedEntry>) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        (
            Self {
                node_id,
                committed_tx: tx,
                next_index: std::sync::atomic::AtomicI64::new(0),
                applied_index: std::sync::atomic::AtomicI64::new(0),
            },
            rx,
        )
    }

}

#[async_trait]
impl RaftGlue for LocalRaftGlue {
    async fn propose(&self, payload: Vec<u8>) -> Result<(), CoreError> {
        let index = self
            .next_index
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel)
            + 1;
        self.committed_tx
            .send(CommittedEntry { payload, index })
            .await
            .map_err(|_| CoreError::Unavailable {
                requested: index,
                applied: self.applied_index(),
            })
    }

    async fn read_index(&self) -> Result<i64, CoreError> {
        Ok(self.next_index.load(std::sync::atomic::Ordering::Acquire))
    }

    fn node_id(&self) -> u64 {
        self.node_id
    }

    fn term(&self) -> u64 {
        1
    }

    fn leader_id(&self) -> u64 {
        self.node_id
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn applied_index(&self) -> i64 {
        self.applied_index.load(std::sync::atomic::Ordering::Acquire)
    }

    fn commit_index(&self) -> i64 {
        self.next_index.load(std::sync::atomic::Ordering::Acquire)
    }

    fn mark_applied(&self, index: i64) {
        self.applied_index
            .store(index, std::sync::atomic::Ordering::Release);
    }

    async fn transfer_leadership(&self, _target_id: u64) -> Result<(), CoreError> {
        Ok(())
    }
}
