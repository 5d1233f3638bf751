/// User-visible error taxonomy (§7). Front-ends map these onto their own
/// wire status codes (gRPC status, HTTP status, MySQL error codes); the
/// core only needs to distinguish them from each other and from the fatal,
/// non-user-visible failures that stop the node from accepting writes.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A read targeted a revision at or below `compacted_revision`.
    #[error("requested revision {requested} has been compacted; compacted revision is {compacted}")]
    Compacted {
        /// The revision the caller asked for.
        requested: i64,
        /// The current compacted revision.
        compacted: i64,
    },

    /// A linearizable read depends on log entries this node has not yet
    /// applied, and no bound on how soon that will happen is known.
    #[error("requested revision {requested} is not yet available, applied revision is {applied}")]
    Unavailable {
        /// The revision the caller asked for.
        requested: i64,
        /// The revision this node has applied so far.
        applied: i64,
    },

    /// A `Compact` request failed validation.
    #[error("failed precondition for compact: {0}")]
    FailedPrecondition(String),

    /// A lease or watch id referenced by the caller does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A watch id the caller tried to create already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Proposal submission or commit-wait exceeded its deadline.
    #[error("deadline exceeded waiting for {0}")]
    DeadlineExceeded(String),

    /// The caller cancelled the request. Side effects may still land — see
    /// §5 "Cancellation".
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A `Put` referenced a lease id that does not exist. Fails the whole
    /// apply of that operation (§4.1).
    #[error("lease {0} not found")]
    LeaseNotFound(i64),

    /// A lease-ttl grant request was outside the configured bounds.
    #[error("lease ttl {0} is out of bounds")]
    LeaseTtlOutOfBounds(i64),

    /// A mutating operation or leadership transfer was attempted on a node
    /// that is not the current Raft leader.
    #[error("not leader; current leader is {0:?}")]
    NotLeader(Option<u64>),

    /// The transaction's `then` or `else` branch itself failed (one of its
    /// sub-operations returned an error, e.g. a nested `LeaseNotFound` is
    /// impossible since lease ops are excluded from txn branches, but a
    /// malformed request can still surface here).
    #[error("transaction branch failed: {0}")]
    TxnFailed(String),
}

impl CoreError {
    /// Whether this error reflects a condition a client could reasonably
    /// retry (as opposed to one that calls for operator intervention).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Unavailable { .. } | CoreError::DeadlineExceeded(_)
        )
    }
}

/// Fatal errors: anything below this line means the local store or the
/// Raft log is no longer trustworthy. The apply loop does not attempt to
/// recover; it stops consuming committed entries and the node reports
/// itself unhealthy (§7 "Apply-time errors that are not user-visible").
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    /// The local storage engine reported an I/O error during apply.
    #[error("storage engine failure during apply: {0}")]
    Engine(#[from] engine::EngineError),

    /// A persisted record could not be decoded (corruption, or a version
    /// skew the legacy-format fallback does not cover).
    #[error("failed to decode persisted record: {0}")]
    Decode(String),
}

/// The result of applying one committed operation (§4.1): either a
/// per-op, user-visible failure that leaves the apply loop healthy, or a
/// fatal one that does not.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// A per-op failure the caller can see (`LeaseNotFound`, a malformed
    /// `ignore_value`/`ignore_lease` Put, ...). Propagates as this op's
    /// result; the apply loop keeps going.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The local store itself failed. The apply loop stops.
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl From<engine::EngineError> for ApplyError {
    fn from(err: engine::EngineError) -> Self {
        ApplyError::Fatal(FatalError::Engine(err))
    }
}
