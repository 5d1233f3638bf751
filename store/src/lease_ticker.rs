//! The lease expiry ticker (§4.3): only the current Raft leader scans for
//! expired leases, and it must stop scanning the instant it loses
//! leadership rather than merely go quiet, so a demoted leader can never
//! race a newly elected one into revoking the same lease twice.

use std::{sync::Arc, time::Duration};

use engine::StorageEngine;

use crate::{
    propose::ProposalRouter,
    rpc::{LeaseRevokeRequest, RequestWrapper},
    state::State,
    storage::lease_store::LeaseStore,
};

/// Grace period newly (re)confirmed leadership gives every existing lease
/// before it can expire, so a leadership flap doesn't immediately revoke
/// leases a client was actively renewing against the previous leader.
const PROMOTION_GRACE: Duration = Duration::from_secs(5);

/// Drives [`LeaseStore::find_expired_leases`] on an interval, proposing a
/// `LeaseRevoke` for each one it finds. Tracks leadership transitions itself
/// so it can demote/promote the local lease bookkeeping (§4.3) in step with
/// the node's own observed Raft state.
#[derive(Debug)]
pub struct LeaseTicker<E> {
    lease_store: Arc<LeaseStore<E>>,
    router: Arc<ProposalRouter>,
    state: Arc<State>,
    interval: Duration,
}

impl<E: StorageEngine + Send + Sync + 'static> LeaseTicker<E> {
    /// Build a ticker that scans every `interval` (§8.3: capped at
    /// `LeaseConfig::max_ticker_interval`, a small multiple of the smallest
    /// granted ttl in a real deployment).
    pub fn new(
        lease_store: Arc<LeaseStore<E>>,
        router: Arc<ProposalRouter>,
        state: Arc<State>,
        interval: Duration,
    ) -> Self {
        Self {
            lease_store,
            router,
            state,
            interval,
        }
    }

    /// Spawn the ticker's scan loop as its own task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut was_leader = false;
        loop {
            ticker.tick().await;
            let is_leader = self.state.is_leader();
            if is_leader && !was_leader {
                self.lease_store.promote(PROMOTION_GRACE);
            } else if !is_leader && was_leader {
                self.lease_store.demote();
            }
            was_leader = is_leader;
            if !is_leader {
                continue;
            }

            for id in self.lease_store.find_expired_leases() {
                let request = RequestWrapper::LeaseRevokeRequest(LeaseRevokeRequest { id });
                if let Err(err) = self.router.propose(request).await {
                    tracing::warn!(
                        lease_id = id,
                        error = %err,
                        "failed to propose expiry revoke for lease"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::RwLock;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        header_gen::HeaderGenerator,
        propose::{decode_entry, DecodedEntry},
        raft_glue::LocalRaftGlue,
        rpc::raft_operation,
        storage::{
            db::{Db, TABLES},
            index::Index,
            lease_store::LeaseCollection,
        },
    };
    use engine::MemoryEngine;
    use utils::config::TimeoutConfig;

    #[tokio::test]
    async fn an_expired_lease_is_proposed_for_revocation_only_while_leader() {
        let engine = Arc::new(MemoryEngine::new(TABLES));
        let db = Arc::new(Db::new(engine));
        let index = Arc::new(Index::new());
        let lease_collection = Arc::new(RwLock::new(LeaseCollection::new()));
        let header_gen = Arc::new(HeaderGenerator::new(1, 1));
        let state = Arc::new(State::default());
        state.update(1, 1, true);

        let lease_store = Arc::new(LeaseStore::new(
            lease_collection,
            db,
            index,
            Arc::clone(&state),
            header_gen,
        ));
        let _ = lease_store.apply_grant(1, 0).unwrap();

        let (glue, mut committed_rx) = LocalRaftGlue::new(1, 16);
        let glue = Arc::new(glue);
        let waiters = crate::propose::PendingWaiters::new();
        let pending_depth = Arc::new(AtomicUsize::new(0));
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let router = Arc::new(ProposalRouter::new(
            1,
            Arc::clone(&state),
            TimeoutConfig::default(),
            batch_tx,
            pending_depth.clone(),
            waiters,
        ));
        let batcher = crate::propose::ProposalBatcher::new(
            batch_rx,
            Arc::clone(&glue),
            crate::propose::PendingWaiters::new(),
            pending_depth,
            utils::config::BatchConfig::default(),
        );
        let _batcher_handle = batcher.spawn();

        let ticker = LeaseTicker::new(
            Arc::clone(&lease_store),
            router,
            Arc::clone(&state),
            Duration::from_millis(5),
        );
        let _handle = ticker.spawn();

        let entry = tokio::time::timeout(Duration::from_secs(1), committed_rx.recv())
            .await
            .expect("an expiry proposal should arrive")
            .expect("channel open");
        match decode_entry(&entry.payload).unwrap() {
            DecodedEntry::Single(op) => {
                assert!(matches!(op.op, Some(raft_operation::Op::LeaseRevoke(_))));
            }
            DecodedEntry::Batch(_) => panic!("expected a single op"),
        }
    }

    #[tokio::test]
    async fn a_follower_never_scans_for_expired_leases() {
        let engine = Arc::new(MemoryEngine::new(TABLES));
        let db = Arc::new(Db::new(engine));
        let index = Arc::new(Index::new());
        let lease_collection = Arc::new(RwLock::new(LeaseCollection::new()));
        let header_gen = Arc::new(HeaderGenerator::new(1, 1));
        let state = Arc::new(State::default());
        state.update(2, 1, false);

        let lease_store = Arc::new(LeaseStore::new(
            lease_collection,
            db,
            index,
            Arc::clone(&state),
            header_gen,
        ));
        let _ = lease_store.apply_grant(1, 0).unwrap();

        let (glue, mut committed_rx) = LocalRaftGlue::new(2, 16);
        let glue = Arc::new(glue);
        let waiters = crate::propose::PendingWaiters::new();
        let pending_depth = Arc::new(AtomicUsize::new(0));
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let router = Arc::new(ProposalRouter::new(
            2,
            Arc::clone(&state),
            TimeoutConfig::default(),
            batch_tx,
            pending_depth.clone(),
            waiters,
        ));
        let batcher = crate::propose::ProposalBatcher::new(
            batch_rx,
            Arc::clone(&glue),
            crate::propose::PendingWaiters::new(),
            pending_depth,
            utils::config::BatchConfig::default(),
        );
        let _batcher_handle = batcher.spawn();

        let ticker = LeaseTicker::new(lease_store, router, state, Duration::from_millis(5));
        let _handle = ticker.spawn();

        assert!(tokio::time::timeout(Duration::from_millis(50), committed_rx.recv())
            .await
            .is_err());
    }
}
