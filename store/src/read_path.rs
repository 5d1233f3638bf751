//! Linearizable reads (§4.7): a leader serving `Range` wants to guarantee
//! the read reflects every mutation ordered before it arrived, without
//! paying a full proposal round trip for every read. Two paths:
//!
//! - **Leader-lease fast path**: while the leader has recently confirmed it
//!   still holds a quorum-backed lease (refreshed on every heartbeat round),
//!   it trusts its own applied state immediately.
//! - **Read-index fallback**: once the lease has lapsed (or was never
//!   established, e.g. right after an election), the leader asks the Raft
//!   Glue layer for a read index and waits for its own applied index to
//!   catch up to it before serving the read.
//!
//! A follower never serves a linearizable read itself (§4.7): it fails fast
//! with `NotLeader` so the caller can forward the request to the leader.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use utils::config::ReadPathConfig;

use crate::{error::CoreError, raft_glue::RaftGlue, state::State};

/// How many times [`ReadPath::linearize`] polls the applied index while
/// waiting for a read-index target to catch up before giving up.
const READ_INDEX_MAX_POLLS: u32 = 2000;
/// Spacing between applied-index polls in the read-index fallback.
const READ_INDEX_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Gatekeeper for linearizable reads, shared by every `Range` call that asks
/// for linearizable consistency.
#[derive(Debug)]
pub struct ReadPath<G> {
    state: Arc<State>,
    raft: Arc<G>,
    config: ReadPathConfig,
    lease_deadline: Mutex<Option<Instant>>,
}

impl<G: RaftGlue> ReadPath<G> {
    /// Build a read path over the shared leadership state and Raft Glue.
    pub fn new(state: Arc<State>, raft: Arc<G>, config: ReadPathConfig) -> Self {
        Self {
            state,
            raft,
            config,
            lease_deadline: Mutex::new(None),
        }
    }

    /// Called whenever the leader confirms a quorum-backed heartbeat round.
    /// Extends the window in which the fast path can be trusted, clipped by
    /// the configured clock-drift margin.
    pub fn confirm_leadership(&self) {
        let window = self
            .config
            .heartbeat_interval()
            .saturating_sub(*self.config.clock_drift());
        *self.lease_deadline.lock() = Some(Instant::now() + window);
    }

    /// Called on a leadership loss so a stale lease can't outlive it.
    pub fn clear_lease(&self) {
        *self.lease_deadline.lock() = None;
    }

    fn lease_still_valid(&self) -> bool {
        self.lease_deadline
            .lock()
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Block until it is safe to serve a linearizable read against the
    /// locally applied state.
    ///
    /// # Errors
    /// Returns [`CoreError::NotLeader`] off the leader, or
    /// [`CoreError::Unavailable`] if the read-index fallback doesn't catch
    /// up within its poll budget.
    pub async fn linearize(&self) -> Result<(), CoreError> {
        if !self.state.is_leader() {
            return Err(CoreError::NotLeader(Some(self.state.leader_id())));
        }
        if self.lease_still_valid() {
            return Ok(());
        }

        let target = self.raft.read_index().await?;
        for _ in 0..READ_INDEX_MAX_POLLS {
            if self.raft.applied_index() >= target {
                return Ok(());
            }
            tokio::time::sleep(READ_INDEX_POLL_INTERVAL).await;
        }
        Err(CoreError::Unavailable {
            requested: target,
            applied: self.raft.applied_index(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft_glue::{LocalRaftGlue, RaftGlue};

    fn read_path_with(state: Arc<State>) -> ReadPath<LocalRaftGlue> {
        let (glue, _rx) = LocalRaftGlue::new(1, 4);
        ReadPath::new(state, Arc::new(glue), ReadPathConfig::default())
    }

    #[tokio::test]
    async fn followers_fail_fast() {
        let state = Arc::new(State::default());
        state.update(2, 1, false);
        let read_path = read_path_with(state);
        assert!(matches!(
            read_path.linearize().await,
            Err(CoreError::NotLeader(_))
        ));
    }

    #[tokio::test]
    async fn a_confirmed_lease_serves_without_touching_read_index() {
        let state = Arc::new(State::default());
        state.update(1, 1, true);
        let read_path = read_path_with(state);
        read_path.confirm_leadership();
        assert!(read_path.linearize().await.is_ok());
    }

    #[tokio::test]
    async fn without_a_lease_it_falls_back_to_read_index_and_waits_for_apply() {
        let state = Arc::new(State::default());
        state.update(1, 1, true);
        let (glue, _rx) = LocalRaftGlue::new(1, 4);
        let glue = Arc::new(glue);
        let read_path = ReadPath::new(state, Arc::clone(&glue), ReadPathConfig::default());

        glue.propose(b"noop".to_vec()).await.unwrap();
        let target = glue.read_index().await.unwrap();
        assert_eq!(target, 1);

        let glue_for_apply = Arc::clone(&glue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            glue_for_apply.mark_applied(1);
        });

        assert!(read_path.linearize().await.is_ok());
    }

    #[tokio::test]
    async fn clearing_the_lease_forces_the_fallback_again() {
        let state = Arc::new(State::default());
        state.update(1, 1, true);
        let read_path = read_path_with(state);
        read_path.confirm_leadership();
        read_path.clear_lease();
        // read index target is 0 (nothing proposed), applied index is also
        // 0, so the fallback succeeds immediately without the fast path.
        assert!(read_path.linearize().await.is_ok());
    }
}
