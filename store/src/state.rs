use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Leadership and node identity as observed from the Raft Glue layer.
/// Shared by the lease manager (only the leader runs the expiry ticker,
/// §4.3), the read path (only the leader serves lease reads, §4.7) and the
/// proposal router (mutating ops fail fast with `NotLeader` off the
/// leader).
#[derive(Debug, Default)]
pub struct State {
    is_leader: AtomicBool,
    leader_id: AtomicU64,
    term: AtomicU64,
}

impl State {
    /// Whether this node currently believes itself to be the Raft leader.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// The node id this node believes is the current leader (may be itself).
    pub fn leader_id(&self) -> u64 {
        self.leader_id.load(Ordering::Acquire)
    }

    /// The current Raft term.
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    /// Called by the Raft Glue layer whenever a `Ready` batch reports a
    /// soft-state change.
    pub fn update(&self, leader_id: u64, term: u64, is_leader: bool) {
        self.leader_id.store(leader_id, Ordering::Release);
        self.term.store(term, Ordering::Release);
        self.is_leader.store(is_leader, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_not_leader() {
        let state = State::default();
        assert!(!state.is_leader());
    }

    #[test]
    fn update_reflects_latest_soft_state() {
        let state = State::default();
        state.update(7, 3, true);
        assert!(state.is_leader());
        assert_eq!(state.leader_id(), 7);
        assert_eq!(state.term(), 3);
    }
}
