//! In-memory state for a single Raft server.
//!
//! Kept separate from the event handlers in `server` so that transitions and
//! quorum arithmetic stay unit-testable on their own.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::types::{ClusterConfig, Index, NodeId, ProposalId, RevertReason, RoleKind, Term};

/// Server role. `PreVote` polls peers without bumping the term; the two
/// terminating roles drain in-flight work before the group exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    PreVote,
    Candidate,
    Leader,
    /// Behaves as a follower but suppresses elections; used by servers that
    /// joined an existing cluster and have not yet heard from a leader.
    AwaitCondition,
    /// Installing a peer-streamed snapshot; normal appends are rejected.
    ReceiveSnapshot,
    TerminatingLeader,
    TerminatingFollower,
}

impl Role {
    pub fn is_leader(self) -> bool {
        matches!(self, Role::Leader | Role::TerminatingLeader)
    }

    pub fn is_terminating(self) -> bool {
        matches!(self, Role::TerminatingLeader | Role::TerminatingFollower)
    }

    /// Whether the election timer may fire in this role.
    pub fn elects(self) -> bool {
        matches!(self, Role::Follower | Role::PreVote | Role::Candidate)
    }

    pub fn kind(self) -> RoleKind {
        match self {
            Role::Leader | Role::TerminatingLeader => RoleKind::Leader,
            Role::PreVote | Role::Candidate => RoleKind::Candidate,
            _ => RoleKind::Follower,
        }
    }
}

/// State that must survive restart. The log itself is persisted through the
/// log store; this is only term and vote.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Leader-side view of one peer's replication stream.
#[derive(Clone, Debug)]
pub struct PeerProgress {
    /// Next index to send; optimistic under pipelining.
    pub next_index: Index,
    /// Highest index known durable on the peer.
    pub match_index: Index,
    /// Last time this peer acked anything, engine clock.
    pub last_ack_ms: u64,
    /// Appends sent but not yet acked.
    pub in_flight: usize,
    /// A snapshot transfer is running; appends are paused.
    pub sending_snapshot: bool,
}

impl PeerProgress {
    pub fn new(next_index: Index, now_ms: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            last_ack_ms: now_ms,
            in_flight: 0,
            sending_snapshot: false,
        }
    }
}

/// Volatile leader state, created on election win.
#[derive(Clone, Debug)]
pub struct LeaderState {
    pub progress: HashMap<NodeId, PeerProgress>,
    /// Index of the noop appended on election; reads open once it commits.
    pub noop_index: Index,
    pub read_ready: bool,
}

impl LeaderState {
    pub fn new(peers: impl IntoIterator<Item = NodeId>, next_index: Index, now_ms: u64) -> Self {
        Self {
            progress: peers
                .into_iter()
                .map(|p| (p, PeerProgress::new(next_index, now_ms)))
                .collect(),
            noop_index: 0,
            read_ready: false,
        }
    }
}

/// A join/leave that has been appended but not yet verified.
#[derive(Clone, Debug)]
pub struct PendingChange {
    pub kind: PendingChangeKind,
    pub node: NodeId,
    /// Index of the appended config entry.
    pub config_index: Index,
    /// Voter set to restore on revert.
    pub prior: ClusterConfig,
    pub started_ms: u64,
    pub timeout_ms: u64,
    pub from: Option<ProposalId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingChangeKind {
    Join,
    Leave,
}

/// Follower-side ack held back until the WAL has fsynced the suffix.
#[derive(Clone, Copy, Debug)]
pub struct PendingAck {
    pub to: NodeId,
    pub up_to: Index,
}

/// Receiver-side accumulation of a streamed snapshot.
#[derive(Clone, Debug)]
pub struct PendingInstall {
    pub last_index: Index,
    pub last_term: Term,
    pub cluster_config: ClusterConfig,
    pub data: Vec<u8>,
    pub next_offset: u64,
}

/// Everything volatile about one server, plus the persistent term/vote pair.
#[derive(Debug)]
pub struct ServerState {
    pub node: NodeId,
    pub role: Role,
    pub persistent: PersistentState,
    pub leader_id: Option<NodeId>,
    pub commit_index: Index,
    /// Highest index the local WAL has fsynced for this group.
    pub durable_index: Index,
    /// Cluster set from the highest appended config entry.
    pub config: ClusterConfig,
    /// Index of that entry; 0 while running on the bootstrap set.
    pub config_index: Index,
    pub pending_change: Option<PendingChange>,
    pub leader: Option<LeaderState>,
    /// Vote tally for the current pre-vote or election round.
    pub votes: HashSet<NodeId>,
    pub pending_ack: Option<PendingAck>,
    pub pending_install: Option<PendingInstall>,
    /// Peers the liveness oracle currently reports down. Advisory only.
    pub down_peers: HashSet<NodeId>,
    pub now_ms: u64,
    pub election_deadline_ms: u64,
    pub heartbeat_due_ms: u64,
    pub membership_check_due_ms: u64,
    /// Last time a valid leader was heard from; gates pre-vote grants.
    pub last_leader_contact_ms: Option<u64>,
    pub rng: StdRng,
}

impl ServerState {
    pub fn quorum(&self) -> usize {
        self.config.quorum()
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    /// Step down into follower at `term`. Clears the vote only when the term
    /// actually advances.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        debug_assert!(term >= self.persistent.current_term);
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
        }
        let terminating = self.role.is_terminating();
        self.role = if terminating {
            Role::TerminatingFollower
        } else {
            Role::Follower
        };
        self.leader_id = leader_id;
        self.leader = None;
        self.votes.clear();
        self.pending_install = None;
        tracing::debug!(node = self.node, term, leader = ?leader_id, "became follower");
    }

    /// Open a pre-vote round. Does not touch the persistent term.
    pub fn become_pre_vote(&mut self) {
        self.role = Role::PreVote;
        self.leader_id = None;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.node);
        tracing::debug!(
            node = self.node,
            term = self.persistent.current_term,
            "pre-vote round started"
        );
    }

    /// Real candidacy: bump term, vote for self.
    pub fn become_candidate(&mut self) {
        self.role = Role::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node);
        self.leader_id = None;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.node);
        tracing::info!(
            node = self.node,
            term = self.persistent.current_term,
            "became candidate"
        );
    }

    pub fn become_leader(&mut self, next_index: Index) {
        let peers: Vec<NodeId> = self.config.peers(self.node).collect();
        self.role = Role::Leader;
        self.leader_id = Some(self.node);
        self.leader = Some(LeaderState::new(peers, next_index, self.now_ms));
        self.votes.clear();
        tracing::info!(
            node = self.node,
            term = self.persistent.current_term,
            "became leader"
        );
    }

    /// Commit index supported by a quorum of durable match indexes, counting
    /// the leader's own WAL durability. The caller still owns the
    /// same-term restriction before adopting the result.
    pub fn quorum_durable_index(&self) -> Index {
        let Some(leader) = &self.leader else {
            return self.commit_index;
        };
        let mut indexes: Vec<Index> = self
            .config
            .voters
            .iter()
            .map(|&v| {
                if v == self.node {
                    self.durable_index
                } else {
                    leader
                        .progress
                        .get(&v)
                        .map(|p| p.match_index)
                        .unwrap_or(0)
                }
            })
            .collect();
        indexes.sort_unstable();
        indexes.reverse();
        let quorum_idx = self.quorum() - 1;
        indexes.get(quorum_idx).copied().unwrap_or(0)
    }

    /// Randomised election deadline within the configured window.
    pub fn reset_election_deadline(&mut self, min_ms: u64, max_ms: u64) {
        let span = max_ms.saturating_sub(min_ms).max(1);
        self.election_deadline_ms = self.now_ms + min_ms + self.rng.gen_range(0..span);
    }

    /// Accelerated deadline after a leader-down liveness signal.
    pub fn accelerate_election(&mut self, max_ms: u64) {
        let deadline = self.now_ms + self.rng.gen_range(1..max_ms.max(2));
        self.election_deadline_ms = self.election_deadline_ms.min(deadline);
    }

    pub fn note_leader_contact(&mut self) {
        self.last_leader_contact_ms = Some(self.now_ms);
    }

    /// Whether a pre-vote may be granted: no leader heard from within the
    /// minimum election timeout.
    pub fn leader_silent_for(&self, min_election_ms: u64) -> bool {
        match self.last_leader_contact_ms {
            None => true,
            Some(at) => self.now_ms.saturating_sub(at) >= min_election_ms,
        }
    }
}

/// Revert reason conversion for notification payloads.
pub fn revert_reason_label(reason: RevertReason) -> &'static str {
    match reason {
        RevertReason::VerificationTimeout => "verification_timeout",
        RevertReason::Unreachable => "unreachable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn state(node: NodeId, voters: &[NodeId]) -> ServerState {
        ServerState {
            node,
            role: Role::Follower,
            persistent: PersistentState::default(),
            leader_id: None,
            commit_index: 0,
            durable_index: 0,
            config: ClusterConfig::new(voters.iter().copied()),
            config_index: 0,
            pending_change: None,
            leader: None,
            votes: HashSet::new(),
            pending_ack: None,
            pending_install: None,
            down_peers: HashSet::new(),
            now_ms: 0,
            election_deadline_ms: 0,
            heartbeat_due_ms: 0,
            membership_check_due_ms: 0,
            last_leader_contact_ms: None,
            rng: StdRng::seed_from_u64(7),
        }
    }

    #[test]
    fn candidate_bumps_term_and_votes_for_self() {
        let mut s = state(1, &[1, 2, 3]);
        s.become_candidate();
        assert_eq!(s.role, Role::Candidate);
        assert_eq!(s.persistent.current_term, 1);
        assert_eq!(s.persistent.voted_for, Some(1));
        assert!(s.votes.contains(&1));
    }

    #[test]
    fn pre_vote_leaves_term_untouched() {
        let mut s = state(1, &[1, 2, 3]);
        s.become_pre_vote();
        assert_eq!(s.role, Role::PreVote);
        assert_eq!(s.persistent.current_term, 0);
        assert_eq!(s.persistent.voted_for, None);
    }

    #[test]
    fn follower_keeps_vote_within_same_term() {
        let mut s = state(1, &[1, 2, 3]);
        s.become_candidate();
        s.become_follower(1, Some(2));
        assert_eq!(s.persistent.voted_for, Some(1));
        s.become_follower(2, Some(2));
        assert_eq!(s.persistent.voted_for, None);
    }

    #[test]
    fn quorum_durable_index_counts_own_durability() {
        let mut s = state(1, &[1, 2, 3, 4, 5]);
        s.become_candidate();
        s.become_leader(11);
        s.durable_index = 10;
        let leader = s.leader.as_mut().unwrap();
        leader.progress.get_mut(&2).unwrap().match_index = 8;
        leader.progress.get_mut(&3).unwrap().match_index = 7;
        leader.progress.get_mut(&4).unwrap().match_index = 9;
        leader.progress.get_mut(&5).unwrap().match_index = 6;
        // Durable indexes are [10, 9, 8, 7, 6]; quorum of 3 supports 8.
        assert_eq!(s.quorum_durable_index(), 8);
    }

    #[test]
    fn leader_silence_gates_pre_vote_grants() {
        let mut s = state(1, &[1, 2, 3]);
        assert!(s.leader_silent_for(150));
        s.now_ms = 1_000;
        s.note_leader_contact();
        s.now_ms = 1_100;
        assert!(!s.leader_silent_for(150));
        s.now_ms = 1_200;
        assert!(s.leader_silent_for(150));
    }
}
