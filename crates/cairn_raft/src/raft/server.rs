//! The per-group Raft server.
//!
//! The server is a deterministic state machine: it consumes one `Event` at a
//! time and fills an `Output` with outbound messages and host actions. It
//! performs no IO and reads no clocks; time arrives in events and all
//! randomness comes from the seeded RNG in its state, so whole clusters can
//! be driven synchronously in tests.
//!
//! Replication is pipelined and ack-driven: the leader streams
//! `AppendEntries` without waiting, followers ack with the index their WAL
//! has fsynced, and the commit index is the quorum over durable match
//! indexes. A follower therefore holds its ack back until the WAL durability
//! notification covers the appended suffix.

use std::collections::HashSet;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::state::{
    PeerProgress, PendingAck, PendingChange, PendingChangeKind, PendingInstall, PersistentState,
    Role, ServerState,
};
use super::types::{
    ClusterConfig, Command, EntryKind, GroupId, Index, LogEntry, LogStore, Message, NodeId,
    ProposalId, RaftError, RevertReason, RoleKind, Term, TermLookup,
};

/// Tunables for one group's server. `Default` matches a small LAN cluster.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    pub group: GroupId,
    pub node: NodeId,
    /// Bootstrap voter set, used until the log carries a config entry.
    pub initial_voters: Vec<NodeId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_entries_per_append: usize,
    /// Pipelining window: appends in flight per peer before backing off.
    pub max_inflight_appends: usize,
    pub snapshot_chunk_bytes: usize,
    /// Re-offer a snapshot stream if no completion ack arrives in time.
    pub snapshot_retry_ms: u64,
    pub membership_check_interval_ms: u64,
    pub membership_timeout_ms: u64,
    pub await_condition_timeout_ms: u64,
    /// Upper bound of the shortened election timer after the liveness oracle
    /// reports the current leader down.
    pub down_accel_max_ms: u64,
    /// Seed for election timer randomisation.
    pub seed: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            group: GroupId::new(&b"default"[..]),
            node: 1,
            initial_voters: vec![1],
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_entries_per_append: 64,
            max_inflight_appends: 8,
            snapshot_chunk_bytes: 1024 * 1024,
            snapshot_retry_ms: 1_000,
            membership_check_interval_ms: 5_000,
            membership_timeout_ms: 30_000,
            await_condition_timeout_ms: 10_000,
            down_accel_max_ms: 50,
            seed: 0,
        }
    }
}

/// One input to the server.
#[derive(Clone, Debug)]
pub enum Event {
    Tick { now_ms: u64 },
    Message { from: NodeId, message: Message },
    Propose { id: ProposalId, command: Command },
    /// The shared WAL has fsynced this group's records up to `up_to_index`.
    WalDurable { up_to_index: Index },
    /// Advisory liveness transition for a peer node.
    PeerLiveness { node: NodeId, up: bool },
    /// Begin draining; the group exits once `Action::Stopped` is emitted.
    Terminate,
}

/// Host work requested by the server. Actions must be performed before the
/// `Output` messages are handed to the transport: in particular a
/// `PersistTermVote` guards every vote or ack sent in the same batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    PersistTermVote {
        term: Term,
        voted_for: Option<NodeId>,
    },
    /// Apply committed entries up to `index`.
    CommitTo { index: Index },
    /// Stream the current snapshot to a peer that fell behind the boundary.
    SendSnapshot { to: NodeId },
    /// A peer-streamed snapshot finished arriving; persist and restore it.
    InstallSnapshot {
        last_index: Index,
        last_term: Term,
        cluster_config: ClusterConfig,
        data: Bytes,
    },
    Notify {
        id: ProposalId,
        outcome: Result<Notification, RaftError>,
    },
    RoleChanged { role: RoleKind },
    /// Drain complete; the event queue may be closed.
    Stopped,
}

/// Positive proposal outcomes delivered through `Action::Notify`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// Entry appended at `index`; the apply-time reply follows separately.
    Accepted { index: Index },
    /// A linearizable read may run once applies reach `barrier`.
    ReadReady { barrier: Index },
    MembershipDone { node: NodeId },
    MembershipReverted { node: NodeId, reason: RevertReason },
}

/// Everything one event produced.
#[derive(Debug, Default)]
pub struct Output {
    pub messages: Vec<(NodeId, Message)>,
    pub actions: Vec<Action>,
}

impl Output {
    fn notify(&mut self, id: ProposalId, outcome: Result<Notification, RaftError>) {
        self.actions.push(Action::Notify { id, outcome });
    }
}

pub struct RaftServer<L: LogStore> {
    config: RaftConfig,
    st: ServerState,
    log: L,
    /// Queries waiting for the own-term noop to commit.
    pending_queries: Vec<ProposalId>,
    /// Leader-side retry clock for in-flight snapshot streams.
    snapshot_sent_at_ms: u64,
    stopped: bool,
}

impl<L: LogStore> RaftServer<L> {
    /// Restore a server around a recovered log. `persistent` comes from the
    /// meta store; the cluster config is the highest config entry found in
    /// the log, falling back to `restored_config` (snapshot) and then the
    /// bootstrap set.
    pub fn new(
        config: RaftConfig,
        log: L,
        persistent: PersistentState,
        restored_config: Option<ClusterConfig>,
        awaiting: bool,
        now_ms: u64,
    ) -> Result<Self, RaftError> {
        let (snap_index, _) = log.snapshot_last();
        let (last_index, _) = log.last_index_term();

        let mut cluster = restored_config
            .unwrap_or_else(|| ClusterConfig::new(config.initial_voters.iter().copied()));
        let mut config_index = snap_index;
        let mut idx = snap_index + 1;
        while idx <= last_index {
            let batch = log.entries(idx, last_index, 256)?;
            if batch.is_empty() {
                break;
            }
            for entry in &batch {
                if entry.kind == EntryKind::ClusterConfig {
                    cluster = ClusterConfig::decode(&entry.payload)?;
                    config_index = entry.index;
                }
                idx = entry.index + 1;
            }
        }

        let mut st = ServerState {
            node: config.node,
            role: if awaiting {
                Role::AwaitCondition
            } else {
                Role::Follower
            },
            persistent,
            leader_id: None,
            commit_index: snap_index,
            durable_index: last_index,
            config: cluster,
            config_index,
            pending_change: None,
            leader: None,
            votes: HashSet::new(),
            pending_ack: None,
            pending_install: None,
            down_peers: HashSet::new(),
            now_ms,
            election_deadline_ms: 0,
            heartbeat_due_ms: 0,
            membership_check_due_ms: now_ms + config.membership_check_interval_ms,
            last_leader_contact_ms: None,
            rng: StdRng::seed_from_u64(config.seed ^ config.node),
        };
        if awaiting {
            st.election_deadline_ms = now_ms + config.await_condition_timeout_ms;
        } else {
            st.reset_election_deadline(
                config.election_timeout_min_ms,
                config.election_timeout_max_ms,
            );
        }

        Ok(Self {
            config,
            st,
            log,
            pending_queries: Vec::new(),
            snapshot_sent_at_ms: 0,
            stopped: false,
        })
    }

    pub fn role(&self) -> Role {
        self.st.role
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn current_term(&self) -> Term {
        self.st.persistent.current_term
    }

    pub fn commit_index(&self) -> Index {
        self.st.commit_index
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.st.leader_id
    }

    pub fn cluster_config(&self) -> &ClusterConfig {
        &self.st.config
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    /// Process one event. This is the only entry point; it never blocks.
    pub fn handle(&mut self, event: Event) -> Result<Output, RaftError> {
        let mut out = Output::default();
        if self.stopped {
            return Ok(out);
        }
        let kind_before = self.st.role.kind();

        match event {
            Event::Tick { now_ms } => self.on_tick(now_ms, &mut out)?,
            Event::Message { from, message } => self.on_message(from, message, &mut out)?,
            Event::Propose { id, command } => self.on_propose(id, command, &mut out)?,
            Event::WalDurable { up_to_index } => self.on_wal_durable(up_to_index, &mut out)?,
            Event::PeerLiveness { node, up } => self.on_peer_liveness(node, up, &mut out)?,
            Event::Terminate => self.on_terminate(&mut out)?,
        }

        let kind_after = self.st.role.kind();
        if kind_before != kind_after {
            out.actions.push(Action::RoleChanged { role: kind_after });
        }
        Ok(out)
    }

    // ---- time ------------------------------------------------------------

    fn on_tick(&mut self, now_ms: u64, out: &mut Output) -> Result<(), RaftError> {
        self.st.now_ms = self.st.now_ms.max(now_ms);

        if self.st.role.is_terminating() {
            self.check_drained(out);
            return Ok(());
        }

        match self.st.role {
            Role::Leader => {
                if self.st.now_ms >= self.st.heartbeat_due_ms {
                    self.st.heartbeat_due_ms =
                        self.st.now_ms + self.config.heartbeat_interval_ms;
                    self.replicate_to_all(true, out)?;
                }
                if self.st.now_ms >= self.st.membership_check_due_ms {
                    self.st.membership_check_due_ms =
                        self.st.now_ms + self.config.membership_check_interval_ms;
                    self.check_pending_membership(out)?;
                }
                self.retry_stalled_snapshots(out);
            }
            Role::Follower | Role::PreVote | Role::Candidate => {
                if self.st.now_ms >= self.st.election_deadline_ms {
                    self.start_pre_vote(out)?;
                }
            }
            Role::AwaitCondition => {
                // Condition timeout: give up waiting and behave as a normal
                // follower, elections re-enabled.
                if self.st.now_ms >= self.st.election_deadline_ms {
                    tracing::info!(node = self.st.node, "await-condition timed out");
                    self.st.role = Role::Follower;
                    self.reset_election_deadline();
                }
            }
            Role::ReceiveSnapshot => {
                if self.st.now_ms >= self.st.election_deadline_ms {
                    tracing::warn!(node = self.st.node, "snapshot stream stalled, resuming");
                    self.st.pending_install = None;
                    self.st.role = Role::Follower;
                    self.reset_election_deadline();
                }
            }
            Role::TerminatingLeader | Role::TerminatingFollower => {}
        }
        Ok(())
    }

    fn retry_stalled_snapshots(&mut self, out: &mut Output) {
        let now = self.st.now_ms;
        let retry = self.config.snapshot_retry_ms;
        let mut resend = Vec::new();
        if let Some(leader) = &self.st.leader {
            for (&peer, progress) in &leader.progress {
                if progress.sending_snapshot && now.saturating_sub(self.snapshot_sent_at_ms) >= retry
                {
                    resend.push(peer);
                }
            }
        }
        if !resend.is_empty() {
            self.snapshot_sent_at_ms = now;
            for peer in resend {
                out.actions.push(Action::SendSnapshot { to: peer });
            }
        }
    }

    // ---- elections -------------------------------------------------------

    fn start_pre_vote(&mut self, out: &mut Output) -> Result<(), RaftError> {
        if !self.st.config.contains(self.st.node) {
            // Not a voter (removed, or still joining): never campaign.
            self.reset_election_deadline();
            return Ok(());
        }
        self.st.become_pre_vote();
        self.reset_election_deadline();
        if self.st.votes.len() >= self.st.quorum() {
            return self.start_election(out);
        }
        let (last_index, last_term) = self.log.last_index_term();
        let probe_term = self.st.persistent.current_term + 1;
        let peers: Vec<NodeId> = self.st.config.peers(self.st.node).collect();
        for peer in peers {
            out.messages.push((
                peer,
                Message::RequestVote {
                    term: probe_term,
                    candidate_id: self.st.node,
                    last_index,
                    last_term,
                    pre_vote: true,
                },
            ));
        }
        Ok(())
    }

    fn start_election(&mut self, out: &mut Output) -> Result<(), RaftError> {
        self.st.become_candidate();
        self.persist(out);
        self.reset_election_deadline();
        if self.st.votes.len() >= self.st.quorum() {
            return self.on_election_won(out);
        }
        let (last_index, last_term) = self.log.last_index_term();
        let term = self.st.persistent.current_term;
        let peers: Vec<NodeId> = self.st.config.peers(self.st.node).collect();
        for peer in peers {
            out.messages.push((
                peer,
                Message::RequestVote {
                    term,
                    candidate_id: self.st.node,
                    last_index,
                    last_term,
                    pre_vote: false,
                },
            ));
        }
        Ok(())
    }

    fn on_election_won(&mut self, out: &mut Output) -> Result<(), RaftError> {
        let next_index = self.log.next_index();
        self.st.become_leader(next_index);
        let noop_index = self.append_local(EntryKind::Noop, Bytes::new())?;
        if let Some(leader) = self.st.leader.as_mut() {
            leader.noop_index = noop_index;
        }
        self.st.heartbeat_due_ms = self.st.now_ms + self.config.heartbeat_interval_ms;
        self.replicate_to_all(true, out)?;
        // A single-voter group commits its noop as soon as the WAL does.
        self.maybe_advance_commit(out);
        Ok(())
    }

    // ---- proposals -------------------------------------------------------

    fn on_propose(
        &mut self,
        id: ProposalId,
        command: Command,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        if self.st.role.is_terminating() {
            out.notify(id, Err(RaftError::Timeout));
            return Ok(());
        }
        if !self.st.is_leader() {
            let err = match self.st.leader_id {
                Some(hint) => RaftError::NotLeader { hint: Some(hint) },
                None => RaftError::LeaderUnknown,
            };
            out.notify(id, Err(err));
            return Ok(());
        }

        match command {
            Command::User(payload) => {
                let index = self.append_local(EntryKind::UserCommand, payload)?;
                out.notify(id, Ok(Notification::Accepted { index }));
                self.replicate_to_all(false, out)?;
            }
            Command::Noop => {
                let index = self.append_local(EntryKind::Noop, Bytes::new())?;
                out.notify(id, Ok(Notification::Accepted { index }));
                self.replicate_to_all(false, out)?;
            }
            Command::Join { node } => self.propose_membership(
                id,
                PendingChangeKind::Join,
                node,
                out,
            )?,
            Command::Leave { node } => self.propose_membership(
                id,
                PendingChangeKind::Leave,
                node,
                out,
            )?,
            Command::Query => {
                let ready = self
                    .st
                    .leader
                    .as_ref()
                    .map(|l| l.read_ready)
                    .unwrap_or(false);
                if ready {
                    let barrier = self.st.commit_index;
                    out.notify(id, Ok(Notification::ReadReady { barrier }));
                } else {
                    self.pending_queries.push(id);
                }
            }
        }
        Ok(())
    }

    fn propose_membership(
        &mut self,
        id: ProposalId,
        kind: PendingChangeKind,
        node: NodeId,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        if self.st.pending_change.is_some() {
            out.notify(id, Err(RaftError::ClusterChangeInProgress));
            return Ok(());
        }
        let already = self.st.config.contains(node);
        match kind {
            PendingChangeKind::Join if already => {
                out.notify(id, Ok(Notification::MembershipDone { node }));
                return Ok(());
            }
            PendingChangeKind::Leave if !already => {
                out.notify(id, Ok(Notification::MembershipDone { node }));
                return Ok(());
            }
            _ => {}
        }

        let prior = self.st.config.clone();
        let mut next = prior.clone();
        match kind {
            PendingChangeKind::Join => {
                next.voters.insert(node);
            }
            PendingChangeKind::Leave => {
                next.voters.remove(&node);
            }
        }

        let index = self.append_local(EntryKind::ClusterConfig, next.encode())?;
        // The cluster set switches at append, not at commit.
        self.st.config = next;
        self.st.config_index = index;
        self.st.pending_change = Some(PendingChange {
            kind,
            node,
            config_index: index,
            prior,
            started_ms: self.st.now_ms,
            timeout_ms: self.config.membership_timeout_ms,
            from: Some(id),
        });
        if kind == PendingChangeKind::Join {
            if let Some(leader) = self.st.leader.as_mut() {
                leader
                    .progress
                    .entry(node)
                    .or_insert_with(|| PeerProgress::new(index, self.st.now_ms));
            }
        }
        tracing::info!(
            node = self.st.node,
            target = node,
            change = ?kind,
            index,
            "membership change appended"
        );
        self.replicate_to_all(true, out)?;
        Ok(())
    }

    fn check_pending_membership(&mut self, out: &mut Output) -> Result<(), RaftError> {
        let Some(pending) = self.st.pending_change.clone() else {
            return Ok(());
        };
        let done = match pending.kind {
            PendingChangeKind::Join => self
                .st
                .leader
                .as_ref()
                .and_then(|l| l.progress.get(&pending.node))
                .map(|p| p.match_index > 0)
                .unwrap_or(false),
            PendingChangeKind::Leave => self.st.commit_index >= pending.config_index,
        };
        if done {
            self.st.pending_change = None;
            if let Some(from) = pending.from {
                out.notify(
                    from,
                    Ok(Notification::MembershipDone {
                        node: pending.node,
                    }),
                );
            }
            return Ok(());
        }
        if self.st.now_ms >= pending.started_ms + pending.timeout_ms {
            self.revert_membership(RevertReason::VerificationTimeout, out)?;
        }
        Ok(())
    }

    fn revert_membership(
        &mut self,
        reason: RevertReason,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        let Some(pending) = self.st.pending_change.take() else {
            return Ok(());
        };
        let index = self.append_local(EntryKind::ClusterConfig, pending.prior.encode())?;
        self.st.config = pending.prior.clone();
        self.st.config_index = index;
        if pending.kind == PendingChangeKind::Join {
            if let Some(leader) = self.st.leader.as_mut() {
                leader.progress.remove(&pending.node);
            }
        }
        tracing::warn!(
            node = self.st.node,
            target = pending.node,
            ?reason,
            "membership change reverted"
        );
        if let Some(from) = pending.from {
            out.notify(
                from,
                Ok(Notification::MembershipReverted {
                    node: pending.node,
                    reason,
                }),
            );
        }
        self.replicate_to_all(true, out)?;
        Ok(())
    }

    // ---- replication (leader) -------------------------------------------

    fn append_local(&mut self, kind: EntryKind, payload: Bytes) -> Result<Index, RaftError> {
        let index = self.log.next_index();
        let term = self.st.persistent.current_term;
        self.log.append(LogEntry::new(index, term, kind, payload))?;
        Ok(index)
    }

    /// Send append streams to every peer. With `force`, peers with nothing
    /// new still get an empty heartbeat.
    fn replicate_to_all(&mut self, force: bool, out: &mut Output) -> Result<(), RaftError> {
        if self.st.leader.is_none() {
            return Ok(());
        }
        let peers: Vec<NodeId> = self
            .st
            .leader
            .as_ref()
            .map(|l| l.progress.keys().copied().collect())
            .unwrap_or_default();
        for peer in peers {
            self.replicate_to(peer, force, out)?;
        }
        Ok(())
    }

    fn replicate_to(
        &mut self,
        peer: NodeId,
        force: bool,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        let term = self.st.persistent.current_term;
        let commit = self.st.commit_index;
        let (last_index, _) = self.log.last_index_term();
        let (snap_index, snap_term) = self.log.snapshot_last();
        let max_entries = self.config.max_entries_per_append;
        let max_inflight = self.config.max_inflight_appends;
        let node = self.st.node;

        let Some(leader) = self.st.leader.as_mut() else {
            return Ok(());
        };
        let Some(progress) = leader.progress.get_mut(&peer) else {
            return Ok(());
        };
        if progress.sending_snapshot {
            return Ok(());
        }
        if progress.next_index <= snap_index {
            // The peer needs entries we compacted away.
            progress.sending_snapshot = true;
            self.snapshot_sent_at_ms = self.st.now_ms;
            out.actions.push(Action::SendSnapshot { to: peer });
            return Ok(());
        }
        let has_new = progress.next_index <= last_index;
        if !has_new && !force {
            return Ok(());
        }
        if has_new && progress.in_flight >= max_inflight && !force {
            return Ok(());
        }

        let prev_index = progress.next_index - 1;
        let prev_term = if prev_index == 0 {
            0
        } else if prev_index == snap_index {
            snap_term
        } else {
            match self.log.fetch_term(prev_index) {
                TermLookup::Term(t) => t,
                TermLookup::Compacted => snap_term,
                TermLookup::Missing => {
                    return Err(RaftError::IndexGap {
                        expected: prev_index,
                        got: last_index,
                    })
                }
            }
        };
        let entries = if has_new {
            self.log.entries(progress.next_index, last_index, max_entries)?
        } else {
            Vec::new()
        };
        if !entries.is_empty() {
            progress.next_index = entries.last().map(|e| e.index + 1).unwrap_or(progress.next_index);
            progress.in_flight += 1;
        }
        out.messages.push((
            peer,
            Message::AppendEntries {
                term,
                leader_id: node,
                prev_index,
                prev_term,
                entries,
                leader_commit: commit,
            },
        ));
        Ok(())
    }

    fn maybe_advance_commit(&mut self, out: &mut Output) {
        if !self.st.is_leader() {
            return;
        }
        let supported = self.st.quorum_durable_index();
        if supported <= self.st.commit_index {
            return;
        }
        // Entries commit by counting only in the leader's own term; terms are
        // monotone in the log, so a stale term at `supported` means nothing
        // newer can commit yet either.
        let current = self.st.persistent.current_term;
        let (snap_index, snap_term) = self.log.snapshot_last();
        let term_at = if supported == snap_index {
            TermLookup::Term(snap_term)
        } else {
            self.log.fetch_term(supported)
        };
        if term_at != TermLookup::Term(current) {
            return;
        }
        self.st.commit_index = supported;
        tracing::debug!(
            node = self.st.node,
            commit = supported,
            "commit index advanced"
        );
        out.actions.push(Action::CommitTo { index: supported });
        self.on_commit_advanced(out);
    }

    fn on_commit_advanced(&mut self, out: &mut Output) {
        let commit = self.st.commit_index;
        let mut became_read_ready = false;
        if let Some(leader) = self.st.leader.as_mut() {
            if !leader.read_ready && leader.noop_index > 0 && commit >= leader.noop_index {
                leader.read_ready = true;
                became_read_ready = true;
            }
        }
        if became_read_ready {
            for id in std::mem::take(&mut self.pending_queries) {
                out.notify(id, Ok(Notification::ReadReady { barrier: commit }));
            }
        }

        // A committed leave resolves its pending change without waiting for
        // the verification tick.
        if let Some(pending) = self.st.pending_change.clone() {
            if pending.kind == PendingChangeKind::Leave && commit >= pending.config_index {
                self.st.pending_change = None;
                if let Some(from) = pending.from {
                    out.notify(
                        from,
                        Ok(Notification::MembershipDone {
                            node: pending.node,
                        }),
                    );
                }
                if pending.node == self.st.node {
                    // We removed ourselves; hand off by draining.
                    self.st.role = Role::TerminatingLeader;
                }
            }
        }
    }

    // ---- messages --------------------------------------------------------

    fn on_message(
        &mut self,
        from: NodeId,
        message: Message,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        // I4: any higher term forces follower. Pre-vote traffic is exempt on
        // the request side; replies carry real terms.
        let term = message.term();
        let pre_vote_probe = matches!(
            message,
            Message::RequestVote { pre_vote: true, .. }
        );
        if term > self.st.persistent.current_term && !pre_vote_probe {
            self.st.become_follower(term, None);
            self.persist(out);
        }

        match message {
            Message::AppendEntries {
                term,
                leader_id,
                prev_index,
                prev_term,
                entries,
                leader_commit,
            } => self.on_append_entries(
                term,
                leader_id,
                prev_index,
                prev_term,
                entries,
                leader_commit,
                out,
            ),
            Message::AppendEntriesReply {
                term,
                success,
                last_index,
                mismatch_hint_term,
                mismatch_hint_index,
            } => self.on_append_reply(
                from,
                term,
                success,
                last_index,
                mismatch_hint_term,
                mismatch_hint_index,
                out,
            ),
            Message::RequestVote {
                term,
                candidate_id,
                last_index,
                last_term,
                pre_vote,
            } => self.on_request_vote(term, candidate_id, last_index, last_term, pre_vote, out),
            Message::RequestVoteReply {
                term,
                granted,
                pre_vote,
            } => self.on_vote_reply(from, term, granted, pre_vote, out),
            Message::InstallSnapshot {
                term,
                leader_id,
                last_index,
                last_term,
                cluster_config,
                offset,
                data,
                done,
            } => self.on_install_snapshot(
                term,
                leader_id,
                last_index,
                last_term,
                cluster_config,
                offset,
                data,
                done,
                out,
            ),
            Message::InstallSnapshotReply { term: _, last_index } => {
                self.on_install_snapshot_reply(from, last_index, out)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_append_entries(
        &mut self,
        term: Term,
        leader_id: NodeId,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        let current = self.st.persistent.current_term;
        if term < current {
            out.messages.push((
                leader_id,
                Message::AppendEntriesReply {
                    term: current,
                    success: false,
                    last_index: self.st.durable_index,
                    mismatch_hint_term: None,
                    mismatch_hint_index: None,
                },
            ));
            return Ok(());
        }

        if self.st.role.is_terminating() {
            // Draining: take no new entries, let the leader time us out.
            return Ok(());
        }

        // Valid leader for this term.
        if matches!(self.st.role, Role::Candidate | Role::PreVote) {
            self.st.become_follower(term, Some(leader_id));
        }
        if self.st.role == Role::AwaitCondition {
            tracing::info!(node = self.st.node, leader = leader_id, "leader contact");
            self.st.role = Role::Follower;
        }
        self.st.leader_id = Some(leader_id);
        self.st.note_leader_contact();
        self.reset_election_deadline();

        if self.st.role == Role::ReceiveSnapshot {
            // Mid-install: normal appends are rejected until done.
            out.messages.push((
                leader_id,
                Message::AppendEntriesReply {
                    term: current.max(term),
                    success: false,
                    last_index: self.st.durable_index,
                    mismatch_hint_term: None,
                    mismatch_hint_index: None,
                },
            ));
            return Ok(());
        }

        // Consistency check at prev.
        let (snap_index, snap_term) = self.log.snapshot_last();
        let prev_matches = if prev_index == 0 {
            true
        } else if prev_index == snap_index {
            prev_term == snap_term
        } else {
            match self.log.fetch_term(prev_index) {
                TermLookup::Term(t) => t == prev_term,
                // Below the boundary: covered by the snapshot, consistent.
                TermLookup::Compacted => true,
                TermLookup::Missing => false,
            }
        };
        if !prev_matches {
            let (hint_term, hint_index) = self.conflict_hint(prev_index);
            out.messages.push((
                leader_id,
                Message::AppendEntriesReply {
                    term: self.st.persistent.current_term,
                    success: false,
                    last_index: self.st.durable_index,
                    mismatch_hint_term: hint_term,
                    mismatch_hint_index: Some(hint_index),
                },
            ));
            return Ok(());
        }

        // Append the new suffix, overwriting any conflicting tail.
        let mut appended = false;
        let ack_to = prev_index + entries.len() as u64;
        for entry in entries {
            if entry.index <= snap_index {
                continue;
            }
            match self.log.fetch_term(entry.index) {
                TermLookup::Term(t) if t == entry.term => continue,
                TermLookup::Term(_) => {
                    self.log.truncate_from(entry.index)?;
                    self.st.durable_index = self.st.durable_index.min(entry.index - 1);
                    self.st.pending_ack = None;
                    self.log.append(entry)?;
                    appended = true;
                }
                TermLookup::Missing => {
                    self.log.append(entry)?;
                    appended = true;
                }
                TermLookup::Compacted => continue,
            }
        }
        let _ = appended;

        if leader_commit > self.st.commit_index {
            let bound = leader_commit.min(ack_to.max(self.st.commit_index));
            if bound > self.st.commit_index {
                self.st.commit_index = bound;
                out.actions.push(Action::CommitTo { index: bound });
            }
        }

        // Ack only what the WAL has made durable (I3): hold the reply back
        // until the fsync notification covers the suffix.
        if self.st.durable_index >= ack_to {
            out.messages.push((
                leader_id,
                Message::AppendEntriesReply {
                    term: self.st.persistent.current_term,
                    success: true,
                    last_index: ack_to,
                    mismatch_hint_term: None,
                    mismatch_hint_index: None,
                },
            ));
        } else {
            let up_to = match self.st.pending_ack {
                Some(p) => p.up_to.max(ack_to),
                None => ack_to,
            };
            self.st.pending_ack = Some(PendingAck {
                to: leader_id,
                up_to,
            });
        }
        Ok(())
    }

    /// First index of the conflicting term, so the leader can skip the whole
    /// term in one step.
    fn conflict_hint(&self, prev_index: Index) -> (Option<Term>, Index) {
        let (last_index, _) = self.log.last_index_term();
        if prev_index > last_index {
            return (None, last_index + 1);
        }
        match self.log.fetch_term(prev_index) {
            TermLookup::Term(conflict_term) => {
                let mut first = prev_index;
                while first > 1 {
                    match self.log.fetch_term(first - 1) {
                        TermLookup::Term(t) if t == conflict_term => first -= 1,
                        _ => break,
                    }
                }
                (Some(conflict_term), first)
            }
            _ => (None, last_index + 1),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_append_reply(
        &mut self,
        from: NodeId,
        term: Term,
        success: bool,
        last_index: Index,
        mismatch_hint_term: Option<Term>,
        mismatch_hint_index: Option<Index>,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        if !self.st.is_leader() || term < self.st.persistent.current_term {
            return Ok(());
        }
        let now = self.st.now_ms;
        let (snap_index, _) = self.log.snapshot_last();
        let mut send_snapshot = false;
        {
            let Some(leader) = self.st.leader.as_mut() else {
                return Ok(());
            };
            let Some(progress) = leader.progress.get_mut(&from) else {
                return Ok(());
            };
            progress.last_ack_ms = now;
            progress.in_flight = progress.in_flight.saturating_sub(1);
            if success {
                if last_index > progress.match_index {
                    progress.match_index = last_index;
                }
                if last_index + 1 > progress.next_index {
                    progress.next_index = last_index + 1;
                }
            } else {
                // Fast rollback: jump to the follower's first index of the
                // conflicting term, or to its log end.
                let next = match (mismatch_hint_term, mismatch_hint_index) {
                    (_, Some(hint)) => hint,
                    _ => progress.next_index.saturating_sub(1).max(1),
                };
                progress.next_index = next.max(progress.match_index + 1).max(1);
                if progress.next_index <= snap_index && !progress.sending_snapshot {
                    progress.sending_snapshot = true;
                    send_snapshot = true;
                }
            }
        }
        if send_snapshot {
            self.snapshot_sent_at_ms = now;
            out.actions.push(Action::SendSnapshot { to: from });
            return Ok(());
        }
        if success {
            self.maybe_advance_commit(out);
        }
        // Keep the pipeline moving either way.
        self.replicate_to(from, false, out)?;
        Ok(())
    }

    fn on_request_vote(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_index: Index,
        last_term: Term,
        pre_vote: bool,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        let current = self.st.persistent.current_term;
        let up_to_date = {
            let (our_index, our_term) = self.log.last_index_term();
            last_term > our_term || (last_term == our_term && last_index >= our_index)
        };

        let granted = if pre_vote {
            // A pre-vote is a poll: no term change, no recorded vote. Granted
            // only while we know of no live leader: either none at all, or
            // the one we knew has gone silent. A current leader never
            // encourages a challenger.
            term >= current
                && up_to_date
                && !self.st.is_leader()
                && (self.st.leader_id.is_none()
                    || self
                        .st
                        .leader_silent_for(self.config.election_timeout_min_ms))
        } else if term < current {
            false
        } else {
            // I5: one vote per term.
            let can_vote = self.st.persistent.voted_for.is_none()
                || self.st.persistent.voted_for == Some(candidate_id);
            if can_vote && up_to_date {
                self.st.persistent.voted_for = Some(candidate_id);
                self.persist(out);
                self.reset_election_deadline();
                true
            } else {
                false
            }
        };

        tracing::debug!(
            node = self.st.node,
            candidate = candidate_id,
            term,
            pre_vote,
            granted,
            "vote request handled"
        );
        out.messages.push((
            candidate_id,
            Message::RequestVoteReply {
                term: self.st.persistent.current_term,
                granted,
                pre_vote,
            },
        ));
        Ok(())
    }

    fn on_vote_reply(
        &mut self,
        from: NodeId,
        term: Term,
        granted: bool,
        pre_vote: bool,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        if !self.st.config.contains(from) {
            // Only votes from the current voter set count toward quorum.
            return Ok(());
        }
        if pre_vote {
            if self.st.role != Role::PreVote {
                return Ok(());
            }
            if granted {
                self.st.votes.insert(from);
                if self.st.votes.len() >= self.st.quorum() {
                    return self.start_election(out);
                }
            }
            return Ok(());
        }
        if self.st.role != Role::Candidate || term != self.st.persistent.current_term {
            return Ok(());
        }
        if granted {
            self.st.votes.insert(from);
            if self.st.votes.len() >= self.st.quorum() {
                return self.on_election_won(out);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_install_snapshot(
        &mut self,
        term: Term,
        leader_id: NodeId,
        last_index: Index,
        last_term: Term,
        cluster_config: ClusterConfig,
        offset: u64,
        data: Bytes,
        done: bool,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        let current = self.st.persistent.current_term;
        if term < current {
            out.messages.push((
                leader_id,
                Message::InstallSnapshotReply {
                    term: current,
                    last_index: 0,
                },
            ));
            return Ok(());
        }
        self.st.leader_id = Some(leader_id);
        self.st.note_leader_contact();
        self.reset_election_deadline();
        self.st.role = Role::ReceiveSnapshot;

        if offset == 0 {
            self.st.pending_install = Some(PendingInstall {
                last_index,
                last_term,
                cluster_config: cluster_config.clone(),
                data: Vec::new(),
                next_offset: 0,
            });
        }
        let Some(pending) = self.st.pending_install.as_mut() else {
            // Chunk without a stream start; wait for the leader's retry.
            return Ok(());
        };
        if offset != pending.next_offset || last_index != pending.last_index {
            tracing::warn!(
                node = self.st.node,
                expected = pending.next_offset,
                got = offset,
                "snapshot chunk out of order, dropping stream"
            );
            self.st.pending_install = None;
            return Ok(());
        }
        pending.data.extend_from_slice(&data);
        pending.next_offset += data.len() as u64;

        if done {
            let pending = self.st.pending_install.take().expect("pending install");
            tracing::info!(
                node = self.st.node,
                last_index = pending.last_index,
                bytes = pending.data.len(),
                "snapshot stream complete"
            );
            out.actions.push(Action::InstallSnapshot {
                last_index: pending.last_index,
                last_term: pending.last_term,
                cluster_config: pending.cluster_config.clone(),
                data: Bytes::from(pending.data),
            });
            self.log.reset_to_snapshot(pending.last_index, pending.last_term)?;
            self.st.config = pending.cluster_config;
            self.st.config_index = pending.last_index;
            self.st.commit_index = self.st.commit_index.max(pending.last_index);
            self.st.durable_index = pending.last_index;
            self.st.pending_ack = None;
            self.st.role = Role::Follower;
            out.messages.push((
                leader_id,
                Message::InstallSnapshotReply {
                    term: self.st.persistent.current_term,
                    last_index: pending.last_index,
                },
            ));
        }
        Ok(())
    }

    fn on_install_snapshot_reply(
        &mut self,
        from: NodeId,
        last_index: Index,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        if !self.st.is_leader() {
            return Ok(());
        }
        {
            let Some(leader) = self.st.leader.as_mut() else {
                return Ok(());
            };
            let Some(progress) = leader.progress.get_mut(&from) else {
                return Ok(());
            };
            if !progress.sending_snapshot || last_index == 0 {
                return Ok(());
            }
            progress.sending_snapshot = false;
            progress.match_index = progress.match_index.max(last_index);
            progress.next_index = last_index + 1;
            progress.last_ack_ms = self.st.now_ms;
            progress.in_flight = 0;
        }
        tracing::info!(
            node = self.st.node,
            peer = from,
            last_index,
            "snapshot transfer acknowledged"
        );
        // The follower resumes as a normal append target immediately.
        self.replicate_to(from, true, out)?;
        self.maybe_advance_commit(out);
        Ok(())
    }

    // ---- durability and liveness ----------------------------------------

    fn on_wal_durable(&mut self, up_to_index: Index, out: &mut Output) -> Result<(), RaftError> {
        if up_to_index <= self.st.durable_index {
            return Ok(());
        }
        self.st.durable_index = up_to_index;

        if self.st.is_leader() {
            self.maybe_advance_commit(out);
        } else if let Some(pending) = self.st.pending_ack {
            if self.st.durable_index >= pending.up_to {
                self.st.pending_ack = None;
                out.messages.push((
                    pending.to,
                    Message::AppendEntriesReply {
                        term: self.st.persistent.current_term,
                        success: true,
                        last_index: pending.up_to,
                        mismatch_hint_term: None,
                        mismatch_hint_index: None,
                    },
                ));
            }
        }
        if self.st.role.is_terminating() {
            self.check_drained(out);
        }
        Ok(())
    }

    fn on_peer_liveness(
        &mut self,
        node: NodeId,
        up: bool,
        out: &mut Output,
    ) -> Result<(), RaftError> {
        if up {
            self.st.down_peers.remove(&node);
            return Ok(());
        }
        self.st.down_peers.insert(node);

        // The oracle is advisory: it may shorten timers, forget a leader
        // hint, and fail pending joins early, never grant votes or move
        // terms.
        if self.st.leader_id == Some(node) && self.st.role.elects() {
            tracing::debug!(
                node = self.st.node,
                leader = node,
                "leader reported down, accelerating election timer"
            );
            self.st.accelerate_election(self.config.down_accel_max_ms);
            self.st.leader_id = None;
        }
        if self.st.is_leader() {
            let join_failed = self
                .st
                .pending_change
                .as_ref()
                .map(|p| p.kind == PendingChangeKind::Join && p.node == node)
                .unwrap_or(false);
            if join_failed {
                self.revert_membership(RevertReason::Unreachable, out)?;
            }
        }
        Ok(())
    }

    fn on_terminate(&mut self, out: &mut Output) -> Result<(), RaftError> {
        if !self.st.role.is_terminating() {
            self.st.role = if self.st.is_leader() {
                Role::TerminatingLeader
            } else {
                Role::TerminatingFollower
            };
            tracing::info!(node = self.st.node, role = ?self.st.role, "draining");
        }
        // Reject queued queries instead of leaving callers hanging.
        for id in std::mem::take(&mut self.pending_queries) {
            out.notify(id, Err(RaftError::Timeout));
        }
        self.check_drained(out);
        Ok(())
    }

    fn check_drained(&mut self, out: &mut Output) {
        if self.stopped {
            return;
        }
        let (last_index, _) = self.log.last_index_term();
        // Appends already enqueued still reach the WAL before exit.
        if self.st.durable_index >= last_index && self.st.pending_ack.is_none() {
            self.stopped = true;
            out.actions.push(Action::Stopped);
        }
    }

    // ---- helpers ---------------------------------------------------------

    fn persist(&self, out: &mut Output) {
        out.actions.push(Action::PersistTermVote {
            term: self.st.persistent.current_term,
            voted_for: self.st.persistent.voted_for,
        });
    }

    fn reset_election_deadline(&mut self) {
        self.st.reset_election_deadline(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );
    }
}
