//! Shared types for the Raft engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the consensus engine and the storage/transport layers: ids,
//! log entries, the peer wire messages, the user state-machine contract, and
//! the effect vocabulary returned by applies.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical node identifier. Address resolution happens in the transport.
pub type NodeId = u64;

/// Log position within a group.
pub type Index = u64;

/// Leader term.
pub type Term = u64;

/// Correlation id for an in-flight proposal, assigned by the group handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProposalId(pub u64);

/// Stable opaque identifier for a consensus group.
///
/// The 64-bit hash is what appears in WAL frames and registry keys; the full
/// bytes disambiguate on registration, where a hash collision is rejected.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId {
    bytes: Bytes,
    hash: u64,
}

impl GroupId {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let digest = blake3::hash(&bytes);
        let mut h = [0u8; 8];
        h.copy_from_slice(&digest.as_bytes()[..8]);
        Self {
            bytes,
            hash: u64::from_le_bytes(h),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// 64-bit hash used in WAL frames and demultiplexing tables.
    pub fn hash64(&self) -> u64 {
        self.hash
    }

    /// Directory-safe rendering used for the per-group on-disk layout.
    pub fn dir_name(&self) -> String {
        match std::str::from_utf8(&self.bytes) {
            Ok(s) if s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
                s.to_string()
            }
            _ => format!("g{:016x}", self.hash),
        }
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self.dir_name())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Address of one server: a group replica hosted on a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId {
    pub group: GroupId,
    pub node: NodeId,
}

impl ServerId {
    pub fn new(group: GroupId, node: NodeId) -> Self {
        Self { group, node }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.group, self.node)
    }
}

/// What a log entry carries.
///
/// `Truncate` is a WAL stream marker announcing a follower suffix overwrite;
/// it never enters the logical log and is filtered out during demux/replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    UserCommand,
    ClusterConfig,
    Noop,
    Truncate,
}

impl EntryKind {
    pub fn to_wire(self) -> u8 {
        match self {
            EntryKind::UserCommand => 0,
            EntryKind::ClusterConfig => 1,
            EntryKind::Noop => 2,
            EntryKind::Truncate => 3,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(EntryKind::UserCommand),
            1 => Some(EntryKind::ClusterConfig),
            2 => Some(EntryKind::Noop),
            3 => Some(EntryKind::Truncate),
            _ => None,
        }
    }
}

/// One entry in a group's logical log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub kind: EntryKind,
    pub payload: Bytes,
}

impl LogEntry {
    pub fn new(index: Index, term: Term, kind: EntryKind, payload: impl Into<Bytes>) -> Self {
        Self {
            index,
            term,
            kind,
            payload: payload.into(),
        }
    }

    pub fn noop(index: Index, term: Term) -> Self {
        Self::new(index, term, EntryKind::Noop, Bytes::new())
    }
}

/// Voting membership of a group. Stored in the log as a `ClusterConfig`
/// entry; the set in the highest appended entry is the one quorums use.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub voters: BTreeSet<NodeId>,
}

impl ClusterConfig {
    pub fn new(voters: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            voters: voters.into_iter().collect(),
        }
    }

    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.voters.contains(&node)
    }

    pub fn peers(&self, of: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.voters.iter().copied().filter(move |n| *n != of)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(8 + self.voters.len() * 8);
        buf.extend_from_slice(&(self.voters.len() as u32).to_be_bytes());
        for node in &self.voters {
            buf.extend_from_slice(&node.to_be_bytes());
        }
        Bytes::from(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RaftError> {
        if buf.len() < 4 {
            return Err(RaftError::LogCorrupt {
                reason: "short cluster config payload".into(),
            });
        }
        let count = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() != 4 + count * 8 {
            return Err(RaftError::LogCorrupt {
                reason: "cluster config payload length mismatch".into(),
            });
        }
        let mut voters = BTreeSet::new();
        for i in 0..count {
            let off = 4 + i * 8;
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[off..off + 8]);
            voters.insert(u64::from_be_bytes(b));
        }
        Ok(Self { voters })
    }
}

/// Peer wire messages. Encoding is the transport's business; the engine only
/// fixes the field sets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
    },
    AppendEntriesReply {
        term: Term,
        success: bool,
        /// Highest index appended *and durable* on the follower.
        last_index: Index,
        /// On mismatch: the term of the follower's conflicting entry.
        mismatch_hint_term: Option<Term>,
        /// On mismatch: the first index the follower holds for that term, so
        /// the leader can skip a whole term in one step.
        mismatch_hint_index: Option<Index>,
    },
    RequestVote {
        term: Term,
        candidate_id: NodeId,
        last_index: Index,
        last_term: Term,
        pre_vote: bool,
    },
    RequestVoteReply {
        term: Term,
        granted: bool,
        pre_vote: bool,
    },
    InstallSnapshot {
        term: Term,
        leader_id: NodeId,
        last_index: Index,
        last_term: Term,
        cluster_config: ClusterConfig,
        offset: u64,
        data: Bytes,
        done: bool,
    },
    InstallSnapshotReply {
        term: Term,
        last_index: Index,
    },
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::AppendEntries { term, .. }
            | Message::AppendEntriesReply { term, .. }
            | Message::RequestVote { term, .. }
            | Message::RequestVoteReply { term, .. }
            | Message::InstallSnapshot { term, .. }
            | Message::InstallSnapshotReply { term, .. } => *term,
        }
    }
}

/// Commands interpreted by the core itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Opaque user command dispatched to the group's state machine.
    User(Bytes),
    /// Add one voter. At most one membership change may be in flight.
    Join { node: NodeId },
    /// Remove one voter.
    Leave { node: NodeId },
    /// Barrier entry; used by leaders to establish commit in their term.
    Noop,
    /// Linearizable read barrier; the reply is issued once the leader's
    /// own-term noop has committed and applied.
    Query,
}

/// Why a pending membership change was rolled back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevertReason {
    VerificationTimeout,
    Unreachable,
}

/// Metadata handed to `Machine::apply` for each committed entry.
#[derive(Clone, Debug)]
pub struct ApplyMeta {
    pub index: Index,
    pub term: Term,
    /// Wall-clock at apply time, milliseconds since the epoch.
    pub system_time_ms: u64,
    /// Proposal correlation id, present only on the server that accepted the
    /// proposal in this process lifetime.
    pub from: Option<ProposalId>,
}

/// Side effects returned by a state-machine apply. Executed only while the
/// applying server is leader; dropped otherwise. The set is closed: new
/// variants require a contract version bump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    SendMsg { target: ServerId, payload: Bytes },
    Monitor { node: NodeId },
    Demonitor { node: NodeId },
    Notify { to: ProposalId, reply: Bytes },
    ModCall { module: String, function: String, args: Vec<Bytes> },
    ReleaseCursor { index: Index },
    Checkpoint { index: Index },
    Snapshot { index: Index },
    Timer { name: String, after_ms: u64 },
    Aux { cmd: Bytes },
}

/// The user state-machine contract. Applies must be deterministic: equal
/// `(meta, command, state)` must produce equal results on every replica.
pub trait Machine: Send + Sync + 'static {
    type State: Send + 'static;

    fn init(&self) -> Self::State;

    fn apply(
        &self,
        meta: &ApplyMeta,
        command: &[u8],
        state: &mut Self::State,
    ) -> (Bytes, Vec<Effect>);

    /// Serialize the state for snapshotting.
    fn snapshot(&self, state: &Self::State) -> Bytes;

    /// Rebuild state from snapshot bytes.
    fn restore(&self, data: &[u8]) -> anyhow::Result<Self::State>;

    /// Invoked on role transitions; effects obey the same leader gate.
    fn state_enter(&self, _role: RoleKind, _state: &Self::State) -> Vec<Effect> {
        Vec::new()
    }

    /// Periodic callback on the group's tick cadence.
    fn tick(&self, _now_ms: u64, _state: &Self::State) -> Vec<Effect> {
        Vec::new()
    }

    /// Contract version recorded in snapshot metadata; bump on incompatible
    /// state or effect changes.
    fn version(&self) -> u32 {
        0
    }
}

/// Role as visible to the user state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

/// Best-effort peer channel. Implementations must not reorder messages sent
/// to the same target from one group; delivery may fail silently. Replies
/// carry no sender field on the wire, so the envelope names the origin node.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, from: NodeId, target: ServerId, message: Message) -> anyhow::Result<()>;
}

/// Result of a term lookup in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermLookup {
    Term(Term),
    /// Beyond the end of the log.
    Missing,
    /// At or below the snapshot boundary.
    Compacted,
}

/// Durable log seam the server drives. `cairn_store` implements it over the
/// shared WAL and per-group segments; tests use the in-memory `MemLog`.
///
/// `append` and `truncate_from` take effect in the hot tier immediately and
/// become durable asynchronously; durability is reported to the server as
/// `Event::WalDurable`.
pub trait LogStore: Send + 'static {
    fn append(&mut self, entry: LogEntry) -> Result<(), RaftError>;

    /// Remove all entries with `index >= from`. Follower-only conflict path.
    fn truncate_from(&mut self, from: Index) -> Result<(), RaftError>;

    fn fetch(&self, index: Index) -> Result<Option<LogEntry>, RaftError>;

    fn fetch_term(&self, index: Index) -> TermLookup;

    /// `(last_index, last_term)`; the snapshot boundary when the log is empty.
    fn last_index_term(&self) -> (Index, Term);

    fn next_index(&self) -> Index {
        self.last_index_term().0 + 1
    }

    /// `(index, term)` of the snapshot boundary, `(0, 0)` when none.
    fn snapshot_last(&self) -> (Index, Term);

    /// Entries in `[from, to]`, at most `max`, stopping early at a gap.
    fn entries(&self, from: Index, to: Index, max: usize) -> Result<Vec<LogEntry>, RaftError>;

    /// Reset the log around an installed snapshot: everything at or below
    /// `last_index` becomes compacted, the log is empty above it.
    fn reset_to_snapshot(&mut self, last_index: Index, last_term: Term) -> Result<(), RaftError>;
}

/// Errors surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RaftError {
    #[error("not leader{}", hint.map(|n| format!(", try node {n}")).unwrap_or_default())]
    NotLeader { hint: Option<NodeId> },
    #[error("leader unknown")]
    LeaderUnknown,
    #[error("timed out")]
    Timeout,
    #[error("a cluster membership change is already in progress")]
    ClusterChangeInProgress,
    #[error("stale term")]
    BadTerm,
    #[error("log index gap: expected {expected}, got {got}")]
    IndexGap { expected: Index, got: Index },
    #[error("log corrupt: {reason}")]
    LogCorrupt { reason: String },
    #[error("write-ahead log unavailable")]
    WalUnavailable,
    #[error("snapshot unavailable")]
    SnapshotUnavailable,
}
