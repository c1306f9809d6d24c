//! Raft module wiring.
//!
//! `server` contains the deterministic per-group state machine, `state` holds
//! its role and progress bookkeeping, `types` defines the shared wire and
//! trait contracts (log store, transport, user state machine, effects), and
//! `mem` provides the in-memory log store used by tests.

pub mod mem;
mod server;
mod state;
mod types;

pub use mem::MemLog;
pub use server::{Action, Event, Notification, Output, RaftConfig, RaftServer};
pub use state::{
    revert_reason_label, LeaderState, PeerProgress, PendingAck, PendingChange, PendingChangeKind,
    PendingInstall, PersistentState, Role, ServerState,
};
pub use types::{
    ApplyMeta, ClusterConfig, Command, Effect, EntryKind, GroupId, Index, LogEntry, LogStore,
    Machine, Message, NodeId, ProposalId, RaftError, RevertReason, RoleKind, ServerId, Term,
    TermLookup, Transport,
};
