//! Multi-group Raft hosting.
//!
//! cairn_store turns the deterministic engine in `cairn_raft` into a running
//! node: one shared write-ahead log with a single fsync discipline, a segment
//! writer converting rolled WAL files into per-group immutable segments, a
//! per-group log façade with a hot in-memory tier, per-group snapshot and
//! meta stores, and one scheduled task per group driving consensus and the
//! apply loop. Start a [`Node`], create groups with your [`Machine`], and
//! propose through the returned [`GroupHandle`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use cairn_store::{Node, NodeConfig, GroupSpec, ChannelNetwork};
//! # use cairn_raft::raft::GroupId;
//! # async fn example(machine: Arc<impl cairn_raft::raft::Machine>) -> anyhow::Result<()> {
//! let network = ChannelNetwork::new();
//! let node = Node::start(NodeConfig::new("/var/lib/cairn", 1), network.transport(1))?;
//! let group = GroupId::new(&b"orders"[..]);
//! let handle = node.create_group(machine, GroupSpec::new(group, vec![1]))?;
//! network.attach(1, &handle);
//! node.finish_recovery();
//! let reply = handle.propose(&b"put k v"[..]).await?;
//! # Ok(()) }
//! ```

pub mod group;
pub mod log;
pub mod meta;
pub mod node;
pub mod segment;
pub mod snapshot;
pub mod transport;
pub mod wal;

pub use cairn_raft::raft::{
    ApplyMeta, ClusterConfig, Effect, GroupId, Index, LogEntry, Machine, NodeId, RaftConfig,
    RaftError, RevertReason, RoleKind, ServerId, Term, Transport,
};
pub use group::{EffectRouter, GroupHandle, MembershipOutcome, NullRouter};
pub use node::{GroupSpec, Node, NodeConfig};
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use transport::{ChannelNetwork, ChannelTransport};
pub use wal::{WalConfig, WalNotice};
