//! In-process transport.
//!
//! A channel-backed mesh connecting the nodes of one process: used by the
//! integration tests and by embedders running whole clusters in a single
//! binary. Messages to a partitioned node are silently dropped, which is
//! exactly what the consensus layer must tolerate from a real network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cairn_raft::raft::{Machine, Message, NodeId, ServerId, Transport};

use crate::group::GroupHandle;

#[derive(Default)]
struct Mesh {
    /// `(group_hash, node) -> inbound sink`.
    sinks: HashMap<(u64, NodeId), Box<dyn Fn(NodeId, Message) -> bool + Send + Sync>>,
    partitioned: HashSet<NodeId>,
}

/// Shared routing table for a process-local cluster.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    mesh: Arc<RwLock<Mesh>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport facade for one node of the mesh.
    pub fn transport(&self, node: NodeId) -> Arc<ChannelTransport> {
        Arc::new(ChannelTransport {
            node,
            mesh: self.mesh.clone(),
        })
    }

    /// Route a group's inbound messages through this mesh.
    pub fn attach<M: Machine>(&self, node: NodeId, handle: &GroupHandle<M>) {
        let mut mesh = self.mesh.write().expect("mesh lock");
        mesh.sinks
            .insert((handle.group().hash64(), node), handle.message_sink());
    }

    /// Cut a node off in both directions.
    pub fn partition(&self, node: NodeId) {
        let mut mesh = self.mesh.write().expect("mesh lock");
        mesh.partitioned.insert(node);
        tracing::debug!(node, "partitioned");
    }

    pub fn heal(&self, node: NodeId) {
        let mut mesh = self.mesh.write().expect("mesh lock");
        mesh.partitioned.remove(&node);
        tracing::debug!(node, "healed");
    }

    pub fn detach(&self, node: NodeId, group_hash: u64) {
        let mut mesh = self.mesh.write().expect("mesh lock");
        mesh.sinks.remove(&(group_hash, node));
    }
}

pub struct ChannelTransport {
    node: NodeId,
    mesh: Arc<RwLock<Mesh>>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(
        &self,
        from: NodeId,
        target: ServerId,
        message: Message,
    ) -> anyhow::Result<()> {
        debug_assert_eq!(from, self.node);
        let mesh = self.mesh.read().expect("mesh lock");
        if mesh.partitioned.contains(&from) || mesh.partitioned.contains(&target.node) {
            return Ok(());
        }
        match mesh.sinks.get(&(target.group.hash64(), target.node)) {
            Some(sink) => {
                sink(from, message);
                Ok(())
            }
            // Unknown peers look like a lossy network, not an error.
            None => Ok(()),
        }
    }
}
