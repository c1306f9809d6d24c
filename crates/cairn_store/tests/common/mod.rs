//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use cairn_raft::raft::{ApplyMeta, Effect, GroupId, Machine, NodeId, RaftConfig};
use cairn_store::{ChannelNetwork, GroupHandle, GroupSpec, Node, NodeConfig, RaftError};

/// Timeout for cluster-level convergence waits.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(20);

/// A tiny replicated KV machine. Commands are `put <key> <value>`; the reply
/// is `ok`. `mirror` exposes the applied state to assertions and `applied`
/// records every `(index, command)` in apply order.
pub struct KvMachine {
    pub mirror: Arc<Mutex<HashMap<String, String>>>,
    pub applied: Arc<Mutex<Vec<(u64, String)>>>,
    /// Emit a snapshot effect every N applies, exercising compaction.
    pub snapshot_every: Option<u64>,
    /// Emit a checkpoint effect every N applies, plus a release cursor one
    /// window behind it, exercising checkpoint promotion.
    pub checkpoint_every: Option<u64>,
}

impl KvMachine {
    pub fn new() -> Self {
        Self {
            mirror: Arc::new(Mutex::new(HashMap::new())),
            applied: Arc::new(Mutex::new(Vec::new())),
            snapshot_every: None,
            checkpoint_every: None,
        }
    }

    pub fn with_snapshot_every(every: u64) -> Self {
        Self {
            snapshot_every: Some(every),
            ..Self::new()
        }
    }

    pub fn with_checkpoint_every(every: u64) -> Self {
        Self {
            checkpoint_every: Some(every),
            ..Self::new()
        }
    }
}

impl Machine for KvMachine {
    type State = HashMap<String, String>;

    fn init(&self) -> Self::State {
        HashMap::new()
    }

    fn apply(
        &self,
        meta: &ApplyMeta,
        command: &[u8],
        state: &mut Self::State,
    ) -> (Bytes, Vec<Effect>) {
        let text = String::from_utf8_lossy(command).to_string();
        let mut parts = text.splitn(3, ' ');
        if let (Some("put"), Some(key), Some(value)) = (parts.next(), parts.next(), parts.next()) {
            state.insert(key.to_string(), value.to_string());
            self.mirror
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }
        self.applied.lock().unwrap().push((meta.index, text));

        let mut effects = Vec::new();
        if let Some(every) = self.snapshot_every {
            if meta.index % every == 0 {
                effects.push(Effect::Snapshot { index: meta.index });
            }
        }
        if let Some(every) = self.checkpoint_every {
            if meta.index % every == 0 {
                effects.push(Effect::Checkpoint { index: meta.index });
                if meta.index >= every * 2 {
                    // The previous window is no longer needed for recovery.
                    effects.push(Effect::ReleaseCursor {
                        index: meta.index - every,
                    });
                }
            }
        }
        (Bytes::from_static(b"ok"), effects)
    }

    fn snapshot(&self, state: &Self::State) -> Bytes {
        Bytes::from(serde_json::to_vec(state).expect("serialize state"))
    }

    fn restore(&self, data: &[u8]) -> anyhow::Result<Self::State> {
        let state: Self::State = serde_json::from_slice(data)?;
        *self.mirror.lock().unwrap() = state.clone();
        Ok(state)
    }
}

pub struct TestCluster {
    pub network: ChannelNetwork,
    pub nodes: Vec<Node>,
    pub handles: Vec<GroupHandle<KvMachine>>,
    pub machines: Vec<Arc<KvMachine>>,
    pub group: GroupId,
}

/// Fast timers for tests; verification windows short enough to observe.
pub fn test_raft_config() -> RaftConfig {
    RaftConfig {
        membership_check_interval_ms: 100,
        membership_timeout_ms: 800,
        ..RaftConfig::default()
    }
}

/// Stand up one group replicated across `voters` in-process nodes.
pub fn build_cluster(root: &std::path::Path, voters: &[NodeId]) -> anyhow::Result<TestCluster> {
    init_tracing();
    let network = ChannelNetwork::new();
    let group = GroupId::new(&b"kv"[..]);
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    let mut machines = Vec::new();
    for &node_id in voters {
        let mut config = NodeConfig::new(root.join(format!("n{node_id}")), node_id);
        config.call_timeout = Duration::from_secs(2);
        let node = Node::start(config, network.transport(node_id))?;
        let machine = Arc::new(KvMachine::new());
        let mut spec = GroupSpec::new(group.clone(), voters.to_vec());
        spec.raft = test_raft_config();
        let handle = node.create_group(machine.clone(), spec)?;
        network.attach(node_id, &handle);
        node.finish_recovery();
        nodes.push(node);
        handles.push(handle);
        machines.push(machine);
    }
    Ok(TestCluster {
        network,
        nodes,
        handles,
        machines,
        group,
    })
}

/// Propose through whichever replica currently leads, retrying around
/// elections. Panics after the convergence timeout.
pub async fn propose_anywhere(
    handles: &[GroupHandle<KvMachine>],
    command: &str,
) -> (usize, Bytes) {
    let deadline = Instant::now() + CONVERGE_TIMEOUT;
    loop {
        for (slot, handle) in handles.iter().enumerate() {
            match handle.propose(command.as_bytes().to_vec()).await {
                Ok(reply) => return (slot, reply),
                Err(RaftError::NotLeader { .. })
                | Err(RaftError::LeaderUnknown)
                | Err(RaftError::Timeout) => {}
                Err(err) => panic!("propose failed: {err}"),
            }
        }
        if Instant::now() >= deadline {
            panic!("no leader accepted `{command}` within the timeout");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll until `check` passes or the convergence timeout expires.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + CONVERGE_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
