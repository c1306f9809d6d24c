//! Node lifecycle and the group registry.
//!
//! One `Node` owns the two process-wide singletons (WAL writer, segment
//! writer) and the table of hosted groups. Startup order is fixed: recover
//! the WAL, start the segment writer, start the WAL writer, then let the
//! embedder re-create its groups; `finish_recovery` releases the surviving
//! sealed WAL files to the segment writer once every group is registered.
//! No group starts before both singletons are ready.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use cairn_raft::raft::{
    GroupId, LogStore, Machine, Message, NodeId, PersistentState, RaftConfig, RaftError, Transport,
};
use tokio::sync::oneshot;

use crate::group::{self, EffectRouter, GroupEvent, GroupHandle, NullRouter};
use crate::log::{GroupLog, HotCache};
use crate::meta::{self, MetaStore};
use crate::segment::{self, SegmentConfig, SegmentWriterHandle};
use crate::snapshot::SnapshotStore;
use crate::wal::{self, SealedWal, WalConfig, WalHandle, WalRecord};

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub root: PathBuf,
    pub node_id: NodeId,
    pub wal: WalConfig,
    pub segment: SegmentConfig,
    /// Group scheduler tick; election and heartbeat timers quantise to it.
    pub tick_interval: Duration,
    /// Client-facing call timeout on group handles.
    pub call_timeout: Duration,
    pub group_queue_depth: usize,
}

impl NodeConfig {
    pub fn new(root: impl Into<PathBuf>, node_id: NodeId) -> Self {
        let root = root.into();
        Self {
            wal: WalConfig::new(root.join("wal")),
            segment: SegmentConfig::new(root.join("segments")),
            root,
            node_id,
            tick_interval: Duration::from_millis(25),
            call_timeout: Duration::from_secs(5),
            group_queue_depth: 1024,
        }
    }
}

/// Per-group creation parameters. `raft` carries the tunables; its group and
/// node fields are overwritten by the node.
#[derive(Clone, Debug)]
pub struct GroupSpec {
    pub group: GroupId,
    pub initial_voters: Vec<NodeId>,
    /// True for a replica created by a join: it waits for leader contact
    /// instead of campaigning.
    pub awaiting: bool,
    pub raft: RaftConfig,
}

impl GroupSpec {
    pub fn new(group: GroupId, initial_voters: Vec<NodeId>) -> Self {
        Self {
            group,
            initial_voters,
            awaiting: false,
            raft: RaftConfig::default(),
        }
    }

    pub fn awaiting(mut self) -> Self {
        self.awaiting = true;
        self
    }
}

struct GroupEntry {
    group: GroupId,
    message_sink: Box<dyn Fn(NodeId, Message) -> bool + Send + Sync>,
    liveness_sink: Box<dyn Fn(NodeId, bool) + Send + Sync>,
    terminate: Box<dyn Fn(oneshot::Sender<()>) + Send + Sync>,
    join: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct NodeInner {
    groups: HashMap<u64, GroupEntry>,
    pending_records: HashMap<u64, Vec<WalRecord>>,
    pending_files: Vec<SealedWal>,
    recovery_finished: bool,
    failed_groups: Vec<(GroupId, String)>,
}

/// A running cairn node hosting many Raft groups.
pub struct Node {
    config: NodeConfig,
    wal: WalHandle,
    segments: SegmentWriterHandle,
    cache: Arc<HotCache>,
    transport: Arc<dyn Transport>,
    effects: Arc<dyn EffectRouter>,
    inner: Arc<Mutex<NodeInner>>,
    healthy: Arc<AtomicBool>,
}

impl Node {
    pub fn start(config: NodeConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        Self::start_with_effects(config, transport, Arc::new(NullRouter))
    }

    pub fn start_with_effects(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        effects: Arc<dyn EffectRouter>,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.root).context("create node root")?;
        fs::create_dir_all(config.root.join("meta")).context("create meta root")?;

        let recovery = wal::recover(&config.wal.dir)?;
        tracing::info!(
            node = config.node_id,
            files = recovery.files.len(),
            groups = recovery.records.len(),
            "wal recovered"
        );
        let segments = segment::start(config.segment.clone())?;
        let sealed_sink = {
            let segments = segments.clone();
            Box::new(move |sealed: SealedWal| segments.offer(sealed)) as wal::SealedSink
        };
        let wal = wal::start(config.wal.clone(), recovery.next_generation, sealed_sink)?;

        let inner = NodeInner {
            pending_records: recovery.records,
            pending_files: recovery.files,
            ..NodeInner::default()
        };
        Ok(Self {
            config,
            wal,
            segments,
            cache: Arc::new(HotCache::new()),
            transport,
            effects,
            inner: Arc::new(Mutex::new(inner)),
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Groups whose servers aborted, with the reason. The supervision
    /// channel for `log_corrupt`-class failures.
    pub fn failed_groups(&self) -> Vec<(GroupId, String)> {
        self.inner.lock().expect("node lock").failed_groups.clone()
    }

    /// Group ids found in the on-disk meta root; the embedder re-creates
    /// these before `finish_recovery`.
    pub fn recovered_groups(&self) -> Vec<GroupId> {
        let meta_root = self.config.root.join("meta");
        let mut out = Vec::new();
        let Ok(entries) = fs::read_dir(&meta_root) else {
            return out;
        };
        for dirent in entries.flatten() {
            if let Ok(group) = meta::read_group_id(&dirent.path()) {
                out.push(group);
            }
        }
        out
    }

    /// Host a group. For an existing group this replays its WAL records into
    /// the hot cache and resumes from segments, snapshot and meta.
    pub fn create_group<M: Machine>(
        &self,
        machine: Arc<M>,
        spec: GroupSpec,
    ) -> anyhow::Result<GroupHandle<M>> {
        let group = spec.group.clone();
        let hash = group.hash64();
        let dir_name = group.dir_name();

        {
            let inner = self.inner.lock().expect("node lock");
            if let Some(existing) = inner.groups.get(&hash) {
                anyhow::bail!(
                    "group hash collision or duplicate: {} vs {}",
                    existing.group,
                    group
                );
            }
        }

        let meta_store = MetaStore::open(self.config.root.join("meta").join(&dir_name), group.clone())?;
        let persistent = match meta_store.load()? {
            Some(state) => state,
            None => {
                let state = PersistentState::default();
                meta_store.save(&state)?;
                state
            }
        };

        let snapshots = SnapshotStore::open(self.config.root.join("snapshots").join(&dir_name))?;
        let restored = snapshots.recover()?;
        let snapshot_boundary = restored
            .as_ref()
            .map(|(meta, _)| (meta.last_index, meta.last_term))
            .unwrap_or((0, 0));

        let segment_dir = self.config.segment.root.join(&dir_name);
        let segment_files: Vec<PathBuf> = segment::list_segments(&segment_dir)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        let next_seq = segment::list_segments(&segment_dir)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);

        let records = {
            let mut inner = self.inner.lock().expect("node lock");
            inner.pending_records.remove(&hash).unwrap_or_default()
        };

        let log = GroupLog::recover(
            group.clone(),
            self.cache.clone(),
            self.wal.clone(),
            &segment_files,
            snapshot_boundary,
            &records,
        )?;
        let next_index = log.next_index();
        let last_segment = log.segment_top();

        let (tx, rx) = group::event_channel::<M>(self.config.group_queue_depth);

        // Both singletons learn about the group before its task can run.
        let wal_tx = tx.clone();
        self.wal.register_group(
            group.clone(),
            next_index,
            Box::new(move |notice| {
                // Durability notices are cumulative; a dropped one is covered
                // by the next. The writer must not block on a slow group.
                if wal_tx.try_send(GroupEvent::Wal(notice)).is_err() {
                    tracing::warn!("wal notice dropped, group queue full");
                }
            }),
        )?;
        let seg_tx = tx.clone();
        self.segments.register_group(
            group.clone(),
            segment_dir,
            next_seq,
            last_segment,
            Box::new(move |notice| {
                let _ = seg_tx.blocking_send(GroupEvent::Segment(notice));
            }),
        )?;

        let mut raft = spec.raft.clone();
        raft.group = group.clone();
        raft.node = self.config.node_id;
        raft.initial_voters = spec.initial_voters.clone();

        let on_fatal: Arc<dyn Fn(&GroupId, &str) + Send + Sync> = {
            let inner = self.inner.clone();
            let healthy = self.healthy.clone();
            Arc::new(move |group: &GroupId, reason: &str| {
                if reason.contains("wal unavailable") {
                    // A dead WAL takes the whole node with it.
                    healthy.store(false, Ordering::Relaxed);
                }
                let mut inner = inner.lock().expect("node lock");
                inner
                    .failed_groups
                    .push((group.clone(), reason.to_string()));
            })
        };

        let (handle, join) = group::spawn(
            group::GroupSpawn {
                raft,
                machine,
                transport: self.transport.clone(),
                effects: self.effects.clone(),
                log,
                meta: meta_store,
                snapshots,
                persistent,
                restored,
                awaiting: spec.awaiting,
                tick_interval: self.config.tick_interval,
                call_timeout: self.config.call_timeout,
                on_fatal,
            },
            tx.clone(),
            rx,
        )
        .map_err(|err| anyhow::anyhow!("spawn group: {err}"))?;

        let message_sink = handle.message_sink();
        let liveness_tx = tx.clone();
        let terminate_tx = tx;
        let entry = GroupEntry {
            group: group.clone(),
            message_sink,
            liveness_sink: Box::new(move |node, up| {
                let _ = liveness_tx.try_send(GroupEvent::Liveness { node, up });
            }),
            terminate: Box::new(move |done| {
                let _ = terminate_tx.try_send(GroupEvent::Terminate { done });
            }),
            join,
        };
        self.inner
            .lock()
            .expect("node lock")
            .groups
            .insert(hash, entry);
        tracing::info!(node = self.config.node_id, group = %group, "group created");
        Ok(handle)
    }

    /// Release surviving sealed WAL files to the segment writer. Call once
    /// every pre-existing group has been re-created; records for groups that
    /// no longer exist are dropped by the segment writer.
    pub fn finish_recovery(&self) {
        let files = {
            let mut inner = self.inner.lock().expect("node lock");
            if inner.recovery_finished {
                return;
            }
            inner.recovery_finished = true;
            inner.pending_records.clear();
            std::mem::take(&mut inner.pending_files)
        };
        for sealed in files {
            self.segments.offer(sealed);
        }
    }

    /// Route an inbound peer message to the hosted group, if any.
    pub fn deliver(&self, from: NodeId, group_hash: u64, message: Message) -> bool {
        let inner = self.inner.lock().expect("node lock");
        match inner.groups.get(&group_hash) {
            Some(entry) => (entry.message_sink)(from, message),
            None => false,
        }
    }

    /// Feed a liveness oracle transition to every hosted group.
    pub fn report_peer(&self, node: NodeId, up: bool) {
        let inner = self.inner.lock().expect("node lock");
        for entry in inner.groups.values() {
            (entry.liveness_sink)(node, up);
        }
    }

    /// Tear a group down: drain its server, then drop its segments, snapshot,
    /// meta and WAL registration.
    pub async fn delete_group(&self, group: &GroupId) -> Result<(), RaftError> {
        let hash = group.hash64();
        let entry = {
            let mut inner = self.inner.lock().expect("node lock");
            inner.groups.remove(&hash)
        };
        let Some(entry) = entry else {
            return Err(RaftError::LeaderUnknown);
        };
        let (done_tx, done_rx) = oneshot::channel();
        (entry.terminate)(done_tx);
        let _ = done_rx.await;
        let _ = entry.join.await;

        // Dead-letter the group's WAL stream so a restart (or a later group
        // under the same id) never replays it.
        let _ = self.wal.truncate(hash, 1, 0);
        let _ = self.wal.forget_group(hash);
        let _ = self.segments.forget_group(hash);
        self.cache.forget_group(hash);
        let dir_name = group.dir_name();
        let _ = fs::remove_dir_all(self.config.segment.root.join(&dir_name));
        let _ = fs::remove_dir_all(self.config.root.join("snapshots").join(&dir_name));
        let _ = fs::remove_dir_all(self.config.root.join("meta").join(&dir_name));
        tracing::info!(node = self.config.node_id, group = %group, "group deleted");
        Ok(())
    }

    /// Drain every group, then the WAL and segment writers. In-flight WAL
    /// appends are fsynced before the writers exit.
    pub async fn shutdown(self) {
        let entries: Vec<GroupEntry> = {
            let mut inner = self.inner.lock().expect("node lock");
            inner.groups.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            let (done_tx, _done_rx) = oneshot::channel();
            (entry.terminate)(done_tx);
        }
        futures_util::future::join_all(entries.into_iter().map(|entry| entry.join)).await;
        self.wal.shutdown();
        self.segments.shutdown();
        tracing::info!(node = self.config.node_id, "node shut down");
    }
}
