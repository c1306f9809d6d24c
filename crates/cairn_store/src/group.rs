//! Per-group scheduling and the apply loop.
//!
//! Each hosted group runs as one tokio task with a single-consumer event
//! queue: peer messages, client proposals, ticks, WAL durability notices,
//! segment notices and liveness transitions are serialised here and fed to
//! the deterministic server one at a time. The task performs the server's
//! requested actions (persist term/vote, apply committed entries, stream
//! snapshots) and executes state-machine effects, which run only while this
//! server is leader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use cairn_raft::raft::{
    Action, ApplyMeta, ClusterConfig, Command, Effect, EntryKind, Event, GroupId, Index, LogStore,
    Machine, Message, NodeId, Notification, Output, PersistentState, ProposalId, RaftConfig,
    RaftError, RaftServer, RevertReason, RoleKind, ServerId, Transport,
};
use tokio::sync::{mpsc, oneshot};

use crate::log::GroupLog;
use crate::meta::MetaStore;
use crate::segment::SegmentNotice;
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use crate::wal::WalNotice;

/// How a join/leave proposal ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipOutcome {
    Done,
    Reverted { reason: RevertReason },
}

/// Host hooks for effects the engine cannot interpret itself. The effect set
/// is closed; hosts that do not care keep the defaults.
pub trait EffectRouter: Send + Sync + 'static {
    fn send_msg(&self, _target: &ServerId, _payload: &[u8]) {}
    fn monitor(&self, _node: NodeId) {}
    fn demonitor(&self, _node: NodeId) {}
    fn mod_call(&self, _module: &str, _function: &str, _args: &[Bytes]) {}
    fn aux(&self, _cmd: &[u8]) {}
}

/// Default router: external effects are dropped with a trace.
pub struct NullRouter;

impl EffectRouter for NullRouter {}

type ReplyTx = oneshot::Sender<Result<Bytes, RaftError>>;
type MembershipTx = oneshot::Sender<Result<MembershipOutcome, RaftError>>;
type QueryFn<S> = Box<dyn FnOnce(&S) -> Bytes + Send>;

pub(crate) enum GroupEvent<M: Machine> {
    Message {
        from: NodeId,
        message: Message,
    },
    Propose {
        command: Bytes,
        reply: ReplyTx,
    },
    Membership {
        command: Command,
        reply: MembershipTx,
    },
    Query {
        run: QueryFn<M::State>,
        reply: ReplyTx,
    },
    Wal(WalNotice),
    Segment(SegmentNotice),
    Liveness {
        node: NodeId,
        up: bool,
    },
    TimerFired {
        name: String,
    },
    Terminate {
        done: oneshot::Sender<()>,
    },
}

/// Caller-facing handle to one hosted group.
pub struct GroupHandle<M: Machine> {
    group: GroupId,
    tx: mpsc::Sender<GroupEvent<M>>,
    call_timeout: Duration,
}

impl<M: Machine> Clone for GroupHandle<M> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            tx: self.tx.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<M: Machine> GroupHandle<M> {
    pub fn group(&self) -> &GroupId {
        &self.group
    }

    /// Propose a user command; resolves with the state machine's reply once
    /// the entry is committed and applied on this server.
    pub async fn propose(&self, command: impl Into<Bytes>) -> Result<Bytes, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(GroupEvent::Propose {
            command: command.into(),
            reply,
        })
        .await?;
        self.wait(rx).await?
    }

    pub async fn join(&self, node: NodeId) -> Result<MembershipOutcome, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(GroupEvent::Membership {
            command: Command::Join { node },
            reply,
        })
        .await?;
        self.wait(rx).await?
    }

    pub async fn leave(&self, node: NodeId) -> Result<MembershipOutcome, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(GroupEvent::Membership {
            command: Command::Leave { node },
            reply,
        })
        .await?;
        self.wait(rx).await?
    }

    /// Linearizable read: runs on the leader against applied state after the
    /// read barrier is reached.
    pub async fn query<F>(&self, run: F) -> Result<Bytes, RaftError>
    where
        F: FnOnce(&M::State) -> Bytes + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(GroupEvent::Query {
            run: Box::new(run),
            reply,
        })
        .await?;
        self.wait(rx).await?
    }

    async fn send(&self, event: GroupEvent<M>) -> Result<(), RaftError> {
        self.tx.send(event).await.map_err(|_| RaftError::Timeout)
    }

    async fn wait<T>(&self, rx: oneshot::Receiver<Result<T, RaftError>>) -> Result<Result<T, RaftError>, RaftError> {
        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RaftError::Timeout),
            Err(_) => Err(RaftError::Timeout),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<GroupEvent<M>> {
        self.tx.clone()
    }

    /// Type-erased inbound message sink for transports.
    pub(crate) fn message_sink(&self) -> Box<dyn Fn(NodeId, Message) -> bool + Send + Sync> {
        let tx = self.tx.clone();
        Box::new(move |from, message| tx.try_send(GroupEvent::Message { from, message }).is_ok())
    }
}

pub(crate) struct GroupSpawn<M: Machine> {
    pub raft: RaftConfig,
    pub machine: Arc<M>,
    pub transport: Arc<dyn Transport>,
    pub effects: Arc<dyn EffectRouter>,
    pub log: GroupLog,
    pub meta: MetaStore,
    pub snapshots: SnapshotStore,
    pub persistent: PersistentState,
    pub restored: Option<(SnapshotMeta, Bytes)>,
    pub awaiting: bool,
    pub tick_interval: Duration,
    pub call_timeout: Duration,
    pub on_fatal: Arc<dyn Fn(&GroupId, &str) + Send + Sync>,
}

/// Build the event channel for a group before spawning it, so the WAL and
/// segment writers can be pointed at the queue first.
pub(crate) fn event_channel<M: Machine>(
    depth: usize,
) -> (mpsc::Sender<GroupEvent<M>>, mpsc::Receiver<GroupEvent<M>>) {
    mpsc::channel(depth.max(16))
}

pub(crate) fn spawn<M: Machine>(
    opts: GroupSpawn<M>,
    tx: mpsc::Sender<GroupEvent<M>>,
    rx: mpsc::Receiver<GroupEvent<M>>,
) -> Result<(GroupHandle<M>, tokio::task::JoinHandle<()>), RaftError> {
    let group = opts.raft.group.clone();

    let restored_config = opts
        .restored
        .as_ref()
        .map(|(meta, _)| meta.cluster_config.clone());
    let server = RaftServer::new(
        opts.raft.clone(),
        opts.log,
        opts.persistent,
        restored_config,
        opts.awaiting,
        0,
    )?;

    let machine = opts.machine;
    let state = match &opts.restored {
        Some((_, data)) => machine.restore(data).map_err(|err| RaftError::LogCorrupt {
            reason: format!("restore snapshot: {err}"),
        })?,
        None => machine.init(),
    };
    let last_applied = opts
        .restored
        .as_ref()
        .map(|(meta, _)| meta.last_index)
        .unwrap_or(0);

    let mut task = GroupTask {
        group: group.clone(),
        node: opts.raft.node,
        server,
        machine,
        state,
        last_applied,
        transport: opts.transport,
        effects: opts.effects,
        meta: opts.meta,
        snapshots: opts.snapshots,
        self_tx: tx.clone(),
        next_pid: 1,
        pending: HashMap::new(),
        pending_apply: HashMap::new(),
        pid_index: HashMap::new(),
        waiting_queries: Vec::new(),
        started: Instant::now(),
        machine_tick_due: Duration::ZERO,
        terminate_done: None,
        on_fatal: opts.on_fatal,
    };
    let tick_interval = opts.tick_interval;
    let handle = GroupHandle {
        group,
        tx,
        call_timeout: opts.call_timeout,
    };
    let join = tokio::spawn(async move { task.run(rx, tick_interval).await });
    Ok((handle, join))
}

enum Pending<M: Machine> {
    Apply(ReplyTx),
    Membership(MembershipTx),
    Query { run: QueryFn<M::State>, reply: ReplyTx },
}

struct GroupTask<M: Machine> {
    group: GroupId,
    node: NodeId,
    server: RaftServer<GroupLog>,
    machine: Arc<M>,
    state: M::State,
    last_applied: Index,
    transport: Arc<dyn Transport>,
    effects: Arc<dyn EffectRouter>,
    meta: MetaStore,
    snapshots: SnapshotStore,
    self_tx: mpsc::Sender<GroupEvent<M>>,
    next_pid: u64,
    pending: HashMap<ProposalId, Pending<M>>,
    pending_apply: HashMap<Index, (ProposalId, ReplyTx)>,
    pid_index: HashMap<ProposalId, Index>,
    waiting_queries: Vec<(Index, QueryFn<M::State>, ReplyTx)>,
    started: Instant,
    machine_tick_due: Duration,
    terminate_done: Option<oneshot::Sender<()>>,
    on_fatal: Arc<dyn Fn(&GroupId, &str) + Send + Sync>,
}

const MACHINE_TICK_EVERY: Duration = Duration::from_secs(1);

impl<M: Machine> GroupTask<M> {
    async fn run(&mut self, mut rx: mpsc::Receiver<GroupEvent<M>>, tick_interval: Duration) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(group = %self.group, node = self.node, "group started");

        loop {
            let stop = tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => self.on_event(event).await,
                    None => true,
                },
                _ = ticker.tick() => self.on_tick().await,
            };
            if stop {
                break;
            }
        }
        if let Some(done) = self.terminate_done.take() {
            let _ = done.send(());
        }
        tracing::info!(group = %self.group, node = self.node, "group stopped");
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn on_tick(&mut self) -> bool {
        let now = self.now_ms();
        let stop = self.step(Event::Tick { now_ms: now }).await;
        if self.started.elapsed() >= self.machine_tick_due {
            self.machine_tick_due = self.started.elapsed() + MACHINE_TICK_EVERY;
            let effects = self.machine.tick(wall_clock_ms(), &self.state);
            self.run_effects(effects);
        }
        stop
    }

    async fn on_event(&mut self, event: GroupEvent<M>) -> bool {
        match event {
            GroupEvent::Message { from, message } => {
                self.step(Event::Message { from, message }).await
            }
            GroupEvent::Propose { command, reply } => {
                let id = self.assign_pid();
                self.pending.insert(id, Pending::Apply(reply));
                self.step(Event::Propose {
                    id,
                    command: Command::User(command),
                })
                .await
            }
            GroupEvent::Membership { command, reply } => {
                let id = self.assign_pid();
                self.pending.insert(id, Pending::Membership(reply));
                self.step(Event::Propose { id, command }).await
            }
            GroupEvent::Query { run, reply } => {
                let id = self.assign_pid();
                self.pending.insert(id, Pending::Query { run, reply });
                self.step(Event::Propose {
                    id,
                    command: Command::Query,
                })
                .await
            }
            GroupEvent::Wal(WalNotice::Durable { epoch, up_to_index }) => {
                if epoch != self.server.log().wal_epoch() {
                    // Notice from before a truncation rewind.
                    return false;
                }
                self.step(Event::WalDurable {
                    up_to_index,
                })
                .await
            }
            GroupEvent::Wal(WalNotice::Fatal { reason }) => {
                self.fatal(&format!("wal: {reason}"));
                true
            }
            GroupEvent::Segment(notice) => {
                self.server.log_mut().apply_segment_notice(&notice);
                false
            }
            GroupEvent::Liveness { node, up } => {
                self.step(Event::PeerLiveness { node, up }).await
            }
            GroupEvent::TimerFired { name } => {
                tracing::debug!(group = %self.group, timer = %name, "timer fired");
                let effects = self.machine.tick(wall_clock_ms(), &self.state);
                self.run_effects(effects);
                false
            }
            GroupEvent::Terminate { done } => {
                self.terminate_done = Some(done);
                self.step(Event::Terminate).await
            }
        }
    }

    fn assign_pid(&mut self) -> ProposalId {
        let id = ProposalId(self.next_pid);
        self.next_pid += 1;
        id
    }

    /// Feed one event to the server and perform its output. Returns true when
    /// the group should stop.
    async fn step(&mut self, event: Event) -> bool {
        let output = match self.server.handle(event) {
            Ok(output) => output,
            Err(err) => {
                self.fatal(&err.to_string());
                return true;
            }
        };
        self.perform(output).await
    }

    async fn perform(&mut self, output: Output) -> bool {
        let mut stop = false;
        for action in output.actions {
            match action {
                Action::PersistTermVote { term, voted_for } => {
                    let state = PersistentState {
                        current_term: term,
                        voted_for,
                    };
                    if let Err(err) = self.meta.save(&state) {
                        // Without a durable vote nothing we send is safe.
                        self.fatal(&format!("persist term/vote: {err}"));
                        return true;
                    }
                }
                Action::CommitTo { index } => self.apply_up_to(index),
                Action::SendSnapshot { to } => self.stream_snapshot(to),
                Action::InstallSnapshot {
                    last_index,
                    last_term,
                    cluster_config,
                    data,
                } => {
                    if let Err(err) =
                        self.install_snapshot(last_index, last_term, cluster_config, &data)
                    {
                        self.fatal(&format!("install snapshot: {err}"));
                        return true;
                    }
                }
                Action::Notify { id, outcome } => self.resolve(id, outcome),
                Action::RoleChanged { role } => {
                    tracing::info!(group = %self.group, node = self.node, ?role, "role changed");
                    let effects = self.machine.state_enter(role, &self.state);
                    self.run_effects(effects);
                    if role != RoleKind::Leader {
                        self.fail_pending(RaftError::NotLeader {
                            hint: self.server.leader_hint(),
                        });
                    }
                }
                Action::Stopped => {
                    stop = true;
                }
            }
        }
        for (to, message) in output.messages {
            let target = ServerId::new(self.group.clone(), to);
            if let Err(err) = self.transport.send(self.node, target, message).await {
                tracing::debug!(group = %self.group, to, error = %err, "send failed");
            }
        }
        stop
    }

    fn resolve(&mut self, id: ProposalId, outcome: Result<Notification, RaftError>) {
        match outcome {
            Ok(Notification::Accepted { index }) => {
                if let Some(Pending::Apply(reply)) = self.pending.remove(&id) {
                    self.pending_apply.insert(index, (id, reply));
                    self.pid_index.insert(id, index);
                }
            }
            Ok(Notification::ReadReady { barrier }) => {
                if let Some(Pending::Query { run, reply }) = self.pending.remove(&id) {
                    if self.last_applied >= barrier {
                        let result = run(&self.state);
                        let _ = reply.send(Ok(result));
                    } else {
                        self.waiting_queries.push((barrier, run, reply));
                    }
                }
            }
            Ok(Notification::MembershipDone { .. }) => {
                if let Some(Pending::Membership(reply)) = self.pending.remove(&id) {
                    let _ = reply.send(Ok(MembershipOutcome::Done));
                }
            }
            Ok(Notification::MembershipReverted { reason, .. }) => {
                if let Some(Pending::Membership(reply)) = self.pending.remove(&id) {
                    let _ = reply.send(Ok(MembershipOutcome::Reverted { reason }));
                }
            }
            Err(err) => match self.pending.remove(&id) {
                Some(Pending::Apply(reply)) => {
                    let _ = reply.send(Err(err));
                }
                Some(Pending::Membership(reply)) => {
                    let _ = reply.send(Err(err));
                }
                Some(Pending::Query { reply, .. }) => {
                    let _ = reply.send(Err(err));
                }
                None => {
                    if let Some(index) = self.pid_index.remove(&id) {
                        if let Some((_, reply)) = self.pending_apply.remove(&index) {
                            let _ = reply.send(Err(err));
                        }
                    }
                }
            },
        }
    }

    /// The apply loop: advance `last_applied` toward the commit index,
    /// invoking the user machine in index order, exactly once per index.
    fn apply_up_to(&mut self, target: Index) {
        let target = target.min(self.server.commit_index());
        while self.last_applied < target {
            let index = self.last_applied + 1;
            let entry = match self.server.log().fetch(index) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.fatal(&format!("committed entry {index} unreadable"));
                    return;
                }
                Err(err) => {
                    self.fatal(&format!("fetch {index}: {err}"));
                    return;
                }
            };
            match entry.kind {
                EntryKind::UserCommand => {
                    let correlated = self.pending_apply.remove(&index);
                    let from = correlated.as_ref().map(|(id, _)| *id);
                    let meta = ApplyMeta {
                        index,
                        term: entry.term,
                        system_time_ms: wall_clock_ms(),
                        from,
                    };
                    let (reply, effects) =
                        self.machine.apply(&meta, &entry.payload, &mut self.state);
                    self.last_applied = index;
                    if let Some((id, tx)) = correlated {
                        self.pid_index.remove(&id);
                        let _ = tx.send(Ok(reply));
                    }
                    // Effects run only on the leader at the moment of apply;
                    // a demoted server drops them.
                    self.run_effects(effects);
                }
                EntryKind::Noop | EntryKind::ClusterConfig => self.last_applied = index,
                EntryKind::Truncate => {
                    self.fatal("truncate marker in logical log");
                    return;
                }
            }
        }
        self.flush_ready_queries();
    }

    fn flush_ready_queries(&mut self) {
        if self.waiting_queries.is_empty() {
            return;
        }
        let applied = self.last_applied;
        let mut still_waiting = Vec::new();
        for (barrier, run, reply) in self.waiting_queries.drain(..) {
            if applied >= barrier {
                let result = run(&self.state);
                let _ = reply.send(Ok(result));
            } else {
                still_waiting.push((barrier, run, reply));
            }
        }
        self.waiting_queries = still_waiting;
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        if !self.server.role().is_leader() {
            tracing::trace!(group = %self.group, count = effects.len(), "effects dropped");
            return;
        }
        for effect in effects {
            match effect {
                Effect::SendMsg { target, payload } => self.effects.send_msg(&target, &payload),
                Effect::Monitor { node } => self.effects.monitor(node),
                Effect::Demonitor { node } => self.effects.demonitor(node),
                Effect::Notify { to, reply } => {
                    if let Some(index) = self.pid_index.remove(&to) {
                        if let Some((_, tx)) = self.pending_apply.remove(&index) {
                            let _ = tx.send(Ok(reply));
                        }
                    }
                }
                Effect::ModCall {
                    module,
                    function,
                    args,
                } => self.effects.mod_call(&module, &function, &args),
                Effect::ReleaseCursor { index } => self.release_cursor(index),
                Effect::Checkpoint { index } => self.write_checkpoint(index),
                Effect::Snapshot { index } => self.write_snapshot(index),
                Effect::Timer { name, after_ms } => {
                    let tx = self.self_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(after_ms)).await;
                        let _ = tx.send(GroupEvent::TimerFired { name }).await;
                    });
                }
                Effect::Aux { cmd } => self.effects.aux(&cmd),
            }
        }
    }

    /// Physically free log prefix, guarded by a durable snapshot at or past
    /// the cursor. The cursor is what commits to log deletion, so a
    /// checkpoint covering it is promoted into the live slot here.
    fn release_cursor(&mut self, index: Index) {
        let mut covering = match self.snapshots.latest_meta() {
            Ok(Some(meta)) if meta.last_index >= index => Some(meta),
            Ok(_) => None,
            Err(err) => {
                tracing::error!(group = %self.group, error = ?err, "snapshot meta read failed");
                return;
            }
        };
        if covering.is_none() {
            covering = match self.snapshots.promote_checkpoint(index) {
                Ok(found) => found,
                Err(err) => {
                    tracing::error!(group = %self.group, error = ?err, "checkpoint promote failed");
                    None
                }
            };
        }
        if covering.is_none() {
            tracing::debug!(
                group = %self.group,
                index,
                "release cursor ignored, no durable snapshot covers it"
            );
            return;
        }
        let term = match self.server.log().fetch_term(index) {
            cairn_raft::raft::TermLookup::Term(t) => t,
            _ => return,
        };
        self.server.log_mut().update_release_cursor(index, term);
    }

    /// Bound apply-side recovery work without committing to log deletion:
    /// like `write_snapshot`, the checkpoint captures the state as of
    /// `last_applied`, but it stays in the checkpoint slot until a release
    /// cursor promotes it.
    fn write_checkpoint(&mut self, _index: Index) {
        if self.last_applied == 0 {
            return;
        }
        let data = self.machine.snapshot(&self.state);
        let (last_term, config) = self.boundary(self.last_applied);
        match self.snapshots.write_checkpoint(
            self.last_applied,
            last_term,
            config,
            self.machine.version(),
            &data,
        ) {
            Ok(meta) => {
                tracing::debug!(group = %self.group, index = meta.last_index, "checkpoint written")
            }
            Err(err) => tracing::error!(group = %self.group, error = ?err, "checkpoint failed"),
        }
    }

    fn write_snapshot(&mut self, index: Index) {
        let index = index.min(self.last_applied);
        if index == 0 {
            return;
        }
        let data = self.machine.snapshot(&self.state);
        let (last_term, config) = self.boundary(self.last_applied);
        let written = self
            .snapshots
            .write(
                self.last_applied,
                last_term,
                config,
                self.machine.version(),
                &data,
            )
            .and_then(|pending| self.snapshots.promote(pending));
        match written {
            Ok(meta) => {
                self.server
                    .log_mut()
                    .update_release_cursor(meta.last_index, meta.last_term);
            }
            Err(err) => tracing::error!(group = %self.group, error = ?err, "snapshot failed"),
        }
    }

    fn boundary(&self, index: Index) -> (u64, ClusterConfig) {
        let term = match self.server.log().fetch_term(index) {
            cairn_raft::raft::TermLookup::Term(t) => t,
            _ => self.server.log().snapshot_last().1,
        };
        (term, self.server.cluster_config().clone())
    }

    /// Leader side of scenario: stream the promoted snapshot to a follower
    /// that fell behind the boundary. Chunks ride the ordered transport; the
    /// follower replies once, after `done`.
    fn stream_snapshot(&mut self, to: NodeId) {
        let (meta, data) = match self.snapshots.recover() {
            Ok(Some(found)) => found,
            Ok(None) => {
                tracing::warn!(group = %self.group, to, "no snapshot to stream");
                return;
            }
            Err(err) => {
                tracing::error!(group = %self.group, error = ?err, "snapshot read failed");
                return;
            }
        };
        let transport = self.transport.clone();
        let target = ServerId::new(self.group.clone(), to);
        let from = self.node;
        let term = self.server.current_term();
        let leader_id = self.node;
        let chunk_bytes = self.server.config().snapshot_chunk_bytes.max(1);
        tokio::spawn(async move {
            let total = data.len();
            let mut offset = 0usize;
            loop {
                let end = (offset + chunk_bytes).min(total);
                let done = end >= total;
                let message = Message::InstallSnapshot {
                    term,
                    leader_id,
                    last_index: meta.last_index,
                    last_term: meta.last_term,
                    cluster_config: meta.cluster_config.clone(),
                    offset: offset as u64,
                    data: data.slice(offset..end),
                    done,
                };
                if transport.send(from, target.clone(), message).await.is_err() {
                    break;
                }
                if done {
                    break;
                }
                offset = end;
            }
        });
    }

    fn install_snapshot(
        &mut self,
        last_index: Index,
        last_term: u64,
        cluster_config: ClusterConfig,
        data: &Bytes,
    ) -> anyhow::Result<()> {
        self.snapshots.install(
            last_index,
            last_term,
            cluster_config,
            self.machine.version(),
            data,
        )?;
        self.state = self.machine.restore(data)?;
        self.last_applied = last_index;
        // Anything we promised before the reset is gone.
        self.fail_pending(RaftError::Timeout);
        tracing::info!(
            group = %self.group,
            index = last_index,
            term = last_term,
            "peer snapshot installed"
        );
        Ok(())
    }

    fn fail_pending(&mut self, err: RaftError) {
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Apply(reply) => {
                    let _ = reply.send(Err(err.clone()));
                }
                Pending::Membership(reply) => {
                    let _ = reply.send(Err(err.clone()));
                }
                Pending::Query { reply, .. } => {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }
        for (_, (_, reply)) in self.pending_apply.drain() {
            let _ = reply.send(Err(err.clone()));
        }
        self.pid_index.clear();
        for (_, _, reply) in self.waiting_queries.drain(..) {
            let _ = reply.send(Err(err.clone()));
        }
    }

    fn fatal(&mut self, reason: &str) {
        tracing::error!(group = %self.group, node = self.node, reason, "group fatal");
        self.fail_pending(RaftError::LogCorrupt {
            reason: reason.to_string(),
        });
        (self.on_fatal)(&self.group, reason);
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
