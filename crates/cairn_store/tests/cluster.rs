//! In-process cluster scenarios over the channel transport.
//!
//! Test flow:
//! 1) Start three nodes in one process, each hosting a replica of one KV
//!    group, wired through `ChannelNetwork`.
//! 2) Drive client traffic through the group handles and fault the network
//!    with partitions.
//! 3) Assert on replies and on each replica's applied-state mirror.
//!
//! Failure model covered: leader loss by partition, stale-leader reattach,
//! join verification against an absent server, snapshot catch-up for a
//! late-joining replica.

mod common;

use std::time::Duration;

use common::{build_cluster, propose_anywhere, wait_until, KvMachine};

use cairn_store::{GroupSpec, MembershipOutcome, Node, NodeConfig, RevertReason};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_replicates_to_every_member() {
    let root = tempfile::tempdir().unwrap();
    let cluster = build_cluster(root.path(), &[1, 2, 3]).unwrap();

    let (_, reply) = propose_anywhere(&cluster.handles, "put color green").await;
    assert_eq!(&reply[..], b"ok");

    // Followers apply on their own commit advance; all mirrors converge.
    wait_until("mirrors to converge", || {
        cluster.machines.iter().all(|machine| {
            machine.mirror.lock().unwrap().get("color").map(String::as_str) == Some("green")
        })
    })
    .await;

    // Exactly one apply of the command per replica.
    for machine in &cluster.machines {
        let applied = machine.applied.lock().unwrap();
        assert_eq!(
            applied
                .iter()
                .filter(|(_, cmd)| cmd == "put color green")
                .count(),
            1
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queries_read_applied_state_on_the_leader() {
    let root = tempfile::tempdir().unwrap();
    let cluster = build_cluster(root.path(), &[1, 2, 3]).unwrap();

    let (leader_slot, _) = propose_anywhere(&cluster.handles, "put lang rust").await;
    let value = cluster.handles[leader_slot]
        .query(|state| {
            bytes::Bytes::from(state.get("lang").cloned().unwrap_or_default().into_bytes())
        })
        .await
        .unwrap();
    assert_eq!(&value[..], b"rust");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_partition_fails_over_and_heals() {
    let root = tempfile::tempdir().unwrap();
    let cluster = build_cluster(root.path(), &[1, 2, 3]).unwrap();

    let (leader_slot, _) = propose_anywhere(&cluster.handles, "put step one").await;
    let leader_node = cluster.nodes[leader_slot].node_id();

    cluster.network.partition(leader_node);
    // The liveness oracle accelerates failover; safety never depends on it.
    for node in &cluster.nodes {
        node.report_peer(leader_node, false);
    }

    let survivors: Vec<_> = cluster
        .handles
        .iter()
        .enumerate()
        .filter(|(slot, _)| *slot != leader_slot)
        .map(|(_, h)| h.clone())
        .collect();
    let (_, reply) = propose_anywhere(&survivors, "put step two").await;
    assert_eq!(&reply[..], b"ok");

    cluster.network.heal(leader_node);
    for node in &cluster.nodes {
        node.report_peer(leader_node, true);
    }

    // The deposed leader rejoins and catches up on both writes.
    wait_until("old leader to catch up", || {
        let mirror = cluster.machines[leader_slot].mirror.lock().unwrap();
        mirror.get("step").map(String::as_str) == Some("two")
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_of_absent_server_reverts_then_live_join_succeeds() {
    let root = tempfile::tempdir().unwrap();
    let cluster = build_cluster(root.path(), &[1, 2]).unwrap();

    let (leader_slot, _) = propose_anywhere(&cluster.handles, "put seed 1").await;
    let leader = &cluster.handles[leader_slot];

    // Node 9 does not exist: the verification window expires and the config
    // rolls back.
    let outcome = leader.join(9).await.unwrap();
    assert_eq!(
        outcome,
        MembershipOutcome::Reverted {
            reason: RevertReason::VerificationTimeout
        }
    );

    // While nothing is pending any more, a real replica can join.
    let mut config = NodeConfig::new(root.path().join("n3"), 3);
    config.call_timeout = Duration::from_secs(2);
    let node3 = Node::start(config, cluster.network.transport(3)).unwrap();
    let machine3 = Arc::new(KvMachine::new());
    let spec = GroupSpec::new(cluster.group.clone(), vec![]).awaiting();
    let handle3 = node3.create_group(machine3.clone(), spec).unwrap();
    cluster.network.attach(3, &handle3);
    node3.finish_recovery();

    let outcome = leader.join(3).await.unwrap();
    assert_eq!(outcome, MembershipOutcome::Done);

    propose_anywhere(&cluster.handles, "put seed 2").await;
    wait_until("new member to replicate", || {
        machine3.mirror.lock().unwrap().get("seed").map(String::as_str) == Some("2")
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_catches_up_via_snapshot() {
    let root = tempfile::tempdir().unwrap();
    common::init_tracing();
    let network = cairn_store::ChannelNetwork::new();
    let group = cairn_raft::raft::GroupId::new(&b"kv"[..]);

    // Two founding members that snapshot every 5 applies and release the log
    // behind the snapshot.
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for node_id in [1u64, 2] {
        let mut config = NodeConfig::new(root.path().join(format!("n{node_id}")), node_id);
        config.call_timeout = Duration::from_secs(2);
        let node = Node::start(config, network.transport(node_id)).unwrap();
        let machine = Arc::new(KvMachine::with_snapshot_every(5));
        let mut spec = GroupSpec::new(group.clone(), vec![1, 2]);
        spec.raft = common::test_raft_config();
        let handle = node.create_group(machine, spec).unwrap();
        network.attach(node_id, &handle);
        node.finish_recovery();
        nodes.push(node);
        handles.push(handle);
    }

    for i in 0..12 {
        let (_, reply) = propose_anywhere(&handles, &format!("put k{i} v{i}")).await;
        assert_eq!(&reply[..], b"ok");
    }

    // A newcomer with an empty log: far behind the snapshot boundary, so the
    // leader must stream state instead of entries.
    let mut config = NodeConfig::new(root.path().join("n3"), 3);
    config.call_timeout = Duration::from_secs(2);
    let node3 = Node::start(config, network.transport(3)).unwrap();
    let machine3 = Arc::new(KvMachine::with_snapshot_every(5));
    let spec = GroupSpec::new(group.clone(), vec![]).awaiting();
    let handle3 = node3.create_group(machine3.clone(), spec).unwrap();
    network.attach(3, &handle3);
    node3.finish_recovery();

    let (leader_slot, _) = propose_anywhere(&handles, "put k12 v12").await;
    let outcome = handles[leader_slot].join(3).await.unwrap();
    assert_eq!(outcome, MembershipOutcome::Done);

    propose_anywhere(&handles, "put after join").await;
    wait_until("joiner to hold the full state", || {
        let mirror = machine3.mirror.lock().unwrap();
        (0..13).all(|i| mirror.get(&format!("k{i}")).map(String::as_str) == Some(&format!("v{i}")[..]))
            && mirror.get("after").map(String::as_str) == Some("join")
    })
    .await;
}
