//! Snapshot store round trips through the public API.
//!
//! Test flow: write, promote, recover over a real directory; stream-install
//! a snapshot the way a follower would; checkpoint then promote it once a
//! release is authorised.

use cairn_raft::raft::ClusterConfig;
use cairn_store::SnapshotStore;

fn members() -> ClusterConfig {
    ClusterConfig::new([1, 2, 3])
}

#[test]
fn promoted_snapshot_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshots").join("orders");
    {
        let store = SnapshotStore::open(&path).unwrap();
        let pending = store.write(400, 7, members(), 1, b"state-at-400").unwrap();
        store.promote(pending).unwrap();
    }

    // A new store over the same directory sees the same snapshot.
    let store = SnapshotStore::open(&path).unwrap();
    let (meta, data) = store.recover().unwrap().unwrap();
    assert_eq!((meta.last_index, meta.last_term), (400, 7));
    assert_eq!(meta.cluster_config, members());
    assert_eq!(meta.machine_version, 1);
    assert_eq!(&data[..], b"state-at-400");
}

#[test]
fn install_replaces_live_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(dir.path().join("g")).unwrap();
    let pending = store.write(10, 1, members(), 0, b"old").unwrap();
    store.promote(pending).unwrap();

    // Receiver-side install of a newer peer-streamed snapshot.
    store.install(1000, 4, members(), 0, b"streamed").unwrap();
    let (meta, data) = store.recover().unwrap().unwrap();
    assert_eq!(meta.last_index, 1000);
    assert_eq!(&data[..], b"streamed");
    assert_eq!(store.latest_meta().unwrap().unwrap().last_index, 1000);
}

#[test]
fn checkpoint_does_not_serve_recovery_until_promoted() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(dir.path().join("g")).unwrap();
    store
        .write_checkpoint(64, 2, members(), 0, b"bounded-apply-work")
        .unwrap();
    assert!(store.recover().unwrap().is_none());
    assert!(store.latest_meta().unwrap().is_none());

    let meta = store.promote_checkpoint(64).unwrap().unwrap();
    assert_eq!(meta.last_index, 64);
    let (recovered, data) = store.recover().unwrap().unwrap();
    assert_eq!(recovered.last_index, 64);
    assert_eq!(&data[..], b"bounded-apply-work");
}
