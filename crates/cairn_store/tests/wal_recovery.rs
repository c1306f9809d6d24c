//! WAL durability and recovery.
//!
//! Test flow:
//! 1) Run the WAL writer against a temp directory, capturing durability
//!    notices and sealed files.
//! 2) Stop it, damage the files in targeted ways, and run recovery.
//! 3) Assert which records survive: a corrupt tail is truncated away, a
//!    corrupt middle of an older file is fatal, clean files replay whole.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use cairn_raft::raft::{EntryKind, GroupId, LogEntry};
use cairn_store::wal::{self, WalConfig, WalNotice};

fn small_config(dir: &Path) -> WalConfig {
    let mut config = WalConfig::new(dir);
    config.batch_max_wait = Duration::from_micros(100);
    config
}

fn append_entries(config: WalConfig, count: u64) -> (GroupId, mpsc::Receiver<WalNotice>) {
    let group = GroupId::new(&b"orders"[..]);
    let handle = wal::start(config, 1, Box::new(|_| {})).unwrap();
    let (notice_tx, notice_rx) = mpsc::channel();
    handle
        .register_group(
            group.clone(),
            1,
            Box::new(move |notice| {
                let _ = notice_tx.send(notice);
            }),
        )
        .unwrap();
    for index in 1..=count {
        handle
            .append(
                group.hash64(),
                LogEntry::new(
                    index,
                    1,
                    EntryKind::UserCommand,
                    format!("payload-{index}").into_bytes(),
                ),
            )
            .unwrap();
    }
    handle.shutdown();
    (group, notice_rx)
}

fn newest_wal(dir: &Path) -> PathBuf {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|d| d.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "wal").unwrap_or(false))
        .collect();
    files.sort();
    files.pop().expect("wal file present")
}

#[test]
fn durability_notices_cover_all_appends() {
    let dir = tempfile::tempdir().unwrap();
    let (_, notices) = append_entries(small_config(dir.path()), 20);

    let mut durable_to = 0;
    while let Ok(notice) = notices.try_recv() {
        match notice {
            WalNotice::Durable { up_to_index, .. } => {
                assert!(up_to_index >= durable_to, "durability went backwards");
                durable_to = up_to_index;
            }
            WalNotice::Fatal { reason } => panic!("unexpected fatal: {reason}"),
        }
    }
    assert_eq!(durable_to, 20);
}

#[test]
fn clean_restart_replays_every_record_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (group, _) = append_entries(small_config(dir.path()), 12);

    let recovery = wal::recover(dir.path()).unwrap();
    let records = recovery.records.get(&group.hash64()).expect("group records");
    assert_eq!(records.len(), 12);
    for (slot, record) in records.iter().enumerate() {
        assert_eq!(record.index, slot as u64 + 1);
        assert_eq!(&record.payload[..], format!("payload-{}", slot + 1).as_bytes());
    }
    assert!(recovery.next_generation >= 2);
}

#[test]
fn corrupt_tail_is_truncated_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (group, _) = append_entries(small_config(dir.path()), 10);

    // Flip bytes in the last record and append trailing garbage.
    let path = newest_wal(dir.path());
    let mut raw = fs::read(&path).unwrap();
    let len = raw.len();
    raw[len - 3] ^= 0xff;
    raw.extend_from_slice(b"torn-write-garbage");
    fs::write(&path, &raw).unwrap();

    let recovery = wal::recover(dir.path()).unwrap();
    let records = recovery.records.get(&group.hash64()).expect("group records");
    assert_eq!(records.len(), 9, "exactly the damaged tail record is lost");
    assert_eq!(records.last().unwrap().index, 9);
    // The file itself was truncated back to its verified prefix.
    assert!(fs::metadata(&path).unwrap().len() < len as u64);
}

#[test]
fn corruption_in_an_older_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config(dir.path());
    // Tiny rollover so the run produces several sealed files.
    config.rollover_bytes = 256;
    let (_, _) = append_entries(config, 30);

    let mut files: Vec<PathBuf> = fs::read_dir(dir.path())
        .unwrap()
        .map(|d| d.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "wal").unwrap_or(false))
        .collect();
    files.sort();
    assert!(files.len() >= 2, "expected rollover to produce files");

    // Damage a record in the middle of the oldest file.
    let victim = &files[0];
    let mut raw = fs::read(victim).unwrap();
    let mid = raw.len() / 2;
    raw[mid] ^= 0xff;
    fs::write(victim, &raw).unwrap();

    assert!(wal::recover(dir.path()).is_err());
}

#[test]
fn out_of_order_append_poisons_only_that_group() {
    let dir = tempfile::tempdir().unwrap();
    let handle = wal::start(small_config(dir.path()), 1, Box::new(|_| {})).unwrap();

    let bad = GroupId::new(&b"bad"[..]);
    let good = GroupId::new(&b"good"[..]);
    let (bad_tx, bad_rx) = mpsc::channel();
    let (good_tx, good_rx) = mpsc::channel();
    handle
        .register_group(bad.clone(), 1, Box::new(move |n| drop(bad_tx.send(n))))
        .unwrap();
    handle
        .register_group(good.clone(), 1, Box::new(move |n| drop(good_tx.send(n))))
        .unwrap();

    // Index 5 declared where 1 was promised: a caller bug, fatal for it.
    handle
        .append(bad.hash64(), LogEntry::noop(5, 1))
        .unwrap();
    handle
        .append(good.hash64(), LogEntry::noop(1, 1))
        .unwrap();
    handle.shutdown();

    assert!(matches!(
        bad_rx.recv_timeout(Duration::from_secs(2)),
        Ok(WalNotice::Fatal { .. })
    ));
    assert!(matches!(
        good_rx.recv_timeout(Duration::from_secs(2)),
        Ok(WalNotice::Durable { up_to_index: 1, .. })
    ));
}
