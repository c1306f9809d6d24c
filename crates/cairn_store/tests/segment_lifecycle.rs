//! WAL-to-segment conversion.
//!
//! Test flow:
//! 1) Run the WAL writer with a tiny rollover threshold feeding the segment
//!    writer directly, with one registered group.
//! 2) Append enough entries to roll several WAL files.
//! 3) Assert the group's notices cover every index exactly once and in
//!    order, the segment files reopen with the same entries, and consumed
//!    WAL files are deleted only after their segments are durable.

use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use cairn_raft::raft::{EntryKind, GroupId, LogEntry};
use cairn_store::segment::{self, SegmentConfig, SegmentNotice, SegmentReader};
use cairn_store::wal::{self, WalConfig};

fn wal_file_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|d| {
                    d.path()
                        .extension()
                        .map(|e| e == "wal")
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn rolled_wal_files_become_segments_and_disappear() {
    let dir = tempfile::tempdir().unwrap();
    let wal_dir = dir.path().join("wal");
    let seg_root = dir.path().join("segments");

    let segments = segment::start(SegmentConfig::new(&seg_root)).unwrap();
    let mut wal_config = WalConfig::new(&wal_dir);
    wal_config.rollover_bytes = 512;
    wal_config.batch_max_wait = Duration::from_micros(100);
    let sink = {
        let segments = segments.clone();
        Box::new(move |sealed| segments.offer(sealed)) as wal::SealedSink
    };
    let handle = wal::start(wal_config, 1, sink).unwrap();

    let group = GroupId::new(&b"orders"[..]);
    let group_dir = seg_root.join(group.dir_name());
    let (notice_tx, notice_rx) = mpsc::channel::<SegmentNotice>();
    handle
        .register_group(group.clone(), 1, Box::new(|_| {}))
        .unwrap();
    segments
        .register_group(
            group.clone(),
            group_dir.clone(),
            1,
            0,
            Box::new(move |notice| {
                let _ = notice_tx.send(notice);
            }),
        )
        .unwrap();

    const COUNT: u64 = 200;
    for index in 1..=COUNT {
        handle
            .append(
                group.hash64(),
                LogEntry::new(
                    index,
                    3,
                    EntryKind::UserCommand,
                    format!("entry-{index}").into_bytes(),
                ),
            )
            .unwrap();
    }

    // Collect notices until the rolled prefix is fully segment-resident. The
    // records still in the active WAL file never get a notice.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut covered_to = 0u64;
    let mut notices: Vec<SegmentNotice> = Vec::new();
    while Instant::now() < deadline && covered_to < COUNT / 2 {
        if let Ok(notice) = notice_rx.recv_timeout(Duration::from_millis(100)) {
            assert_eq!(notice.first_index, covered_to + 1, "notice out of order");
            assert!(notice.last_index >= notice.first_index);
            covered_to = notice.last_index;
            notices.push(notice);
        }
    }
    assert!(
        covered_to >= COUNT / 2,
        "segments cover only up to {covered_to}"
    );

    // Every notice names a durable, reopenable segment with those entries.
    for notice in &notices {
        let mut reader = SegmentReader::open(&notice.path).unwrap();
        assert_eq!(reader.first_index, notice.first_index);
        assert_eq!(reader.last_index, notice.last_index);
        for index in notice.first_index..=notice.last_index {
            let entry = reader.read(index).unwrap().expect("entry in segment");
            assert_eq!(entry.term, 3);
            assert_eq!(&entry.payload[..], format!("entry-{index}").as_bytes());
        }
    }

    // Consumed WAL files are gone; only the active one (plus at most one
    // still in flight) remains.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = wal_file_count(&wal_dir);
        if remaining <= 2 {
            break;
        }
        if Instant::now() >= deadline {
            panic!("{remaining} wal files still present");
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    handle.shutdown();
    segments.shutdown();
}

#[test]
fn reoffered_wal_file_does_not_duplicate_entries() {
    let dir = tempfile::tempdir().unwrap();
    let seg_root = dir.path().join("segments");
    let wal_dir = dir.path().join("wal");

    // Write a WAL file without a segment writer attached, simulating a crash
    // after seal but before conversion.
    let sealed_store = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = {
        let sealed_store = sealed_store.clone();
        Box::new(move |sealed| sealed_store.lock().unwrap().push(sealed)) as wal::SealedSink
    };
    let mut wal_config = WalConfig::new(&wal_dir);
    wal_config.rollover_bytes = 128;
    let handle = wal::start(wal_config, 1, sink).unwrap();
    let group = GroupId::new(&b"orders"[..]);
    handle
        .register_group(group.clone(), 1, Box::new(|_| {}))
        .unwrap();
    for index in 1..=6u64 {
        handle
            .append(group.hash64(), LogEntry::noop(index, 1))
            .unwrap();
    }
    handle.shutdown();

    // "Restart": recovery treats all surviving files as sealed; convert them.
    let recovery = wal::recover(&wal_dir).unwrap();
    let first_file = {
        let first = recovery.files.first().expect("rolled file");
        (first.generation, first.path.clone(), first.manifest.clone(), fs::read(&first.path).unwrap())
    };
    let segments = segment::start(SegmentConfig::new(&seg_root)).unwrap();
    let (notice_tx, notice_rx) = mpsc::channel::<SegmentNotice>();
    segments
        .register_group(
            group.clone(),
            seg_root.join(group.dir_name()),
            1,
            0,
            Box::new(move |notice| {
                let _ = notice_tx.send(notice);
            }),
        )
        .unwrap();
    for sealed in recovery.files {
        segments.offer(sealed);
    }
    segments.shutdown();

    let mut covered = Vec::new();
    while let Ok(notice) = notice_rx.try_recv() {
        for index in notice.first_index..=notice.last_index {
            covered.push(index);
        }
    }
    assert_eq!(covered, (1..=6u64).collect::<Vec<_>>());

    // Crash-before-delete replay: put the already-converted file back and
    // offer it to a fresh writer that, like the node on restart, knows the
    // highest segment-resident index. Nothing may be written twice.
    let (generation, path, manifest, bytes) = first_file;
    fs::write(&path, &bytes).unwrap();
    let existing = segment::list_segments(&seg_root.join(group.dir_name())).unwrap();
    let next_seq = existing.last().map(|(seq, _)| seq + 1).unwrap();
    let segments = segment::start(SegmentConfig::new(&seg_root)).unwrap();
    let (notice_tx, notice_rx) = mpsc::channel::<SegmentNotice>();
    segments
        .register_group(
            group.clone(),
            seg_root.join(group.dir_name()),
            next_seq,
            6,
            Box::new(move |notice| {
                let _ = notice_tx.send(notice);
            }),
        )
        .unwrap();
    segments.offer(wal::SealedWal {
        generation,
        path: path.clone(),
        manifest,
    });
    segments.shutdown();

    assert!(notice_rx.try_recv().is_err(), "duplicate segment written");
    assert!(!path.exists(), "replayed wal file should be deleted");
    let after = segment::list_segments(&seg_root.join(group.dir_name())).unwrap();
    assert_eq!(after.len(), existing.len());
}
