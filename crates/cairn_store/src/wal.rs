//! The node-wide write-ahead log.
//!
//! Every group on the node funnels its appends through one writer thread that
//! owns the active WAL file. The worker accumulates a batch (bounded by
//! records, bytes, and a max wait), performs a single `write` + `fsync`, and
//! then publishes one durability notification per contributing group. When
//! the active file passes the rollover threshold it is sealed and handed to
//! the segment writer, which owns its deletion.
//!
//! Record frame:
//! `[u32 len][u8 version][u64 group_hash][u64 index][u64 term][u8 kind]`
//! `[payload][u32 crc32c]`, where `len` and the checksum cover
//! version..payload. Files start with an 8-byte magic and a generation
//! number.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use cairn_raft::raft::{EntryKind, GroupId, Index, LogEntry, Term};

pub(crate) const WAL_MAGIC: &[u8; 8] = b"CRNWAL01";
const FILE_HEADER_LEN: u64 = 16;
/// version, group hash, index, term, kind.
const RECORD_FIXED_LEN: usize = 1 + 8 + 8 + 8 + 1;

/// Tuning for the WAL writer. Defaults favour aggregate throughput across
/// many groups over single-group latency.
#[derive(Clone, Debug)]
pub struct WalConfig {
    pub dir: PathBuf,
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    pub batch_max_wait: Duration,
    pub rollover_bytes: u64,
    /// Command queue bound; enqueue blocks past it. This is the node's only
    /// back-pressure point.
    pub queue_depth: usize,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            batch_max_records: 256,
            batch_max_bytes: 1024 * 1024,
            batch_max_wait: Duration::from_micros(200),
            rollover_bytes: 64 * 1024 * 1024,
            queue_depth: 4096,
        }
    }
}

/// Durability feedback delivered to a group's event queue.
#[derive(Clone, Debug)]
pub enum WalNotice {
    /// Records up to `up_to_index` are fsynced. `epoch` counts the group's
    /// truncation rewinds so stale notices can be discarded.
    Durable { epoch: u64, up_to_index: Index },
    /// The group (or the whole WAL) can make no further progress.
    Fatal { reason: String },
}

pub type WalNotifier = Box<dyn Fn(WalNotice) + Send>;

/// A rolled WAL file queued for the segment writer.
#[derive(Debug)]
pub struct SealedWal {
    pub generation: u64,
    pub path: PathBuf,
    /// `group_hash -> (first_index, last_index)` seen in this file.
    pub manifest: HashMap<u64, (Index, Index)>,
}

/// One framed record as it appears in the WAL stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub group_hash: u64,
    pub index: Index,
    pub term: Term,
    pub kind: EntryKind,
    pub payload: Bytes,
}

impl WalRecord {
    pub fn is_truncate(&self) -> bool {
        self.kind == EntryKind::Truncate
    }

    pub fn to_entry(&self) -> LogEntry {
        LogEntry::new(self.index, self.term, self.kind, self.payload.clone())
    }
}

struct RegisterWork {
    group: GroupId,
    next_index: Index,
    notifier: WalNotifier,
}

enum WalCommand {
    Append {
        group_hash: u64,
        entry: LogEntry,
    },
    /// Rewind marker: the group's log continues at `from`; anything at or
    /// above it in the stream so far is dead.
    Truncate {
        group_hash: u64,
        from: Index,
        epoch: u64,
    },
    Register(RegisterWork),
    Forget {
        group_hash: u64,
    },
    Shutdown {
        done: mpsc::Sender<()>,
    },
}

/// Handle used by group logs to reach the writer thread. Cloneable; `append`
/// blocks when the queue is at capacity.
#[derive(Clone)]
pub struct WalHandle {
    tx: mpsc::SyncSender<WalCommand>,
}

impl WalHandle {
    pub fn append(&self, group_hash: u64, entry: LogEntry) -> anyhow::Result<()> {
        self.tx
            .send(WalCommand::Append { group_hash, entry })
            .map_err(|_| anyhow::anyhow!("wal writer closed"))
    }

    pub fn truncate(&self, group_hash: u64, from: Index, epoch: u64) -> anyhow::Result<()> {
        self.tx
            .send(WalCommand::Truncate {
                group_hash,
                from,
                epoch,
            })
            .map_err(|_| anyhow::anyhow!("wal writer closed"))
    }

    pub fn register_group(
        &self,
        group: GroupId,
        next_index: Index,
        notifier: WalNotifier,
    ) -> anyhow::Result<()> {
        self.tx
            .send(WalCommand::Register(RegisterWork {
                group,
                next_index,
                notifier,
            }))
            .map_err(|_| anyhow::anyhow!("wal writer closed"))
    }

    pub fn forget_group(&self, group_hash: u64) -> anyhow::Result<()> {
        self.tx
            .send(WalCommand::Forget { group_hash })
            .map_err(|_| anyhow::anyhow!("wal writer closed"))
    }

    /// Drain the queue, fsync, seal the active file. Blocks until done.
    pub fn shutdown(&self) {
        let (tx, rx) = mpsc::channel();
        if self.tx.send(WalCommand::Shutdown { done: tx }).is_ok() {
            let _ = rx.recv();
        }
    }
}

/// Destination for rolled files, normally the segment writer's queue.
pub type SealedSink = Box<dyn Fn(SealedWal) + Send>;

/// Spawn the writer thread. `next_generation` continues the on-disk file
/// numbering after recovery; sealed files flow into `on_sealed`.
pub fn start(
    config: WalConfig,
    next_generation: u64,
    on_sealed: SealedSink,
) -> anyhow::Result<WalHandle> {
    fs::create_dir_all(&config.dir).context("create wal dir")?;
    let (tx, rx) = mpsc::sync_channel(config.queue_depth.max(1));
    thread::Builder::new()
        .name("cairn-wal".to_string())
        .spawn(move || wal_worker(config, next_generation, rx, on_sealed))
        .context("spawn wal writer thread")?;
    Ok(WalHandle { tx })
}

struct GroupReg {
    group: GroupId,
    expected_next: Index,
    epoch: u64,
    notifier: WalNotifier,
    poisoned: bool,
}

struct ActiveFile {
    file: File,
    path: PathBuf,
    generation: u64,
    len: u64,
    manifest: HashMap<u64, (Index, Index)>,
}

fn open_active(dir: &Path, generation: u64) -> anyhow::Result<ActiveFile> {
    let path = dir.join(format!("{generation:08}.wal"));
    let mut file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open wal file {}", path.display()))?;
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    header[..8].copy_from_slice(WAL_MAGIC);
    header[8..].copy_from_slice(&generation.to_be_bytes());
    file.write_all(&header).context("write wal header")?;
    Ok(ActiveFile {
        file,
        path,
        generation,
        len: FILE_HEADER_LEN,
        manifest: HashMap::new(),
    })
}

fn wal_worker(
    config: WalConfig,
    next_generation: u64,
    rx: mpsc::Receiver<WalCommand>,
    on_sealed: SealedSink,
) {
    let mut groups: HashMap<u64, GroupReg> = HashMap::new();
    let mut generation = next_generation;
    let mut active = match open_active(&config.dir, generation) {
        Ok(active) => active,
        Err(err) => {
            tracing::error!(error = ?err, "open wal failed, node cannot start");
            return;
        }
    };
    let mut node_poisoned = false;

    let batch_max = config.batch_max_records.max(1);
    let mut disconnected = false;
    while !disconnected {
        let first = match rx.recv() {
            Ok(cmd) => cmd,
            Err(_) => break,
        };

        let mut commands = Vec::with_capacity(batch_max);
        commands.push(first);
        if batch_max > 1 {
            let deadline = if config.batch_max_wait.is_zero() {
                None
            } else {
                Some(Instant::now() + config.batch_max_wait)
            };
            loop {
                if commands.len() >= batch_max {
                    break;
                }
                match rx.try_recv() {
                    Ok(cmd) => {
                        commands.push(cmd);
                        continue;
                    }
                    Err(mpsc::TryRecvError::Empty) => {}
                    Err(mpsc::TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
                let Some(deadline) = deadline else {
                    break;
                };
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match rx.recv_timeout(deadline.saturating_duration_since(now)) {
                    Ok(cmd) => commands.push(cmd),
                    Err(mpsc::RecvTimeoutError::Timeout) => break,
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
        }

        let mut batch = Vec::with_capacity(config.batch_max_bytes.min(1 << 20));
        // group_hash -> (epoch, max index) for this batch.
        let mut touched: HashMap<u64, (u64, Index)> = HashMap::new();
        let mut shutdown_done: Option<mpsc::Sender<()>> = None;

        for cmd in commands {
            match cmd {
                WalCommand::Append { group_hash, entry } => {
                    let Some(reg) = groups.get_mut(&group_hash) else {
                        tracing::warn!(group_hash, "append for unregistered group dropped");
                        continue;
                    };
                    if reg.poisoned || node_poisoned {
                        continue;
                    }
                    // Indexes within a group are totally ordered; a gap is a
                    // caller bug the group cannot recover from.
                    if entry.index != reg.expected_next {
                        tracing::error!(
                            group = %reg.group,
                            expected = reg.expected_next,
                            got = entry.index,
                            "wal append out of order, group poisoned"
                        );
                        reg.poisoned = true;
                        (reg.notifier)(WalNotice::Fatal {
                            reason: format!(
                                "wal append out of order: expected {}, got {}",
                                reg.expected_next, entry.index
                            ),
                        });
                        continue;
                    }
                    reg.expected_next = entry.index + 1;
                    encode_record(
                        &mut batch,
                        group_hash,
                        entry.index,
                        entry.term,
                        entry.kind,
                        &entry.payload,
                    );
                    let slot = touched.entry(group_hash).or_insert((reg.epoch, 0));
                    slot.0 = reg.epoch;
                    slot.1 = slot.1.max(entry.index);
                    let range = active
                        .manifest
                        .entry(group_hash)
                        .or_insert((entry.index, entry.index));
                    range.0 = range.0.min(entry.index);
                    range.1 = range.1.max(entry.index);
                }
                WalCommand::Truncate {
                    group_hash,
                    from,
                    epoch,
                } => {
                    let Some(reg) = groups.get_mut(&group_hash) else {
                        continue;
                    };
                    if reg.poisoned || node_poisoned {
                        continue;
                    }
                    reg.expected_next = from;
                    reg.epoch = epoch;
                    // Notices for the rewound suffix must not count for the
                    // new one.
                    touched.remove(&group_hash);
                    encode_record(
                        &mut batch,
                        group_hash,
                        from,
                        0,
                        EntryKind::Truncate,
                        &[],
                    );
                }
                WalCommand::Register(work) => {
                    let hash = work.group.hash64();
                    if let Some(existing) = groups.get(&hash) {
                        if existing.group != work.group {
                            tracing::error!(
                                group = %work.group,
                                other = %existing.group,
                                "group hash collision, registration rejected"
                            );
                            (work.notifier)(WalNotice::Fatal {
                                reason: "group hash collision".to_string(),
                            });
                            continue;
                        }
                    }
                    groups.insert(
                        hash,
                        GroupReg {
                            group: work.group,
                            expected_next: work.next_index,
                            epoch: 0,
                            notifier: work.notifier,
                            poisoned: false,
                        },
                    );
                }
                WalCommand::Forget { group_hash } => {
                    groups.remove(&group_hash);
                }
                WalCommand::Shutdown { done } => {
                    shutdown_done = Some(done);
                    disconnected = true;
                }
            }
        }

        if !batch.is_empty() && !node_poisoned {
            let result = active
                .file
                .write_all(&batch)
                .and_then(|()| active.file.sync_data());
            match result {
                Ok(()) => {
                    active.len += batch.len() as u64;
                    for (hash, (epoch, up_to)) in touched {
                        if let Some(reg) = groups.get(&hash) {
                            if !reg.poisoned {
                                (reg.notifier)(WalNotice::Durable {
                                    epoch,
                                    up_to_index: up_to,
                                });
                            }
                        }
                    }
                }
                Err(err) => {
                    // Disk full or worse: no group on this node can safely
                    // make progress any more.
                    tracing::error!(error = %err, "wal write failed, node unavailable");
                    node_poisoned = true;
                    for reg in groups.values() {
                        (reg.notifier)(WalNotice::Fatal {
                            reason: format!("wal unavailable: {err}"),
                        });
                    }
                }
            }
        }

        if !node_poisoned && active.len >= config.rollover_bytes {
            match roll(&config.dir, &mut generation, &mut active, &on_sealed) {
                Ok(()) => {}
                Err(err) => {
                    tracing::error!(error = ?err, "wal rollover failed, node unavailable");
                    node_poisoned = true;
                    for reg in groups.values() {
                        (reg.notifier)(WalNotice::Fatal {
                            reason: format!("wal unavailable: {err}"),
                        });
                    }
                }
            }
        }

        if let Some(done) = shutdown_done {
            let _ = active.file.sync_data();
            tracing::info!(generation = active.generation, "wal writer shut down");
            let _ = done.send(());
            return;
        }
    }
}

fn roll(
    dir: &Path,
    generation: &mut u64,
    active: &mut ActiveFile,
    on_sealed: &SealedSink,
) -> anyhow::Result<()> {
    active.file.sync_all().context("fsync sealed wal")?;
    *generation += 1;
    let next = open_active(dir, *generation)?;
    let sealed = std::mem::replace(active, next);
    tracing::debug!(
        generation = sealed.generation,
        bytes = sealed.len,
        groups = sealed.manifest.len(),
        "wal file sealed"
    );
    on_sealed(SealedWal {
        generation: sealed.generation,
        path: sealed.path,
        manifest: sealed.manifest,
    });
    Ok(())
}

// ---- framing ---------------------------------------------------------------

pub(crate) fn encode_record(
    out: &mut Vec<u8>,
    group_hash: u64,
    index: Index,
    term: Term,
    kind: EntryKind,
    payload: &[u8],
) {
    let len = (RECORD_FIXED_LEN + payload.len()) as u32;
    out.extend_from_slice(&len.to_be_bytes());
    let body_start = out.len();
    out.push(1u8);
    out.extend_from_slice(&group_hash.to_be_bytes());
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&term.to_be_bytes());
    out.push(kind.to_wire());
    out.extend_from_slice(payload);
    let crc = crc32c::crc32c(&out[body_start..]);
    out.extend_from_slice(&crc.to_be_bytes());
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DecodeOutcome {
    Record(WalRecord, usize),
    /// Truncated or corrupt at this offset.
    Tail,
}

pub(crate) fn decode_record(buf: &[u8]) -> DecodeOutcome {
    if buf.len() < 4 {
        return DecodeOutcome::Tail;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < RECORD_FIXED_LEN || buf.len() < 4 + len + 4 {
        return DecodeOutcome::Tail;
    }
    let body = &buf[4..4 + len];
    let crc_bytes = &buf[4 + len..4 + len + 4];
    let expected = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if crc32c::crc32c(body) != expected {
        return DecodeOutcome::Tail;
    }
    if body[0] != 1 {
        return DecodeOutcome::Tail;
    }
    let group_hash = u64::from_be_bytes(body[1..9].try_into().expect("fixed slice"));
    let index = u64::from_be_bytes(body[9..17].try_into().expect("fixed slice"));
    let term = u64::from_be_bytes(body[17..25].try_into().expect("fixed slice"));
    let Some(kind) = EntryKind::from_wire(body[25]) else {
        return DecodeOutcome::Tail;
    };
    let payload = Bytes::copy_from_slice(&body[26..]);
    DecodeOutcome::Record(
        WalRecord {
            group_hash,
            index,
            term,
            kind,
            payload,
        },
        4 + len + 4,
    )
}

// ---- recovery --------------------------------------------------------------

/// Result of scanning the WAL directory on startup.
pub struct WalRecovery {
    /// Surviving files oldest-first, already treated as sealed.
    pub files: Vec<SealedWal>,
    /// All surviving records in stream order, truncate markers included.
    pub records: HashMap<u64, Vec<WalRecord>>,
    /// Generation the writer should continue from.
    pub next_generation: u64,
}

/// Scan WAL files oldest to newest, verifying checksums. A bad tail in the
/// newest file is truncated away; corruption anywhere else is fatal.
pub fn recover(dir: &Path) -> anyhow::Result<WalRecovery> {
    fs::create_dir_all(dir).context("create wal dir")?;
    let mut paths: Vec<(u64, PathBuf)> = Vec::new();
    for dirent in fs::read_dir(dir).context("read wal dir")? {
        let dirent = dirent?;
        let path = dirent.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".wal") else {
            continue;
        };
        let Ok(generation) = stem.parse::<u64>() else {
            continue;
        };
        paths.push((generation, path));
    }
    paths.sort_unstable_by_key(|(generation, _)| *generation);

    let mut files = Vec::new();
    let mut records: HashMap<u64, Vec<WalRecord>> = HashMap::new();
    let last = paths.len();
    for (pos, (generation, path)) in paths.into_iter().enumerate() {
        let newest = pos + 1 == last;
        let (file_records, valid_len, total_len) =
            scan_file(&path).with_context(|| format!("scan {}", path.display()))?;
        if valid_len < total_len {
            if !newest {
                anyhow::bail!(
                    "wal file {} corrupt mid-stream at offset {valid_len}",
                    path.display()
                );
            }
            tracing::warn!(
                path = %path.display(),
                offset = valid_len,
                "truncating corrupt wal tail"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let mut manifest: HashMap<u64, (Index, Index)> = HashMap::new();
        for record in &file_records {
            if !record.is_truncate() {
                let range = manifest
                    .entry(record.group_hash)
                    .or_insert((record.index, record.index));
                range.0 = range.0.min(record.index);
                range.1 = range.1.max(record.index);
            }
            records
                .entry(record.group_hash)
                .or_default()
                .push(record.clone());
        }
        files.push(SealedWal {
            generation,
            path,
            manifest,
        });
    }

    let next_generation = files.last().map(|f| f.generation + 1).unwrap_or(1);
    Ok(WalRecovery {
        files,
        records,
        next_generation,
    })
}

/// Read every verifiable record of one WAL file. Returns the records, the
/// byte offset up to which the file verified, and its total length.
pub(crate) fn scan_file(path: &Path) -> anyhow::Result<(Vec<WalRecord>, u64, u64)> {
    let file = File::open(path)?;
    let total_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;

    if buf.len() < FILE_HEADER_LEN as usize || &buf[..8] != WAL_MAGIC {
        anyhow::bail!("bad wal file header in {}", path.display());
    }
    let mut offset = FILE_HEADER_LEN as usize;
    let mut records = Vec::new();
    while offset < buf.len() {
        match decode_record(&buf[offset..]) {
            DecodeOutcome::Record(record, consumed) => {
                records.push(record);
                offset += consumed;
            }
            DecodeOutcome::Tail => break,
        }
    }
    Ok((records, offset as u64, total_len))
}
