//! Per-group segment files and the node-wide segment writer.
//!
//! The segment writer consumes sealed WAL files strictly in generation order,
//! demultiplexes their records by group, and writes immutable per-group
//! segment files. A segment carries an index of entry offsets so reads are a
//! binary search plus one seek. Once every record of a sealed WAL file is in
//! fsynced segments, the WAL file is deleted and each affected group is told
//! which index range just became segment-resident.
//!
//! Segment layout:
//! `[magic "CRNSEG01"][u64 group_hash][u64 first_index]`, then entry frames
//! `[u32 len][u8 version][u64 index][u64 term][u8 kind][payload][u32 crc32c]`,
//! then the offset index `[(u64 index, u64 offset)]*`, then the trailer
//! `[u64 index_offset][u32 count][u32 index_crc][magic "CRNSEGIX"]`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use anyhow::Context;
use bytes::Bytes;
use cairn_raft::raft::{EntryKind, GroupId, Index, LogEntry, Term};

use crate::wal::{self, SealedWal, WalRecord};

const SEG_MAGIC: &[u8; 8] = b"CRNSEG01";
const SEG_INDEX_MAGIC: &[u8; 8] = b"CRNSEGIX";
const SEG_HEADER_LEN: u64 = 24;
const SEG_TRAILER_LEN: u64 = 24;
/// version, index, term, kind.
const ENTRY_FIXED_LEN: usize = 1 + 8 + 8 + 1;

#[derive(Clone, Debug)]
pub struct SegmentConfig {
    /// `segments/` root; each group gets a subdirectory.
    pub root: PathBuf,
    pub max_bytes: u64,
    pub max_entries: usize,
}

impl SegmentConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_bytes: 8 * 1024 * 1024,
            max_entries: 4096,
        }
    }
}

/// Delivered to a group once a segment holding its entries is durable.
#[derive(Clone, Debug)]
pub struct SegmentNotice {
    pub path: PathBuf,
    pub first_index: Index,
    pub last_index: Index,
}

pub type SegmentNotifier = Box<dyn Fn(SegmentNotice) + Send>;

enum SegCommand {
    Register {
        group: GroupId,
        dir: PathBuf,
        next_seq: u64,
        last_written: Index,
        notifier: SegmentNotifier,
    },
    Forget {
        group_hash: u64,
    },
    Offer(SealedWal),
    Shutdown {
        done: mpsc::Sender<()>,
    },
}

/// Handle to the segment writer thread.
#[derive(Clone)]
pub struct SegmentWriterHandle {
    tx: mpsc::Sender<SegCommand>,
}

impl SegmentWriterHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn register_group(
        &self,
        group: GroupId,
        dir: PathBuf,
        next_seq: u64,
        last_written: Index,
        notifier: SegmentNotifier,
    ) -> anyhow::Result<()> {
        self.tx
            .send(SegCommand::Register {
                group,
                dir,
                next_seq,
                last_written,
                notifier,
            })
            .map_err(|_| anyhow::anyhow!("segment writer closed"))
    }

    pub fn forget_group(&self, group_hash: u64) -> anyhow::Result<()> {
        self.tx
            .send(SegCommand::Forget { group_hash })
            .map_err(|_| anyhow::anyhow!("segment writer closed"))
    }

    pub fn offer(&self, sealed: SealedWal) {
        let _ = self.tx.send(SegCommand::Offer(sealed));
    }

    /// Drain queued WAL files, then stop. Blocks until done.
    pub fn shutdown(&self) {
        let (tx, rx) = mpsc::channel();
        if self.tx.send(SegCommand::Shutdown { done: tx }).is_ok() {
            let _ = rx.recv();
        }
    }
}

pub fn start(config: SegmentConfig) -> anyhow::Result<SegmentWriterHandle> {
    fs::create_dir_all(&config.root).context("create segments dir")?;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("cairn-segment".to_string())
        .spawn(move || segment_worker(config, rx))
        .context("spawn segment writer thread")?;
    Ok(SegmentWriterHandle { tx })
}

struct OpenSegment {
    file: File,
    path: PathBuf,
    first: Index,
    last: Index,
    len: u64,
    offsets: Vec<(Index, u64)>,
}

struct GroupSeg {
    group: GroupId,
    dir: PathBuf,
    next_seq: u64,
    /// Highest index already resident in a segment; used to skip duplicates
    /// when a WAL file is re-offered after a crash.
    last_written: Index,
    notifier: SegmentNotifier,
    open: Option<OpenSegment>,
}

fn segment_worker(config: SegmentConfig, rx: mpsc::Receiver<SegCommand>) {
    let mut groups: HashMap<u64, GroupSeg> = HashMap::new();
    let mut poisoned = false;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            SegCommand::Register {
                group,
                dir,
                next_seq,
                last_written,
                notifier,
            } => {
                if let Err(err) = fs::create_dir_all(&dir) {
                    tracing::error!(group = %group, error = %err, "create segment dir failed");
                    continue;
                }
                groups.insert(
                    group.hash64(),
                    GroupSeg {
                        group,
                        dir,
                        next_seq,
                        last_written,
                        notifier,
                        open: None,
                    },
                );
            }
            SegCommand::Forget { group_hash } => {
                if let Some(mut seg) = groups.remove(&group_hash) {
                    if let Some(open) = seg.open.take() {
                        let _ = fs::remove_file(&open.path);
                    }
                }
            }
            SegCommand::Offer(sealed) => {
                if poisoned {
                    continue;
                }
                if let Err(err) = process_wal_file(&config, &mut groups, &sealed) {
                    tracing::error!(
                        path = %sealed.path.display(),
                        error = ?err,
                        "segment writer failed; wal file retained"
                    );
                    poisoned = true;
                }
            }
            SegCommand::Shutdown { done } => {
                for seg in groups.values_mut() {
                    if let Err(err) = seal_open(seg) {
                        tracing::error!(group = %seg.group, error = ?err, "seal on shutdown failed");
                    }
                }
                tracing::info!("segment writer shut down");
                let _ = done.send(());
                return;
            }
        }
    }
}

/// Demultiplex one sealed WAL file into per-group segments, fsync them, then
/// delete the WAL file. Truncate markers clip the open segment in-stream so a
/// single group's records are never reordered.
fn process_wal_file(
    config: &SegmentConfig,
    groups: &mut HashMap<u64, GroupSeg>,
    sealed: &SealedWal,
) -> anyhow::Result<()> {
    let (records, valid_len, total_len) = wal::scan_file(&sealed.path)?;
    if valid_len < total_len {
        anyhow::bail!(
            "sealed wal {} corrupt at offset {valid_len}",
            sealed.path.display()
        );
    }

    for record in &records {
        let Some(seg) = groups.get_mut(&record.group_hash) else {
            // A deleted or never-registered group; its records are dead.
            continue;
        };
        if record.is_truncate() {
            truncate_open(seg, record.index)?;
            continue;
        }
        if record.index <= seg.last_written {
            continue;
        }
        append_record(config, seg, record)?;
        seg.last_written = record.index;
    }

    // Segments must be durable before the WAL file that fed them goes away.
    for seg in groups.values_mut() {
        seal_open(seg)?;
    }
    fs::remove_file(&sealed.path)
        .with_context(|| format!("delete consumed wal {}", sealed.path.display()))?;
    tracing::debug!(
        generation = sealed.generation,
        records = records.len(),
        "wal file converted to segments"
    );
    Ok(())
}

fn append_record(
    config: &SegmentConfig,
    seg: &mut GroupSeg,
    record: &WalRecord,
) -> anyhow::Result<()> {
    if seg.open.is_none() {
        let path = seg.dir.join(format!("{:08}.seg", seg.next_seq));
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)
            .with_context(|| format!("create segment {}", path.display()))?;
        let mut header = [0u8; SEG_HEADER_LEN as usize];
        header[..8].copy_from_slice(SEG_MAGIC);
        header[8..16].copy_from_slice(&record.group_hash.to_be_bytes());
        header[16..24].copy_from_slice(&record.index.to_be_bytes());
        file.write_all(&header)?;
        seg.open = Some(OpenSegment {
            file,
            path,
            first: record.index,
            last: record.index,
            len: SEG_HEADER_LEN,
            offsets: Vec::new(),
        });
        seg.next_seq += 1;
    }

    let open = seg.open.as_mut().expect("open segment");
    let mut frame = Vec::with_capacity(ENTRY_FIXED_LEN + record.payload.len() + 8);
    encode_entry_frame(&mut frame, record.index, record.term, record.kind, &record.payload);
    open.offsets.push((record.index, open.len));
    open.file.write_all(&frame)?;
    open.last = record.index;
    open.len += frame.len() as u64;

    if open.len >= config.max_bytes || open.offsets.len() >= config.max_entries {
        seal_open(seg)?;
    }
    Ok(())
}

/// A follower overwrote its suffix: clip the open segment back to `from - 1`
/// and forget everything at or above `from`.
fn truncate_open(seg: &mut GroupSeg, from: Index) -> anyhow::Result<()> {
    seg.last_written = seg.last_written.min(from.saturating_sub(1));
    let Some(open) = seg.open.as_mut() else {
        return Ok(());
    };
    if open.first >= from {
        // Nothing in this file survives.
        let path = open.path.clone();
        seg.open = None;
        fs::remove_file(&path).with_context(|| format!("drop segment {}", path.display()))?;
        return Ok(());
    }
    if open.last < from {
        return Ok(());
    }
    let cut = open
        .offsets
        .iter()
        .position(|(index, _)| *index >= from)
        .expect("overlap checked");
    let cut_offset = open.offsets[cut].1;
    open.file.set_len(cut_offset)?;
    open.file.seek(SeekFrom::End(0))?;
    open.offsets.truncate(cut);
    open.len = cut_offset;
    open.last = from - 1;
    Ok(())
}

fn seal_open(seg: &mut GroupSeg) -> anyhow::Result<()> {
    let Some(mut open) = seg.open.take() else {
        return Ok(());
    };
    if open.offsets.is_empty() {
        let _ = fs::remove_file(&open.path);
        return Ok(());
    }

    let index_offset = open.len;
    let mut block = Vec::with_capacity(open.offsets.len() * 16);
    for (index, offset) in &open.offsets {
        block.extend_from_slice(&index.to_be_bytes());
        block.extend_from_slice(&offset.to_be_bytes());
    }
    let crc = crc32c::crc32c(&block);
    open.file.write_all(&block)?;
    let mut trailer = [0u8; SEG_TRAILER_LEN as usize];
    trailer[..8].copy_from_slice(&index_offset.to_be_bytes());
    trailer[8..12].copy_from_slice(&(open.offsets.len() as u32).to_be_bytes());
    trailer[12..16].copy_from_slice(&crc.to_be_bytes());
    trailer[16..24].copy_from_slice(SEG_INDEX_MAGIC);
    open.file.write_all(&trailer)?;
    open.file.sync_all().context("fsync segment")?;

    tracing::debug!(
        group = %seg.group,
        path = %open.path.display(),
        first = open.first,
        last = open.last,
        "segment sealed"
    );
    (seg.notifier)(SegmentNotice {
        path: open.path,
        first_index: open.first,
        last_index: open.last,
    });
    Ok(())
}

fn encode_entry_frame(out: &mut Vec<u8>, index: Index, term: Term, kind: EntryKind, payload: &[u8]) {
    let len = (ENTRY_FIXED_LEN + payload.len()) as u32;
    out.extend_from_slice(&len.to_be_bytes());
    let body_start = out.len();
    out.push(1u8);
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&term.to_be_bytes());
    out.push(kind.to_wire());
    out.extend_from_slice(payload);
    let crc = crc32c::crc32c(&out[body_start..]);
    out.extend_from_slice(&crc.to_be_bytes());
}

// ---- reading ---------------------------------------------------------------

/// Read-side view of one sealed segment.
pub struct SegmentReader {
    file: File,
    pub group_hash: u64,
    pub first_index: Index,
    pub last_index: Index,
    offsets: Vec<(Index, u64)>,
}

impl SegmentReader {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let total = file.metadata()?.len();
        if total < SEG_HEADER_LEN + SEG_TRAILER_LEN {
            anyhow::bail!("segment {} too short", path.display());
        }

        let mut header = [0u8; SEG_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if &header[..8] != SEG_MAGIC {
            anyhow::bail!("segment {} bad magic", path.display());
        }
        let group_hash = u64::from_be_bytes(header[8..16].try_into().expect("fixed"));

        file.seek(SeekFrom::End(-(SEG_TRAILER_LEN as i64)))?;
        let mut trailer = [0u8; SEG_TRAILER_LEN as usize];
        file.read_exact(&mut trailer)?;
        if &trailer[16..24] != SEG_INDEX_MAGIC {
            anyhow::bail!("segment {} bad trailer", path.display());
        }
        let index_offset = u64::from_be_bytes(trailer[..8].try_into().expect("fixed"));
        let count = u32::from_be_bytes(trailer[8..12].try_into().expect("fixed")) as usize;
        let expected_crc = u32::from_be_bytes(trailer[12..16].try_into().expect("fixed"));

        let block_len = count
            .checked_mul(16)
            .ok_or_else(|| anyhow::anyhow!("segment {} index overflow", path.display()))?;
        if index_offset + block_len as u64 + SEG_TRAILER_LEN != total {
            anyhow::bail!("segment {} index bounds mismatch", path.display());
        }
        file.seek(SeekFrom::Start(index_offset))?;
        let mut block = vec![0u8; block_len];
        file.read_exact(&mut block)?;
        if crc32c::crc32c(&block) != expected_crc {
            anyhow::bail!("segment {} index checksum mismatch", path.display());
        }
        let mut offsets = Vec::with_capacity(count);
        for chunk in block.chunks_exact(16) {
            let index = u64::from_be_bytes(chunk[..8].try_into().expect("fixed"));
            let offset = u64::from_be_bytes(chunk[8..].try_into().expect("fixed"));
            offsets.push((index, offset));
        }
        if offsets.is_empty() {
            anyhow::bail!("segment {} has no entries", path.display());
        }
        let first_index = offsets.first().expect("non-empty").0;
        let last_index = offsets.last().expect("non-empty").0;

        Ok(Self {
            file,
            group_hash,
            first_index,
            last_index,
            offsets,
        })
    }

    pub fn contains(&self, index: Index) -> bool {
        self.offsets.binary_search_by_key(&index, |(i, _)| *i).is_ok()
    }

    pub fn read(&mut self, index: Index) -> anyhow::Result<Option<LogEntry>> {
        let Ok(slot) = self.offsets.binary_search_by_key(&index, |(i, _)| *i) else {
            return Ok(None);
        };
        let offset = self.offsets[slot].1;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len < ENTRY_FIXED_LEN {
            anyhow::bail!("segment entry frame too short at offset {offset}");
        }
        let mut body = vec![0u8; len + 4];
        self.file.read_exact(&mut body)?;
        let (body, crc_bytes) = body.split_at(len);
        let expected = u32::from_be_bytes(crc_bytes.try_into().expect("fixed"));
        if crc32c::crc32c(body) != expected {
            anyhow::bail!("segment entry checksum mismatch at offset {offset}");
        }
        let entry_index = u64::from_be_bytes(body[1..9].try_into().expect("fixed"));
        let term = u64::from_be_bytes(body[9..17].try_into().expect("fixed"));
        let kind = EntryKind::from_wire(body[17])
            .ok_or_else(|| anyhow::anyhow!("segment entry bad kind at offset {offset}"))?;
        if entry_index != index {
            anyhow::bail!("segment entry index mismatch: wanted {index}, found {entry_index}");
        }
        Ok(Some(LogEntry::new(
            entry_index,
            term,
            kind,
            Bytes::copy_from_slice(&body[18..]),
        )))
    }
}

/// Scan a group's segment directory, oldest file first.
pub fn list_segments(dir: &Path) -> anyhow::Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".seg") else {
            continue;
        };
        let Ok(seq) = stem.parse::<u64>() else {
            continue;
        };
        found.push((seq, path));
    }
    found.sort_unstable_by_key(|(seq, _)| *seq);
    Ok(found)
}

/// Write one sealed segment directly; test scaffolding for the log tier.
#[cfg(test)]
pub(crate) fn write_test_segment(
    dir: &Path,
    group_hash: u64,
    seq: u64,
    entries: &[LogEntry],
) -> PathBuf {
    let config = SegmentConfig::new(dir);
    let mut seg = GroupSeg {
        group: GroupId::new(format!("h{group_hash}").into_bytes()),
        dir: dir.to_path_buf(),
        next_seq: seq,
        last_written: 0,
        notifier: Box::new(|_| {}),
        open: None,
    };
    for entry in entries {
        let record = WalRecord {
            group_hash,
            index: entry.index,
            term: entry.term,
            kind: entry.kind,
            payload: entry.payload.clone(),
        };
        append_record(&config, &mut seg, &record).unwrap();
    }
    let path = seg.open.as_ref().expect("entries written").path.clone();
    seal_open(&mut seg).unwrap();
    path
}
