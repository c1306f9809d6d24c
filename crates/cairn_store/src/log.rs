//! The per-group log façade.
//!
//! Each group sees one logical append-only log. Underneath there are three
//! tiers: a hot in-memory cache of entries not yet segment-resident (one
//! partition per group in a node-wide table), the ordered list of sealed
//! segment files, and the snapshot boundary below which only the snapshot can
//! answer reads. Appends go to the hot cache and the shared WAL; the segment
//! writer's notices move coverage from the cache into segments; the release
//! cursor is the only thing that deletes segment files.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use cairn_raft::raft::{
    GroupId, Index, LogEntry, LogStore, RaftError, Term, TermLookup,
};

use crate::segment::{SegmentNotice, SegmentReader};
use crate::wal::{WalHandle, WalRecord};

/// Node-wide table of unflushed entries, partitioned by group hash.
/// Readers act on behalf of the owning group; partitions are independent.
#[derive(Default)]
pub struct HotCache {
    inner: RwLock<HashMap<u64, BTreeMap<Index, LogEntry>>>,
}

impl HotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group_hash: u64, entry: LogEntry) {
        let mut table = self.inner.write().expect("hot cache poisoned");
        table.entry(group_hash).or_default().insert(entry.index, entry);
    }

    pub fn get(&self, group_hash: u64, index: Index) -> Option<LogEntry> {
        let table = self.inner.read().expect("hot cache poisoned");
        table.get(&group_hash).and_then(|p| p.get(&index)).cloned()
    }

    /// Drop entries in `[first, last]`, typically after a segment notice.
    pub fn release_range(&self, group_hash: u64, first: Index, last: Index) {
        let mut table = self.inner.write().expect("hot cache poisoned");
        if let Some(partition) = table.get_mut(&group_hash) {
            let keep = partition.split_off(&first);
            for (index, entry) in keep {
                if index > last {
                    partition.insert(index, entry);
                }
            }
        }
    }

    /// Drop entries at or above `from`, the truncation path.
    pub fn drop_from(&self, group_hash: u64, from: Index) {
        let mut table = self.inner.write().expect("hot cache poisoned");
        if let Some(partition) = table.get_mut(&group_hash) {
            partition.split_off(&from);
        }
    }

    pub fn forget_group(&self, group_hash: u64) {
        let mut table = self.inner.write().expect("hot cache poisoned");
        table.remove(&group_hash);
    }

    pub fn partition_len(&self, group_hash: u64) -> usize {
        let table = self.inner.read().expect("hot cache poisoned");
        table.get(&group_hash).map(|p| p.len()).unwrap_or(0)
    }
}

/// One sealed segment as the group sees it. `effective_last` clips a dead
/// tail left behind by a later truncation; the file itself is immutable.
#[derive(Clone, Debug)]
pub struct SegmentRef {
    pub path: PathBuf,
    pub first: Index,
    pub last: Index,
    pub effective_last: Index,
}

pub struct GroupLog {
    group: GroupId,
    hash: u64,
    cache: std::sync::Arc<HotCache>,
    wal: WalHandle,
    /// Counts truncation rewinds; WAL durability notices from before the
    /// latest rewind are stale and must be ignored.
    epoch: u64,
    segments: Vec<SegmentRef>,
    snapshot_index: Index,
    snapshot_term: Term,
    next: Index,
    last_term: Term,
    /// Most recently used segment reader; one group reads mostly one file.
    reader: RefCell<Option<SegmentReader>>,
    reader_path: RefCell<Option<PathBuf>>,
}

impl GroupLog {
    /// Rebuild a group's log view on startup: segment ranges from disk, the
    /// snapshot boundary from the snapshot store, and the hot cache replayed
    /// from surviving WAL records (truncate markers included, in order).
    pub fn recover(
        group: GroupId,
        cache: std::sync::Arc<HotCache>,
        wal: WalHandle,
        segment_paths: &[PathBuf],
        snapshot: (Index, Term),
        wal_records: &[WalRecord],
    ) -> anyhow::Result<Self> {
        let hash = group.hash64();
        let mut segments: Vec<SegmentRef> = Vec::with_capacity(segment_paths.len());
        for path in segment_paths {
            let reader = SegmentReader::open(path)?;
            if reader.group_hash != hash {
                anyhow::bail!(
                    "segment {} belongs to another group",
                    path.display()
                );
            }
            segments.push(SegmentRef {
                path: path.clone(),
                first: reader.first_index,
                last: reader.last_index,
                effective_last: reader.last_index,
            });
        }
        // A later file supersedes an earlier one where their ranges overlap
        // (the earlier tail died in a truncation).
        let mut min_first = Index::MAX;
        for seg in segments.iter_mut().rev() {
            if min_first <= seg.effective_last {
                seg.effective_last = min_first.saturating_sub(1);
            }
            min_first = min_first.min(seg.first);
        }
        segments.retain(|seg| seg.effective_last >= seg.first);

        let (snapshot_index, snapshot_term) = snapshot;
        let seg_top = segments.iter().map(|s| s.effective_last).max().unwrap_or(0);
        let mut log = Self {
            group,
            hash,
            cache,
            wal,
            epoch: 0,
            segments,
            snapshot_index,
            snapshot_term,
            next: seg_top.max(snapshot_index) + 1,
            last_term: snapshot_term,
            reader: RefCell::new(None),
            reader_path: RefCell::new(None),
        };
        if seg_top > snapshot_index {
            if let TermLookup::Term(t) = log.segment_term(seg_top) {
                log.last_term = t;
            }
        }

        for record in wal_records {
            if record.is_truncate() {
                let from = record.index;
                if from <= log.snapshot_index {
                    continue;
                }
                log.cache.drop_from(hash, from);
                log.clip_segments(from);
                log.next = from;
                log.last_term = log.term_before(from);
                continue;
            }
            if record.index < log.next && record.index <= seg_top {
                // Already segment-resident; nothing to cache.
                continue;
            }
            if record.index <= log.snapshot_index {
                continue;
            }
            log.cache.insert(hash, record.to_entry());
            log.next = record.index + 1;
            log.last_term = record.term;
        }

        tracing::debug!(
            group = %log.group,
            next = log.next,
            segments = log.segments.len(),
            cached = log.cache.partition_len(hash),
            "group log recovered"
        );
        Ok(log)
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn hash64(&self) -> u64 {
        self.hash
    }

    pub fn wal_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn segment_refs(&self) -> &[SegmentRef] {
        &self.segments
    }

    /// Highest index resident in segments; appends up to here are releasable
    /// from the hot cache.
    pub fn segment_top(&self) -> Index {
        self.segments.iter().map(|s| s.effective_last).max().unwrap_or(0)
    }

    /// Record a fresh segment and release the covered hot-cache range.
    pub fn apply_segment_notice(&mut self, notice: &SegmentNotice) {
        let effective = notice.last_index.min(self.next.saturating_sub(1));
        if effective < notice.first_index || effective <= self.snapshot_index {
            // Entirely dead (truncated or compacted away since flushing).
            let _ = fs::remove_file(&notice.path);
            return;
        }
        self.segments.push(SegmentRef {
            path: notice.path.clone(),
            first: notice.first_index,
            last: notice.last_index,
            effective_last: effective,
        });
        self.cache
            .release_range(self.hash, notice.first_index, effective);
    }

    /// Advance the snapshot boundary and drop segments wholly behind it.
    /// Call only after a snapshot at or past `index` is durably promoted.
    pub fn update_release_cursor(&mut self, index: Index, term: Term) {
        if index <= self.snapshot_index {
            return;
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.cache.release_range(self.hash, 0, index);
        if self.next <= index {
            self.next = index + 1;
            self.last_term = term;
        }
        let mut deleted = 0usize;
        self.segments.retain(|seg| {
            if seg.effective_last <= index {
                let _ = fs::remove_file(&seg.path);
                deleted += 1;
                false
            } else {
                true
            }
        });
        self.invalidate_reader();
        if deleted > 0 {
            tracing::debug!(
                group = %self.group,
                cursor = index,
                deleted,
                "segments released"
            );
        }
    }

    fn clip_segments(&mut self, from: Index) {
        self.segments.retain_mut(|seg| {
            if seg.first >= from {
                return false;
            }
            if seg.effective_last >= from {
                seg.effective_last = from - 1;
            }
            true
        });
        self.invalidate_reader();
    }

    fn invalidate_reader(&self) {
        *self.reader.borrow_mut() = None;
        *self.reader_path.borrow_mut() = None;
    }

    fn term_before(&self, index: Index) -> Term {
        if index <= 1 {
            return 0;
        }
        match self.fetch_term(index - 1) {
            TermLookup::Term(t) => t,
            _ => self.snapshot_term,
        }
    }

    fn segment_lookup(&self, index: Index) -> Option<&SegmentRef> {
        // Newest-first: a re-appended range shadows a clipped older file.
        self.segments
            .iter()
            .rev()
            .find(|seg| seg.first <= index && index <= seg.effective_last)
    }

    fn segment_read(&self, index: Index) -> Result<Option<LogEntry>, RaftError> {
        let Some(seg) = self.segment_lookup(index) else {
            return Ok(None);
        };
        let mut path_slot = self.reader_path.borrow_mut();
        let mut reader_slot = self.reader.borrow_mut();
        if path_slot.as_ref() != Some(&seg.path) {
            let reader = SegmentReader::open(&seg.path).map_err(|err| RaftError::LogCorrupt {
                reason: format!("open segment {}: {err}", seg.path.display()),
            })?;
            *reader_slot = Some(reader);
            *path_slot = Some(seg.path.clone());
        }
        let reader = reader_slot.as_mut().expect("reader cached");
        reader.read(index).map_err(|err| RaftError::LogCorrupt {
            reason: format!("read segment {}: {err}", seg.path.display()),
        })
    }

    fn segment_term(&self, index: Index) -> TermLookup {
        match self.segment_read(index) {
            Ok(Some(entry)) => TermLookup::Term(entry.term),
            _ => TermLookup::Missing,
        }
    }
}

impl LogStore for GroupLog {
    fn append(&mut self, entry: LogEntry) -> Result<(), RaftError> {
        if entry.index != self.next {
            return Err(RaftError::IndexGap {
                expected: self.next,
                got: entry.index,
            });
        }
        self.cache.insert(self.hash, entry.clone());
        self.next = entry.index + 1;
        self.last_term = entry.term;
        self.wal
            .append(self.hash, entry)
            .map_err(|_| RaftError::WalUnavailable)
    }

    fn truncate_from(&mut self, from: Index) -> Result<(), RaftError> {
        if from <= self.snapshot_index {
            return Err(RaftError::LogCorrupt {
                reason: format!("truncate below snapshot boundary at {from}"),
            });
        }
        if from >= self.next {
            return Ok(());
        }
        self.epoch += 1;
        self.cache.drop_from(self.hash, from);
        self.clip_segments(from);
        self.next = from;
        self.last_term = self.term_before(from);
        self.wal
            .truncate(self.hash, from, self.epoch)
            .map_err(|_| RaftError::WalUnavailable)
    }

    fn fetch(&self, index: Index) -> Result<Option<LogEntry>, RaftError> {
        if index == 0 || index <= self.snapshot_index || index >= self.next {
            return Ok(None);
        }
        if let Some(entry) = self.cache.get(self.hash, index) {
            return Ok(Some(entry));
        }
        self.segment_read(index)
    }

    fn fetch_term(&self, index: Index) -> TermLookup {
        if index == 0 {
            return TermLookup::Term(0);
        }
        if index <= self.snapshot_index {
            if index == self.snapshot_index {
                return TermLookup::Term(self.snapshot_term);
            }
            return TermLookup::Compacted;
        }
        if index >= self.next {
            return TermLookup::Missing;
        }
        if let Some(entry) = self.cache.get(self.hash, index) {
            return TermLookup::Term(entry.term);
        }
        self.segment_term(index)
    }

    fn last_index_term(&self) -> (Index, Term) {
        (self.next - 1, self.last_term)
    }

    fn snapshot_last(&self) -> (Index, Term) {
        (self.snapshot_index, self.snapshot_term)
    }

    fn entries(&self, from: Index, to: Index, max: usize) -> Result<Vec<LogEntry>, RaftError> {
        let mut out = Vec::new();
        let mut index = from.max(self.snapshot_index + 1);
        while index <= to && out.len() < max {
            match self.fetch(index)? {
                Some(entry) => out.push(entry),
                None => break,
            }
            index += 1;
        }
        Ok(out)
    }

    fn reset_to_snapshot(&mut self, last_index: Index, last_term: Term) -> Result<(), RaftError> {
        self.cache.forget_group(self.hash);
        for seg in self.segments.drain(..) {
            let _ = fs::remove_file(&seg.path);
        }
        self.invalidate_reader();
        self.snapshot_index = last_index;
        self.snapshot_term = last_term;
        self.next = last_index + 1;
        self.last_term = last_term;
        self.epoch += 1;
        self.wal
            .truncate(self.hash, last_index + 1, self.epoch)
            .map_err(|_| RaftError::WalUnavailable)
    }
}
