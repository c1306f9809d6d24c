//! In-memory log store.
//!
//! Backs unit and simulation tests, where durability is the harness's
//! business. `cairn_store` provides the durable implementation.

use std::collections::VecDeque;

use super::types::{Index, LogEntry, LogStore, RaftError, Term, TermLookup};

#[derive(Debug, Default)]
pub struct MemLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry.
    first_index: Index,
    snapshot_index: Index,
    snapshot_term: Term,
}

impl MemLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_index: 0,
            snapshot_term: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries at or below `up_to` behind a snapshot boundary.
    pub fn compact(&mut self, up_to: Index, term: Term) {
        while let Some(front) = self.entries.front() {
            if front.index > up_to {
                break;
            }
            self.entries.pop_front();
        }
        self.first_index = up_to + 1;
        self.snapshot_index = up_to;
        self.snapshot_term = term;
    }

    fn offset(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            return None;
        }
        let off = (index - self.first_index) as usize;
        if off < self.entries.len() {
            Some(off)
        } else {
            None
        }
    }
}

impl LogStore for MemLog {
    fn append(&mut self, entry: LogEntry) -> Result<(), RaftError> {
        let expected = self.next_index();
        if entry.index != expected {
            return Err(RaftError::IndexGap {
                expected,
                got: entry.index,
            });
        }
        self.entries.push_back(entry);
        Ok(())
    }

    fn truncate_from(&mut self, from: Index) -> Result<(), RaftError> {
        if from <= self.snapshot_index {
            return Err(RaftError::LogCorrupt {
                reason: format!("truncate below snapshot boundary at {from}"),
            });
        }
        let keep = from.saturating_sub(self.first_index) as usize;
        self.entries.truncate(keep.min(self.entries.len()));
        Ok(())
    }

    fn fetch(&self, index: Index) -> Result<Option<LogEntry>, RaftError> {
        Ok(self.offset(index).map(|o| self.entries[o].clone()))
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
        match self.offset(index) {
            Some(o) => TermLookup::Term(self.entries[o].term),
            None => TermLookup::Missing,
        }
    }

    fn last_index_term(&self) -> (Index, Term) {
        match self.entries.back() {
            Some(e) => (e.index, e.term),
            None => (self.snapshot_index, self.snapshot_term),
        }
    }

    fn snapshot_last(&self) -> (Index, Term) {
        (self.snapshot_index, self.snapshot_term)
    }

    fn entries(&self, from: Index, to: Index, max: usize) -> Result<Vec<LogEntry>, RaftError> {
        let mut result = Vec::new();
        let mut index = from.max(self.first_index);
        while index <= to && result.len() < max {
            match self.offset(index) {
                Some(o) => result.push(self.entries[o].clone()),
                None => break,
            }
            index += 1;
        }
        Ok(result)
    }

    fn reset_to_snapshot(&mut self, last_index: Index, last_term: Term) -> Result<(), RaftError> {
        self.entries.clear();
        self.first_index = last_index + 1;
        self.snapshot_index = last_index;
        self.snapshot_term = last_term;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::EntryKind;

    fn entry(index: Index, term: Term) -> LogEntry {
        LogEntry::new(index, term, EntryKind::UserCommand, vec![index as u8])
    }

    #[test]
    fn append_enforces_contiguity() {
        let mut log = MemLog::new();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(2, 1)).unwrap();
        assert!(matches!(
            log.append(entry(4, 1)),
            Err(RaftError::IndexGap { expected: 3, got: 4 })
        ));
    }

    #[test]
    fn truncate_removes_exact_suffix() {
        let mut log = MemLog::new();
        for i in 1..=5 {
            log.append(entry(i, 1)).unwrap();
        }
        log.truncate_from(3).unwrap();
        assert_eq!(log.last_index_term(), (2, 1));
        assert_eq!(log.fetch_term(3), TermLookup::Missing);
        assert_eq!(log.fetch_term(2), TermLookup::Term(1));
    }

    #[test]
    fn compact_moves_boundary() {
        let mut log = MemLog::new();
        for i in 1..=5 {
            log.append(entry(i, 2)).unwrap();
        }
        log.compact(3, 2);
        assert_eq!(log.snapshot_last(), (3, 2));
        assert_eq!(log.fetch_term(2), TermLookup::Compacted);
        assert_eq!(log.fetch_term(3), TermLookup::Term(2));
        assert_eq!(log.fetch(4).unwrap().unwrap().index, 4);
        assert_eq!(log.next_index(), 6);
    }

    #[test]
    fn reset_to_snapshot_empties_log() {
        let mut log = MemLog::new();
        for i in 1..=3 {
            log.append(entry(i, 1)).unwrap();
        }
        log.reset_to_snapshot(1000, 4).unwrap();
        assert_eq!(log.last_index_term(), (1000, 4));
        assert_eq!(log.next_index(), 1001);
        assert!(log.is_empty());
    }
}
