//! # log
//!
//! why: manage the append-mostly log of commands that raft replicates
//! relations: owned by node.rs, persisted through state.rs and raft-storage
//! what: LogEntry, RaftLog with 1-based indexing, up-to-date comparison, conflict lookup

use serde::{Deserialize, Serialize};
use std::ops::Index;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// The ordered log of a node.
///
/// Index 0 is the sentinel "no entry" with term 0; real entries start at 1
/// and entry `i` is stored at position `i - 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// wrap entries loaded from storage; the caller is responsible for
    /// having checked that indices run 1..=n
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// entry at a 1-based index, `None` for the sentinel or past the end
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// term at a 1-based index; 0 for the sentinel, `None` past the end
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// true when the log holds an entry at `index` whose term is `term`
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// append one entry; its index must be the next one
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log indices must be contiguous");
        self.entries.push(entry);
    }

    /// drop every entry with index >= `from`
    pub fn truncate_from(&mut self, from: u64) {
        let keep = from.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// clone the entries with index >= `from`
    pub fn entries_from(&self, from: u64) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        self.entries.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    /// clone the entries in `from..=to`
    pub fn slice(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if from == 0 || from > to {
            return Vec::new();
        }
        let end = (to as usize).min(self.entries.len());
        let start = from as usize - 1;
        if start >= end {
            return Vec::new();
        }
        self.entries[start..end].to_vec()
    }

    /// first index holding `term`, scanning back from `index`
    pub fn first_index_of_term(&self, term: u64, index: u64) -> u64 {
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// last index holding `term`, if any entry has it
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }

    /// election restriction: is a log ending at (last_term, last_index)
    /// at least as up-to-date as this one
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let my_term = self.last_term();
        last_term > my_term || (last_term == my_term && last_index >= self.last_index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

impl Index<usize> for RaftLog {
    type Output = LogEntry;

    /// positional access (0-based), mirrors `Vec`
    fn index(&self, pos: usize) -> &LogEntry {
        &self.entries[pos]
    }
}
