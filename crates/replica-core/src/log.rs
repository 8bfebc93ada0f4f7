//! # log
//!
//! why: hold the replicated log of commands and answer the index/term questions both handlers ask
//! relations: owned by node.rs, persisted via replica-storage, shipped inside message.rs requests
//! what: LogEntry struct, Log wrapper with positional indexing and tail-only mutation

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
///
/// Entries are immutable once created; their index is their position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term in which the leader created this entry
    pub term: u64,
    /// Opaque command for the external state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, command: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            command: command.into(),
        }
    }

    /// The placeholder entry a fresh replica holds at index 0
    pub fn sentinel() -> Self {
        Self::new(0, Vec::new())
    }
}

/// The ordered log, indexed from 0
///
/// Only grows by appending and only shrinks from the tail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    /// create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// create a log holding only the sentinel entry
    pub fn with_sentinel() -> Self {
        Self {
            entries: vec![LogEntry::sentinel()],
        }
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// index of the last entry, `None` for an empty log
    pub fn last_index(&self) -> Option<u64> {
        self.len().checked_sub(1)
    }

    /// term of the last entry, `None` for an empty log
    pub fn last_term(&self) -> Option<u64> {
        self.entries.last().map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        let pos = usize::try_from(index).ok()?;
        self.entries.get(pos)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// entries at `index` and after; empty when `index` is past the end
    pub fn entries_from(&self, index: u64) -> &[LogEntry] {
        match usize::try_from(index) {
            Ok(pos) if pos < self.entries.len() => &self.entries[pos..],
            _ => &[],
        }
    }

    /// entries in `(after, through]`, clamped to what the log holds
    pub fn range_after(&self, after: u64, through: u64) -> Vec<(u64, LogEntry)> {
        ((after + 1)..=through)
            .filter_map(|idx| self.get(idx).map(|e| (idx, e.clone())))
            .collect()
    }

    /// drop every entry at `len` and after
    pub fn truncate(&mut self, len: u64) {
        if let Ok(len) = usize::try_from(len) {
            self.entries.truncate(len);
        }
    }

    /// append one entry and return its index
    pub fn push(&mut self, entry: LogEntry) -> u64 {
        self.entries.push(entry);
        self.len() - 1
    }

    pub fn as_slice(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

impl From<Vec<LogEntry>> for Log {
    fn from(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }
}

impl From<Log> for Vec<LogEntry> {
    fn from(log: Log) -> Self {
        log.entries
    }
}
