// In-Memory Log
//
// A volatile implementation of the log used by deterministic tests and
// simulations. Semantics match the segmented log, without durability.

use parking_lot::RwLock;
use std::collections::VecDeque;

use crate::common::{LogIndex, Term};
use crate::error::{RaftError, Result};
use crate::log::entry::LogEntry;
use crate::log::{LogReader, RaftLog};

#[derive(Default)]
struct Inner {
    entries: VecDeque<LogEntry>,
    prev_index: LogIndex,
    prev_term: Term,
}

/// Volatile log double.
#[derive(Default)]
pub struct InMemoryRaftLog {
    inner: RwLock<Inner>,
}

impl InMemoryRaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log pre-populated with `entries` starting at index 1.
    pub fn with_entries(entries: impl IntoIterator<Item = LogEntry>) -> Self {
        let log = Self::new();
        log.inner.write().entries = entries.into_iter().collect();
        log
    }
}

impl LogReader for InMemoryRaftLog {
    fn append_index(&self) -> LogIndex {
        let inner = self.inner.read();
        inner.prev_index + inner.entries.len() as LogIndex
    }

    fn prev_index(&self) -> LogIndex {
        self.inner.read().prev_index
    }

    fn prev_term(&self) -> Term {
        self.inner.read().prev_term
    }

    fn read_entry(&self, index: LogIndex) -> Result<LogEntry> {
        let inner = self.inner.read();
        let append = inner.prev_index + inner.entries.len() as LogIndex;
        if index <= inner.prev_index || index > append {
            return Err(RaftError::OutOfRange {
                index,
                low: inner.prev_index,
                high: append,
            });
        }
        Ok(inner.entries[(index - inner.prev_index - 1) as usize].clone())
    }

    fn read_entry_term(&self, index: LogIndex) -> Result<Term> {
        let inner = self.inner.read();
        if index == inner.prev_index {
            return Ok(inner.prev_term);
        }
        let append = inner.prev_index + inner.entries.len() as LogIndex;
        if index <= inner.prev_index || index > append {
            return Err(RaftError::OutOfRange {
                index,
                low: inner.prev_index,
                high: append,
            });
        }
        Ok(inner.entries[(index - inner.prev_index - 1) as usize].term)
    }
}

impl RaftLog for InMemoryRaftLog {
    fn append(&self, entries: Vec<LogEntry>) -> Result<LogIndex> {
        let mut inner = self.inner.write();
        inner.entries.extend(entries);
        Ok(inner.prev_index + inner.entries.len() as LogIndex)
    }

    fn truncate(&self, from_index: LogIndex) -> Result<()> {
        let mut inner = self.inner.write();
        if from_index <= inner.prev_index {
            return Err(RaftError::InvalidOperation(format!(
                "cannot truncate from {} at or below prev index {}",
                from_index, inner.prev_index
            )));
        }
        let keep = (from_index - inner.prev_index - 1) as usize;
        if keep < inner.entries.len() {
            inner.entries.truncate(keep);
        }
        Ok(())
    }

    fn prune(&self, up_to_index: LogIndex) -> Result<LogIndex> {
        let mut inner = self.inner.write();
        let append = inner.prev_index + inner.entries.len() as LogIndex;
        let up_to = up_to_index.min(append);
        while inner.prev_index < up_to {
            let entry = inner.entries.pop_front().expect("entries cover up_to");
            inner.prev_index += 1;
            inner.prev_term = entry.term;
        }
        Ok(inner.prev_index)
    }
}
