// Replicated Log
//
// The durable, append-only, prunable sequence of entries at the heart
// of the consensus core. Role logic reads through [`LogReader`]; the
// driver loop mutates through [`RaftLog`]. The production
// implementation is the segmented on-disk log; an in-memory double
// backs the deterministic tests.

pub mod entry;
pub mod memory;
pub mod pruning;
pub mod segment;
pub mod segmented;

pub use entry::{Command, LogEntry};
pub use memory::InMemoryRaftLog;
pub use pruning::PruneStrategy;
pub use segmented::SegmentedRaftLog;

use crate::common::{LogIndex, Term};
use crate::error::Result;

/// Read-only view of the log, sufficient for role transition logic and
/// the commit applier.
pub trait LogReader: Send + Sync {
    /// Index of the last appended entry; 0 when the log is empty.
    fn append_index(&self) -> LogIndex;

    /// Index of the last pruned entry; entries at or below it are gone.
    fn prev_index(&self) -> LogIndex;

    /// Term of the entry at `prev_index`.
    fn prev_term(&self) -> Term;

    /// Entry at `index`, which must lie in `(prev_index, append_index]`.
    fn read_entry(&self, index: LogIndex) -> Result<LogEntry>;

    /// Term of the entry at `index`; additionally valid at
    /// `prev_index`, where it returns `prev_term`.
    fn read_entry_term(&self, index: LogIndex) -> Result<Term>;

    /// Term of the last entry, falling back to `prev_term` for an
    /// empty (or fully pruned) log.
    fn last_term(&self) -> Term {
        let append = self.append_index();
        if append == self.prev_index() {
            self.prev_term()
        } else {
            self.read_entry_term(append).unwrap_or_else(|_| self.prev_term())
        }
    }
}

/// Mutating operations, owned by the driver loop.
pub trait RaftLog: LogReader {
    /// Durably append entries at the end; returns the new append index.
    /// Returns only after the entries are stable on disk.
    fn append(&self, entries: Vec<LogEntry>) -> Result<LogIndex>;

    /// Discard all entries at `from_index` and above. `from_index` must
    /// be greater than `prev_index`.
    fn truncate(&self, from_index: LogIndex) -> Result<()>;

    /// Release the prefix up to `up_to_index` (inclusive), as far as
    /// the physical layout permits. Returns the new `prev_index`.
    fn prune(&self, up_to_index: LogIndex) -> Result<LogIndex>;
}
