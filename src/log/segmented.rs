// Segmented On-Disk Log
//
// Entries live in versioned segment files under `raft-log/`. A new
// segment opens when the active one crosses the configured size.
// Pruning drops whole leading segments; truncation cuts within the
// tail. Recovery opens segments in version order, drops any that no
// longer chain, and repairs a torn tail in the newest one.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};

use crate::common::{LogIndex, Term};
use crate::config::LogConfig;
use crate::error::{RaftError, Result};
use crate::log::entry::LogEntry;
use crate::log::pruning::SegmentStats;
use crate::log::segment::{parse_segment_version, Segment};
use crate::log::{LogReader, RaftLog};

/// The durable log. Interior locking keeps reads available to the
/// commit applier while the driver loop owns all mutation.
pub struct SegmentedRaftLog {
    dir: PathBuf,
    rotate_bytes: u64,
    inner: RwLock<Inner>,
}

struct Inner {
    /// Non-empty, ordered by version and contiguous by index range.
    segments: Vec<Segment>,
}

impl Inner {
    fn active(&self) -> &Segment {
        self.segments.last().expect("segment list never empty")
    }

    fn active_mut(&mut self) -> &mut Segment {
        self.segments.last_mut().expect("segment list never empty")
    }

    fn prev_index(&self) -> LogIndex {
        self.segments[0].header().prev_index
    }

    fn append_index(&self) -> LogIndex {
        self.active().last_index()
    }

    fn last_entry_term(&self) -> Term {
        let active = self.active();
        if active.is_empty() {
            active.header().prev_term
        } else {
            active.term_at(active.last_index()).unwrap_or(0)
        }
    }

    /// Segment holding `index`, by record range.
    fn segment_for(&self, index: LogIndex) -> Option<&Segment> {
        // Segments are sorted by first_index; find the last one that
        // starts at or before the wanted index.
        let pos = self
            .segments
            .partition_point(|segment| segment.first_index() <= index);
        if pos == 0 {
            return None;
        }
        let segment = &self.segments[pos - 1];
        (index <= segment.last_index()).then_some(segment)
    }
}

impl SegmentedRaftLog {
    /// Open (or initialize) the log under `dir`.
    pub fn open(dir: impl Into<PathBuf>, config: &LogConfig) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut versions: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(version) = name.to_str().and_then(parse_segment_version) {
                versions.push((version, entry.path()));
            }
        }
        versions.sort_by_key(|(version, _)| *version);

        let mut segments: Vec<Segment> = Vec::new();
        for (version, path) in versions {
            let (segment, _) = Segment::open(&path)?;
            if segment.header().version != version {
                return Err(RaftError::Corruption(format!(
                    "segment {} carries version {} in its header",
                    path.display(),
                    segment.header().version
                )));
            }
            if let Some(last) = segments.last() {
                if segment.header().prev_index != last.last_index() {
                    // A crash between rotation and first append, or a
                    // truncation that ran ahead of a rotation, leaves a
                    // segment that no longer chains. Later segments are
                    // unrecoverable; drop them.
                    tracing::warn!(
                        path = %path.display(),
                        expected_prev = last.last_index(),
                        actual_prev = segment.header().prev_index,
                        "dropping log segment that does not chain"
                    );
                    segment.delete()?;
                    continue;
                }
            }
            segments.push(segment);
        }

        if segments.is_empty() {
            segments.push(Segment::create(&dir, 1, 0, 0)?);
        }

        let log = Self {
            dir,
            rotate_bytes: config.segment_rotate_bytes,
            inner: RwLock::new(Inner { segments }),
        };
        {
            let inner = log.inner.read();
            tracing::info!(
                segments = inner.segments.len(),
                prev_index = inner.prev_index(),
                append_index = inner.append_index(),
                "opened raft log"
            );
        }
        Ok(log)
    }

    /// Facts about each segment, oldest first, for pruning decisions.
    pub fn segment_stats(&self) -> Vec<SegmentStats> {
        let inner = self.inner.read();
        inner
            .segments
            .iter()
            .map(|segment| SegmentStats {
                first_index: segment.first_index(),
                last_index: segment.last_index(),
                size_bytes: segment.size_bytes(),
                modified: segment
                    .path()
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            })
            .collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LogReader for SegmentedRaftLog {
    fn append_index(&self) -> LogIndex {
        self.inner.read().append_index()
    }

    fn prev_index(&self) -> LogIndex {
        self.inner.read().prev_index()
    }

    fn prev_term(&self) -> Term {
        self.inner.read().segments[0].header().prev_term
    }

    fn read_entry(&self, index: LogIndex) -> Result<LogEntry> {
        let inner = self.inner.read();
        match inner.segment_for(index) {
            Some(segment) => segment.read(index),
            None => Err(RaftError::OutOfRange {
                index,
                low: inner.prev_index(),
                high: inner.append_index(),
            }),
        }
    }

    fn read_entry_term(&self, index: LogIndex) -> Result<Term> {
        let inner = self.inner.read();
        if index == inner.prev_index() {
            return Ok(inner.segments[0].header().prev_term);
        }
        inner
            .segment_for(index)
            .and_then(|segment| segment.term_at(index))
            .ok_or(RaftError::OutOfRange {
                index,
                low: inner.prev_index(),
                high: inner.append_index(),
            })
    }
}

impl RaftLog for SegmentedRaftLog {
    fn append(&self, entries: Vec<LogEntry>) -> Result<LogIndex> {
        let mut inner = self.inner.write();
        if entries.is_empty() {
            return Ok(inner.append_index());
        }

        if inner.active().size_bytes() >= self.rotate_bytes {
            let prev_index = inner.append_index();
            let prev_term = inner.last_entry_term();
            let version = inner.active().header().version + 1;
            let fresh = Segment::create(&self.dir, version, prev_index, prev_term)?;
            tracing::debug!(version, prev_index, "rotated to new log segment");
            inner.segments.push(fresh);
        }

        inner
            .active_mut()
            .append(&entries)
            .map_err(|e| RaftError::LogIo(e.to_string()))?;
        Ok(inner.append_index())
    }

    fn truncate(&self, from_index: LogIndex) -> Result<()> {
        let mut inner = self.inner.write();
        if from_index <= inner.prev_index() {
            return Err(RaftError::InvalidOperation(format!(
                "cannot truncate from {} at or below prev index {}",
                from_index,
                inner.prev_index()
            )));
        }
        if from_index > inner.append_index() {
            return Ok(());
        }

        while inner.segments.len() > 1 && inner.active().first_index() >= from_index {
            let segment = inner.segments.pop().expect("more than one segment");
            segment.delete()?;
        }
        if from_index <= inner.append_index() {
            inner.active_mut().truncate_from(from_index)?;
        }
        Ok(())
    }

    fn prune(&self, up_to_index: LogIndex) -> Result<LogIndex> {
        let mut inner = self.inner.write();
        let up_to = up_to_index.min(inner.append_index());
        if up_to <= inner.prev_index() {
            return Ok(inner.prev_index());
        }

        let covered = inner
            .segments
            .iter()
            .take_while(|segment| segment.last_index() <= up_to)
            .count();

        if covered == inner.segments.len() {
            // Every entry is released: restart with one empty segment
            // whose header pins the pruned prefix.
            let prev_index = inner.append_index();
            let prev_term = inner.last_entry_term();
            let version = inner.active().header().version + 1;
            let fresh = Segment::create(&self.dir, version, prev_index, prev_term)?;
            for segment in inner.segments.drain(..) {
                segment.delete()?;
            }
            inner.segments.push(fresh);
        } else {
            for segment in inner.segments.drain(..covered) {
                segment.delete()?;
            }
        }

        let new_prev = inner.prev_index();
        tracing::info!(prev_index = new_prev, "pruned raft log prefix");
        Ok(new_prev)
    }
}
