// Pruning Policy
//
// Strategies propose how much of the log prefix to release. The driver
// clamps the proposal against the commit-index safety margin and the
// slowest live follower before any segment is actually dropped.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::common::LogIndex;

/// Per-segment facts the strategies work from.
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub first_index: LogIndex,
    pub last_index: LogIndex,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl SegmentStats {
    pub fn entry_count(&self) -> u64 {
        self.last_index.saturating_sub(self.first_index) + 1
    }
}

/// How much history to retain when pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PruneStrategy {
    /// Keep at least this many of the newest entries.
    KeepEntries(u64),

    /// Keep at least this many bytes of the newest segments.
    KeepBytes(u64),

    /// Keep segments younger than this.
    KeepAge(Duration),
}

impl PruneStrategy {
    /// Highest index the strategy is willing to release, given the
    /// current segment layout. Returns 0 when nothing should go.
    pub fn prune_point(&self, segments: &[SegmentStats], append_index: LogIndex) -> LogIndex {
        match self {
            PruneStrategy::KeepEntries(keep) => append_index.saturating_sub(*keep),
            PruneStrategy::KeepBytes(keep) => {
                let mut budget = *keep;
                let mut point = 0;
                for stats in segments.iter().rev() {
                    if stats.last_index == 0 {
                        continue;
                    }
                    if budget >= stats.size_bytes {
                        budget -= stats.size_bytes;
                    } else {
                        point = stats.last_index;
                        break;
                    }
                }
                point
            }
            PruneStrategy::KeepAge(age) => {
                let cutoff = SystemTime::now()
                    .checked_sub(*age)
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                segments
                    .iter()
                    .filter(|stats| stats.modified < cutoff && stats.last_index > 0)
                    .map(|stats| stats.last_index)
                    .max()
                    .unwrap_or(0)
            }
        }
    }
}
