// Common Types for the Consensus Core
//
// Shared identifier and index types used across the log, state stores,
// role logic, and wire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Raft term number (logical clock). At most one leader exists per term.
pub type Term = u64;

/// Index into the replicated log. Indexes are 1-based: `0` is the
/// "before the first entry ever" sentinel used for an empty or fully
/// pruned log prefix.
pub type LogIndex = u64;

/// Stable 128-bit identifier of a core cluster member.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Generate a fresh random member id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the whole cluster, bound once at bootstrap and stamped
/// onto every wire message so two distinct clusters can never fuse.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClusterId(Uuid);

impl ClusterId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
