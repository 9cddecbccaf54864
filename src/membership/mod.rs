// Core Membership
//
// Membership changes travel through the replicated log as ordinary
// entries carrying a member set. The active set is the most recent
// member-set entry at or below the commit index, falling back to the
// bootstrap set. Only single add/remove steps are accepted between
// commits so that any two adjacent quorums intersect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::common::{LogIndex, MemberId};
use crate::error::{RaftError, Result};

/// An agreed set of core cluster members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSet {
    members: BTreeSet<MemberId>,
}

impl MemberSet {
    pub fn new(members: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemberId> {
        self.members.iter()
    }

    /// Strictly more than half of the member set.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// True if `count` members reach a majority.
    pub fn is_quorum(&self, count: usize) -> bool {
        count >= self.quorum_size()
    }

    /// New set with one member added.
    pub fn with_member(&self, member: MemberId) -> Self {
        let mut members = self.members.clone();
        members.insert(member);
        Self { members }
    }

    /// New set with one member removed.
    pub fn without_member(&self, member: &MemberId) -> Self {
        let mut members = self.members.clone();
        members.remove(member);
        Self { members }
    }

    /// True if `self` differs from `base` by exactly one addition or
    /// one removal. Adjacent configurations restricted this way always
    /// share a majority.
    pub fn is_single_step_from(&self, base: &MemberSet) -> bool {
        let added = self.members.difference(&base.members).count();
        let removed = base.members.difference(&self.members).count();
        added + removed == 1
    }

    /// Serialized form carried inside a log entry payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(set, _)| set)
            .map_err(|e| RaftError::Serialization(e.to_string()))
    }
}

impl fmt::Display for MemberSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", member)?;
        }
        write!(f, "}}")
    }
}

/// Tracks the active and pending member sets against log progress.
///
/// Owned by the driver loop; mutated only while committing an Outcome.
#[derive(Debug, Clone)]
pub struct MembershipTracker {
    bootstrap: MemberSet,
    active: MemberSet,
    /// Log index of the entry that produced `active`; 0 for bootstrap.
    active_index: LogIndex,
    /// An appended but not yet committed member-set entry, if any.
    pending: Option<(LogIndex, MemberSet)>,
}

impl MembershipTracker {
    pub fn new(bootstrap: MemberSet) -> Self {
        Self {
            active: bootstrap.clone(),
            bootstrap,
            active_index: 0,
            pending: None,
        }
    }

    /// Restore a previously committed set, e.g. from the cached
    /// `raft-state/member-set` file.
    pub fn restore_active(&mut self, index: LogIndex, set: MemberSet) {
        self.active = set;
        self.active_index = index;
    }

    pub fn active(&self) -> &MemberSet {
        &self.active
    }

    pub fn active_index(&self) -> LogIndex {
        self.active_index
    }

    pub fn has_pending_change(&self) -> bool {
        self.pending.is_some()
    }

    /// Validate a proposed member set against the single-step and
    /// one-change-at-a-time rules.
    pub fn validate_proposal(&self, proposed: &MemberSet) -> Result<()> {
        if self.pending.is_some() {
            return Err(RaftError::Membership(
                "a membership change is already in flight".to_string(),
            ));
        }
        if proposed.is_empty() {
            return Err(RaftError::Membership(
                "member set must not be empty".to_string(),
            ));
        }
        if !proposed.is_single_step_from(&self.active) {
            return Err(RaftError::Membership(
                "only single add/remove membership steps are allowed".to_string(),
            ));
        }
        Ok(())
    }

    /// Record a member-set entry appended at `index`.
    pub fn on_append(&mut self, index: LogIndex, set: MemberSet) {
        self.pending = Some((index, set));
    }

    /// Discard pending state invalidated by a truncation at `from`.
    pub fn on_truncate(&mut self, from: LogIndex) {
        if let Some((index, _)) = self.pending {
            if index >= from {
                self.pending = None;
            }
        }
    }

    /// Activate a pending set once covered by the commit index.
    /// Returns the newly active set if it changed.
    pub fn on_commit(&mut self, commit_index: LogIndex) -> Option<MemberSet> {
        match self.pending.take() {
            Some((index, set)) if index <= commit_index => {
                self.active = set.clone();
                self.active_index = index;
                Some(set)
            }
            other => {
                self.pending = other;
                None
            }
        }
    }

    pub fn bootstrap(&self) -> &MemberSet {
        &self.bootstrap
    }
}
