// Follower Shipping State
//
// The leader's view of each peer: how far its log matches, where the
// next batch starts, when it was last heard from, and the single batch
// currently in flight. One outstanding AppendEntries batch per peer;
// a response or an expired RTT budget clears it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::{LogIndex, MemberId};
use crate::membership::MemberSet;

/// An unacknowledged AppendEntries batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightBatch {
    /// `prev_log_index` the batch was framed against.
    pub prev_log_index: LogIndex,

    /// Index of the last entry in the batch.
    pub last_index: LogIndex,

    pub sent_at: Instant,
}

/// Leader-local replication state for one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowerProgress {
    /// Highest index known replicated on the peer.
    pub match_index: LogIndex,

    /// Index of the next entry to ship.
    pub next_index: LogIndex,

    /// Last time any response arrived from the peer.
    pub last_contact: Option<Instant>,

    /// The batch awaiting acknowledgement, if any.
    pub in_flight: Option<InFlightBatch>,
}

impl FollowerProgress {
    fn new(next_index: LogIndex) -> Self {
        Self {
            match_index: 0,
            next_index,
            last_contact: None,
            in_flight: None,
        }
    }
}

/// All peers' progress, initialized at election win.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FollowerStates {
    peers: HashMap<MemberId, FollowerProgress>,
}

impl FollowerStates {
    /// Fresh state for a new leader: every peer starts optimistically
    /// at `next_index = append_index + 1` with nothing matched.
    pub fn init(members: &MemberSet, self_id: MemberId, append_index: LogIndex) -> Self {
        let peers = members
            .iter()
            .filter(|member| **member != self_id)
            .map(|member| (*member, FollowerProgress::new(append_index + 1)))
            .collect();
        Self { peers }
    }

    pub fn get(&self, peer: &MemberId) -> Option<&FollowerProgress> {
        self.peers.get(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MemberId, &FollowerProgress)> {
        self.peers.iter()
    }

    /// Track a peer added to the member set mid-term.
    pub fn ensure_peer(&mut self, peer: MemberId, append_index: LogIndex) {
        self.peers
            .entry(peer)
            .or_insert_with(|| FollowerProgress::new(append_index + 1));
    }

    /// Drop peers no longer in the member set.
    pub fn retain_members(&mut self, members: &MemberSet) {
        self.peers.retain(|peer, _| members.contains(peer));
    }

    /// A successful AppendEntries response: `match_index` only ever
    /// grows, `next_index` follows it.
    pub fn on_success(&mut self, peer: MemberId, match_index: LogIndex, now: Instant) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.match_index = progress.match_index.max(match_index);
            progress.next_index = progress.match_index + 1;
            progress.last_contact = Some(now);
            progress.in_flight = None;
        }
    }

    /// A failed AppendEntries response: back off `next_index` using the
    /// follower's append index as a hint, never below `floor`.
    pub fn on_failure(
        &mut self,
        peer: MemberId,
        follower_append: LogIndex,
        floor: LogIndex,
        now: Instant,
    ) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            let backed_off = progress.next_index.saturating_sub(1);
            progress.next_index = backed_off.min(follower_append + 1).max(floor);
            progress.last_contact = Some(now);
            progress.in_flight = None;
        }
    }

    pub fn record_contact(&mut self, peer: MemberId, now: Instant) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.last_contact = Some(now);
        }
    }

    pub fn set_in_flight(&mut self, peer: MemberId, batch: InFlightBatch) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.in_flight = Some(batch);
        }
    }

    /// The in-flight batch if it has been outstanding longer than the
    /// RTT budget; it should be resent from the same position.
    pub fn expired_in_flight(
        &self,
        peer: &MemberId,
        now: Instant,
        rtt_budget: Duration,
    ) -> Option<InFlightBatch> {
        let batch = self.peers.get(peer)?.in_flight?;
        (now.duration_since(batch.sent_at) >= rtt_budget).then_some(batch)
    }

    /// Highest index replicated on a majority of `members`, counting
    /// the leader itself at `self_append`.
    pub fn quorum_match_index(
        &self,
        members: &MemberSet,
        self_id: MemberId,
        self_append: LogIndex,
    ) -> LogIndex {
        let mut matches: Vec<LogIndex> = members
            .iter()
            .map(|member| {
                if *member == self_id {
                    self_append
                } else {
                    self.peers.get(member).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        // Descending: element at quorum_size-1 is replicated on a
        // majority.
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = members.quorum_size();
        if quorum == 0 || matches.len() < quorum {
            return 0;
        }
        matches[quorum - 1]
    }

    /// Lowest match index among peers heard from within `window`.
    /// Pruning must not pass this point while those peers stream.
    pub fn min_live_match(&self, now: Instant, window: Duration) -> Option<LogIndex> {
        self.peers
            .values()
            .filter(|progress| {
                progress
                    .last_contact
                    .is_some_and(|at| now.duration_since(at) <= window)
            })
            .map(|progress| progress.match_index)
            .min()
    }
}
