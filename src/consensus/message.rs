// Raft Message Protocol
//
// Every wire message carries the sender's term where the protocol
// requires one. Timer expirations ride the same dispatch path as
// synthetic messages that never touch the wire.

use serde::{Deserialize, Serialize};

use crate::common::{ClusterId, LogIndex, MemberId, Term};
use crate::log::entry::{Command, LogEntry};

/// Vote solicitation from a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term.
    pub term: Term,

    /// Candidate requesting the vote.
    pub candidate: MemberId,

    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Current term, for the candidate to update itself.
    pub term: Term,

    /// True if the candidate received the vote.
    pub granted: bool,
}

/// Log replication (empty `entries` acts as a probe).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,

    /// Index of the entry immediately preceding the new ones; 0 when
    /// replicating from the very start of history.
    pub prev_log_index: LogIndex,

    /// Term of the `prev_log_index` entry.
    pub prev_log_term: Term,

    /// Leader's commit index.
    pub leader_commit: LogIndex,

    /// Entries to store.
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself.
    pub term: Term,

    /// True if the follower matched `prev_log_index`/`prev_log_term`.
    pub success: bool,

    /// On success: highest index known replicated on the follower.
    /// On failure: the follower's append index, as a backtrack hint.
    pub match_index: LogIndex,

    /// The follower's current append index.
    pub append_index: LogIndex,
}

/// Leader liveness signal carrying the commit watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub term: Term,

    /// Leader's commit index.
    pub commit_index: LogIndex,

    /// Term of the entry at `commit_index`.
    pub commit_term: Term,
}

/// Acknowledgement of a heartbeat. Carries nothing beyond the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse;

/// Tells a lagging follower that the entries it needs were pruned and
/// it must catch up by snapshot instead of streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCompactionInfo {
    pub term: Term,

    /// Leader's pruned-prefix boundary.
    pub prev_index: LogIndex,
}

/// A client command submitted for replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntryRequest {
    pub command: Command,
}

/// A batch of client commands submitted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatchRequest {
    pub commands: Vec<Command>,
}

/// Out-of-band request to release log prefix up to `prune_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneRequest {
    pub prune_index: LogIndex,
}

/// Everything the driver loop can be asked to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendRequest(AppendEntriesRequest),
    AppendResponse(AppendEntriesResponse),
    Heartbeat(Heartbeat),
    HeartbeatResponse(HeartbeatResponse),
    LogCompactionInfo(LogCompactionInfo),
    NewEntry(NewEntryRequest),
    NewBatch(NewBatchRequest),
    Prune(PruneRequest),

    /// Election timer fired. Never serialized.
    ElectionTimeout,

    /// Heartbeat timer fired. Never serialized.
    HeartbeatTimeout,
}

impl RaftMessage {
    /// The sender's term, for messages that carry one.
    pub fn term(&self) -> Option<Term> {
        match self {
            RaftMessage::VoteRequest(m) => Some(m.term),
            RaftMessage::VoteResponse(m) => Some(m.term),
            RaftMessage::AppendRequest(m) => Some(m.term),
            RaftMessage::AppendResponse(m) => Some(m.term),
            RaftMessage::Heartbeat(m) => Some(m.term),
            RaftMessage::LogCompactionInfo(m) => Some(m.term),
            RaftMessage::HeartbeatResponse(_)
            | RaftMessage::NewEntry(_)
            | RaftMessage::NewBatch(_)
            | RaftMessage::Prune(_)
            | RaftMessage::ElectionTimeout
            | RaftMessage::HeartbeatTimeout => None,
        }
    }

    /// Wire type code; None for timer-internal messages.
    pub fn type_code(&self) -> Option<u8> {
        match self {
            RaftMessage::VoteRequest(_) => Some(1),
            RaftMessage::VoteResponse(_) => Some(2),
            RaftMessage::AppendRequest(_) => Some(3),
            RaftMessage::AppendResponse(_) => Some(4),
            RaftMessage::Heartbeat(_) => Some(5),
            RaftMessage::HeartbeatResponse(_) => Some(6),
            RaftMessage::LogCompactionInfo(_) => Some(7),
            RaftMessage::NewEntry(_) => Some(8),
            RaftMessage::NewBatch(_) => Some(9),
            RaftMessage::Prune(_) => Some(10),
            RaftMessage::ElectionTimeout | RaftMessage::HeartbeatTimeout => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest(_) => "vote-request",
            RaftMessage::VoteResponse(_) => "vote-response",
            RaftMessage::AppendRequest(_) => "append-entries-request",
            RaftMessage::AppendResponse(_) => "append-entries-response",
            RaftMessage::Heartbeat(_) => "heartbeat",
            RaftMessage::HeartbeatResponse(_) => "heartbeat-response",
            RaftMessage::LogCompactionInfo(_) => "log-compaction-info",
            RaftMessage::NewEntry(_) => "new-entry-request",
            RaftMessage::NewBatch(_) => "new-batch-request",
            RaftMessage::Prune(_) => "prune-request",
            RaftMessage::ElectionTimeout => "election-timeout",
            RaftMessage::HeartbeatTimeout => "heartbeat-timeout",
        }
    }
}

/// A message stamped with its origin and cluster identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub cluster_id: ClusterId,
    pub from: MemberId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(cluster_id: ClusterId, from: MemberId, message: RaftMessage) -> Self {
        Self {
            cluster_id,
            from,
            message,
        }
    }
}
