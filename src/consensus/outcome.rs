// Outcome of Handling One Message
//
// Role logic is pure: it never touches disk or the network. Everything
// a message causes (role change, term/vote persistence, log operations,
// commit advancement, outbound traffic, timer resets) is described in
// an Outcome, which the driver applies atomically with durable writes
// ordered before any outbound emission.

use crate::common::{LogIndex, MemberId, Term};
use crate::consensus::message::RaftMessage;
use crate::consensus::roles::RoleState;
use crate::log::entry::LogEntry;

/// An ordered log mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum LogOp {
    Append(Vec<LogEntry>),
    Truncate(LogIndex),
    Prune(LogIndex),
}

/// An outbound message or broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    To(MemberId, RaftMessage),
    Broadcast(RaftMessage),
}

/// The complete effect of processing one inbound event.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Role to run as after this message.
    pub next_role: RoleState,

    /// Term to persist, if it changed.
    pub new_term: Option<Term>,

    /// Vote to persist, if it changed. `Some(None)` clears the vote.
    pub new_vote: Option<Option<MemberId>>,

    /// Ordered log mutations.
    pub log_ops: Vec<LogOp>,

    /// New commit index, if advanced.
    pub commit_index: Option<LogIndex>,

    /// Newly known leader, if it changed. `Some(None)` forgets it.
    pub new_leader: Option<Option<MemberId>>,

    /// Messages to emit after the durable writes above complete.
    pub outbound: Vec<Outbound>,

    pub reset_election_timer: bool,
    pub reset_heartbeat_timer: bool,

    /// Observable signals for metrics and monitoring.
    pub election_started: bool,
    pub election_won: bool,
    pub stepped_down: bool,
}

impl Outcome {
    /// An outcome that changes nothing but the (possibly same) role.
    pub fn stay(role: RoleState) -> Self {
        Self {
            next_role: role,
            new_term: None,
            new_vote: None,
            log_ops: Vec::new(),
            commit_index: None,
            new_leader: None,
            outbound: Vec::new(),
            reset_election_timer: false,
            reset_heartbeat_timer: false,
            election_started: false,
            election_won: false,
            stepped_down: false,
        }
    }

    pub fn send(mut self, to: MemberId, message: RaftMessage) -> Self {
        self.outbound.push(Outbound::To(to, message));
        self
    }

    pub fn broadcast(mut self, message: RaftMessage) -> Self {
        self.outbound.push(Outbound::Broadcast(message));
        self
    }

    /// Index the log will end at once the appends in this outcome are
    /// applied, given the current append index.
    pub fn appended_up_to(&self, mut append_index: LogIndex) -> LogIndex {
        for op in &self.log_ops {
            match op {
                LogOp::Append(entries) => append_index += entries.len() as LogIndex,
                LogOp::Truncate(from) => append_index = from.saturating_sub(1),
                LogOp::Prune(_) => {}
            }
        }
        append_index
    }
}
