// Role Transition Logic
//
// The three Raft roles as a tagged variant plus the term preamble
// shared by every message. Role functions are pure: they read a
// snapshot view and the log, and describe all effects in an Outcome.
// The driver loop applies the Outcome atomically, with persistence
// ordered before any outbound emission.

pub mod candidate;
pub mod follower;
pub mod leader;

use std::collections::HashSet;
use std::time::Instant;

use crate::common::{LogIndex, MemberId, Term};
use crate::config::RaftConfig;
use crate::consensus::message::{AppendEntriesResponse, RaftMessage, VoteResponse};
use crate::consensus::outcome::{LogOp, Outcome};
use crate::consensus::shipping::FollowerStates;
use crate::log::LogReader;
use crate::membership::MemberSet;

/// Candidate-only volatile state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CandidateState {
    pub votes_granted: HashSet<MemberId>,
}

/// Leader-only volatile state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LeaderState {
    pub followers: FollowerStates,
}

/// The role a member runs as, with its role-private state.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleState {
    Follower,
    Candidate(CandidateState),
    Leader(LeaderState),

    /// Inert after an unrecoverable durability failure; refuses all
    /// messages.
    Stopped,
}

impl RoleState {
    pub fn name(&self) -> &'static str {
        match self {
            RoleState::Follower => "follower",
            RoleState::Candidate(_) => "candidate",
            RoleState::Leader(_) => "leader",
            RoleState::Stopped => "stopped",
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, RoleState::Leader(_))
    }
}

/// Public role tag, exposed through the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

impl From<&RoleState> for Role {
    fn from(state: &RoleState) -> Self {
        match state {
            RoleState::Follower => Role::Follower,
            RoleState::Candidate(_) => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
            RoleState::Stopped => Role::Stopped,
        }
    }
}

/// Immutable snapshot handed to the pure role functions.
#[derive(Clone, Copy)]
pub struct RaftView<'a> {
    pub self_id: MemberId,
    pub current_term: Term,
    pub voted_for: Option<MemberId>,
    pub commit_index: LogIndex,
    pub leader: Option<MemberId>,
    pub members: &'a MemberSet,
    pub pending_member_change: bool,
    pub log: &'a dyn LogReader,
    pub config: &'a RaftConfig,
    pub now: Instant,
}

/// Process one message at the current role, applying the term preamble
/// first: a higher sender term forces adoption and step-down before
/// the message itself is handled; a lower one draws a minimal reject
/// where the protocol has a response for it.
pub fn handle(
    view: &RaftView,
    role: &RoleState,
    from: MemberId,
    message: &RaftMessage,
) -> Outcome {
    if matches!(role, RoleState::Stopped) {
        return Outcome::stay(RoleState::Stopped);
    }

    if let Some(sender_term) = message.term() {
        if sender_term > view.current_term {
            return adopt_higher_term(view, role, from, sender_term, message);
        }
        if sender_term < view.current_term {
            return reject_stale(view, role, from, message);
        }
    }

    match role {
        RoleState::Follower => follower::handle(view, from, message),
        RoleState::Candidate(state) => candidate::handle(view, state, from, message),
        RoleState::Leader(state) => leader::handle(view, state, from, message),
        RoleState::Stopped => Outcome::stay(RoleState::Stopped),
    }
}

fn adopt_higher_term(
    view: &RaftView,
    role: &RoleState,
    from: MemberId,
    sender_term: Term,
    message: &RaftMessage,
) -> Outcome {
    tracing::debug!(
        term = sender_term,
        own_term = view.current_term,
        message = message.name(),
        "adopting higher term"
    );

    let mut adjusted = *view;
    adjusted.current_term = sender_term;
    adjusted.voted_for = None;
    adjusted.leader = None;

    let mut outcome = follower::handle(&adjusted, from, message);
    outcome.new_term = Some(sender_term);
    if outcome.new_vote.is_none() {
        outcome.new_vote = Some(None);
    }
    if outcome.new_leader.is_none() {
        outcome.new_leader = Some(None);
    }
    if !matches!(role, RoleState::Follower) {
        outcome.stepped_down = true;
        outcome.reset_election_timer = true;
    }
    outcome
}

fn reject_stale(
    view: &RaftView,
    role: &RoleState,
    from: MemberId,
    message: &RaftMessage,
) -> Outcome {
    let outcome = Outcome::stay(role.clone());
    match message {
        RaftMessage::VoteRequest(_) => outcome.send(
            from,
            RaftMessage::VoteResponse(VoteResponse {
                term: view.current_term,
                granted: false,
            }),
        ),
        RaftMessage::AppendRequest(_) | RaftMessage::Heartbeat(_) => {
            let append_index = view.log.append_index();
            outcome.send(
                from,
                RaftMessage::AppendResponse(AppendEntriesResponse {
                    term: view.current_term,
                    success: false,
                    match_index: append_index,
                    append_index,
                }),
            )
        }
        _ => outcome,
    }
}

/// Shared PruneRequest handling: clamp the requested point against the
/// commit-index safety margin (and, on leaders, against the slowest
/// live follower) before releasing anything.
pub(crate) fn handle_prune(view: &RaftView, role: &RoleState, requested: LogIndex) -> Outcome {
    let margin = view.config.prune.safety_margin;
    let mut safe = requested.min(view.commit_index.saturating_sub(margin));

    if let RoleState::Leader(state) = role {
        let window = view.config.shipping.follower_liveness_window;
        if let Some(live_floor) = state.followers.min_live_match(view.now, window) {
            safe = safe.min(live_floor);
        }
    }

    let mut outcome = Outcome::stay(role.clone());
    if safe > view.log.prev_index() {
        tracing::debug!(requested, safe, "scheduling log prune");
        outcome.log_ops.push(LogOp::Prune(safe));
    }
    outcome
}
