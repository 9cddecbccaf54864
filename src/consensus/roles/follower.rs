// Follower Role
//
// Followers accept entries from the current-term leader, vote for
// sufficiently up-to-date candidates, and convert to candidate when
// the election timer fires. All term preamble checks happened in the
// dispatcher; messages arriving here carry the follower's own term or
// none at all.

use crate::common::{LogIndex, MemberId};
use crate::consensus::message::{
    AppendEntriesRequest, AppendEntriesResponse, Heartbeat, HeartbeatResponse,
    LogCompactionInfo, RaftMessage, VoteRequest, VoteResponse,
};
use crate::consensus::outcome::{LogOp, Outcome};
use crate::consensus::roles::{candidate, handle_prune, RaftView, RoleState};

pub fn handle(view: &RaftView, from: MemberId, message: &RaftMessage) -> Outcome {
    match message {
        RaftMessage::VoteRequest(request) => vote(view, from, request),
        RaftMessage::AppendRequest(request) => append_entries(view, from, request),
        RaftMessage::Heartbeat(heartbeat) => on_heartbeat(view, from, heartbeat),
        RaftMessage::LogCompactionInfo(info) => on_compaction_info(view, from, info),
        RaftMessage::ElectionTimeout => candidate::start_election(view),
        RaftMessage::Prune(request) => {
            handle_prune(view, &RoleState::Follower, request.prune_index)
        }
        RaftMessage::NewEntry(_) | RaftMessage::NewBatch(_) => {
            tracing::debug!(leader = ?view.leader, "dropping client request, not the leader");
            Outcome::stay(RoleState::Follower)
        }
        // Stray responses from a time this member led or campaigned.
        // Term logic already ran; they must not mutate anything.
        RaftMessage::VoteResponse(_)
        | RaftMessage::AppendResponse(_)
        | RaftMessage::HeartbeatResponse(_)
        | RaftMessage::HeartbeatTimeout => Outcome::stay(RoleState::Follower),
    }
}

/// Grant the vote iff no conflicting vote exists in this term and the
/// candidate's log is at least as up-to-date as ours, comparing
/// `(last_log_term, last_log_index)` lexicographically.
fn vote(view: &RaftView, from: MemberId, request: &VoteRequest) -> Outcome {
    let can_vote = view.voted_for.is_none() || view.voted_for == Some(request.candidate);
    let ours = (view.log.last_term(), view.log.append_index());
    let theirs = (request.last_log_term, request.last_log_index);
    let granted = can_vote && theirs >= ours;

    let mut outcome = Outcome::stay(RoleState::Follower);
    if granted {
        tracing::info!(
            candidate = %request.candidate,
            term = view.current_term,
            "granting vote"
        );
        outcome.new_vote = Some(Some(request.candidate));
        outcome.reset_election_timer = true;
    } else {
        tracing::debug!(
            candidate = %request.candidate,
            term = view.current_term,
            voted_for = ?view.voted_for,
            "denying vote"
        );
    }
    outcome.send(
        from,
        RaftMessage::VoteResponse(VoteResponse {
            term: view.current_term,
            granted,
        }),
    )
}

fn append_entries(view: &RaftView, from: MemberId, request: &AppendEntriesRequest) -> Outcome {
    let append_index = view.log.append_index();
    let prev_index = view.log.prev_index();

    let mut outcome = Outcome::stay(RoleState::Follower);
    outcome.reset_election_timer = true;
    if view.leader != Some(from) {
        outcome.new_leader = Some(Some(from));
    }

    // The leader's prev entry must exist here with the same term.
    // Entries at or below our pruned prefix are committed and need no
    // verification.
    let prev_matches = request.prev_log_index <= append_index
        && (request.prev_log_index < prev_index
            || view.log.read_entry_term(request.prev_log_index)
                .map(|t| t == request.prev_log_term)
                .unwrap_or(false));
    if !prev_matches {
        tracing::debug!(
            prev_log_index = request.prev_log_index,
            prev_log_term = request.prev_log_term,
            append_index,
            "rejecting append, previous entry does not match"
        );
        return outcome.send(
            from,
            RaftMessage::AppendResponse(AppendEntriesResponse {
                term: view.current_term,
                success: false,
                match_index: append_index,
                append_index,
            }),
        );
    }

    // Keep the prefix that already matches, truncate at the first
    // conflicting term, append what is genuinely new.
    let mut truncate_at: Option<LogIndex> = None;
    let mut to_append = Vec::new();
    for (offset, entry) in request.entries.iter().enumerate() {
        let index = request.prev_log_index + 1 + offset as LogIndex;
        if index <= prev_index {
            continue;
        }
        if truncate_at.is_none() && index <= append_index {
            match view.log.read_entry_term(index) {
                Ok(term) if term == entry.term => continue,
                _ => {
                    truncate_at = Some(index);
                    to_append.push(entry.clone());
                }
            }
        } else {
            to_append.push(entry.clone());
        }
    }
    if let Some(index) = truncate_at {
        tracing::info!(
            from_index = index,
            "truncating conflicting suffix from new leader"
        );
        outcome.log_ops.push(LogOp::Truncate(index));
    }
    if !to_append.is_empty() {
        outcome.log_ops.push(LogOp::Append(to_append));
    }

    let last_new = request.prev_log_index + request.entries.len() as LogIndex;
    let new_append = outcome.appended_up_to(append_index);

    let commit_cap = last_new.max(view.commit_index);
    let new_commit = request.leader_commit.min(commit_cap);
    if new_commit > view.commit_index {
        outcome.commit_index = Some(new_commit);
    }

    outcome.send(
        from,
        RaftMessage::AppendResponse(AppendEntriesResponse {
            term: view.current_term,
            success: true,
            match_index: last_new,
            append_index: new_append,
        }),
    )
}

/// A heartbeat is an empty append: it proves leader liveness and
/// carries the commit watermark, which we only adopt for entries we
/// can check the term of locally.
fn on_heartbeat(view: &RaftView, from: MemberId, heartbeat: &Heartbeat) -> Outcome {
    let mut outcome = Outcome::stay(RoleState::Follower);
    outcome.reset_election_timer = true;
    if view.leader != Some(from) {
        outcome.new_leader = Some(Some(from));
    }

    if heartbeat.commit_index > view.commit_index
        && heartbeat.commit_index <= view.log.append_index()
        && view.log.read_entry_term(heartbeat.commit_index)
            .map(|t| t == heartbeat.commit_term)
            .unwrap_or(false)
    {
        outcome.commit_index = Some(heartbeat.commit_index);
    }

    outcome.send(from, RaftMessage::HeartbeatResponse(HeartbeatResponse))
}

/// The leader pruned past what we still need; streaming cannot catch
/// us up any more. Snapshot installation lives outside the core; all
/// we do is surface the condition.
fn on_compaction_info(view: &RaftView, from: MemberId, info: &LogCompactionInfo) -> Outcome {
    if view.log.append_index() < info.prev_index {
        tracing::warn!(
            leader = %from,
            leader_prev_index = info.prev_index,
            append_index = view.log.append_index(),
            "behind the leader's pruned prefix, snapshot catch-up required"
        );
    }
    Outcome::stay(RoleState::Follower)
}
