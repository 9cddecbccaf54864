// Candidate Role
//
// A candidate increments the term, votes for itself, and solicits the
// rest of the member set. A majority of grants promotes it to leader;
// contact from a current-term leader demotes it; another timeout
// starts the next round at a higher term.

use std::collections::HashSet;

use crate::common::MemberId;
use crate::consensus::message::{RaftMessage, VoteRequest, VoteResponse};
use crate::consensus::outcome::Outcome;
use crate::consensus::roles::{
    follower, handle_prune, leader, CandidateState, RaftView, RoleState,
};

/// Open a new election: bump the term, vote for ourselves, broadcast
/// the solicitation. Used on entry from follower and again on every
/// candidate timeout.
pub fn start_election(view: &RaftView) -> Outcome {
    let new_term = view.current_term + 1;
    tracing::info!(term = new_term, "starting election");

    let mut votes_granted = HashSet::new();
    votes_granted.insert(view.self_id);

    // A single-member cluster elects itself on the spot.
    if view.members.is_quorum(votes_granted.len()) {
        let mut outcome = leader::become_leader(view, new_term);
        outcome.new_term = Some(new_term);
        outcome.new_vote = Some(Some(view.self_id));
        outcome.election_started = true;
        outcome.reset_election_timer = true;
        return outcome;
    }

    let mut outcome = Outcome::stay(RoleState::Candidate(CandidateState { votes_granted }));
    outcome.new_term = Some(new_term);
    outcome.new_vote = Some(Some(view.self_id));
    outcome.new_leader = Some(None);
    outcome.reset_election_timer = true;
    outcome.election_started = true;
    outcome.broadcast(RaftMessage::VoteRequest(VoteRequest {
        term: new_term,
        candidate: view.self_id,
        last_log_index: view.log.append_index(),
        last_log_term: view.log.last_term(),
    }))
}

pub fn handle(
    view: &RaftView,
    state: &CandidateState,
    from: MemberId,
    message: &RaftMessage,
) -> Outcome {
    match message {
        RaftMessage::VoteResponse(response) => on_vote_response(view, state, from, response),

        // A leader for this term exists; fall in line and let the
        // follower logic process the message itself.
        RaftMessage::AppendRequest(_) | RaftMessage::Heartbeat(_) => {
            tracing::info!(term = view.current_term, leader = %from, "yielding candidacy");
            let mut outcome = follower::handle(view, from, message);
            outcome.stepped_down = true;
            outcome
        }

        // We voted for ourselves this term; a rival candidate at the
        // same term is denied first-come-first-served.
        RaftMessage::VoteRequest(_) => Outcome::stay(RoleState::Candidate(state.clone()))
            .send(
                from,
                RaftMessage::VoteResponse(VoteResponse {
                    term: view.current_term,
                    granted: false,
                }),
            ),

        RaftMessage::ElectionTimeout => start_election(view),

        RaftMessage::Prune(request) => handle_prune(
            view,
            &RoleState::Candidate(state.clone()),
            request.prune_index,
        ),

        RaftMessage::NewEntry(_) | RaftMessage::NewBatch(_) => {
            tracing::debug!("dropping client request, election in progress");
            Outcome::stay(RoleState::Candidate(state.clone()))
        }

        RaftMessage::AppendResponse(_)
        | RaftMessage::HeartbeatResponse(_)
        | RaftMessage::LogCompactionInfo(_)
        | RaftMessage::HeartbeatTimeout => Outcome::stay(RoleState::Candidate(state.clone())),
    }
}

fn on_vote_response(
    view: &RaftView,
    state: &CandidateState,
    from: MemberId,
    response: &VoteResponse,
) -> Outcome {
    if !response.granted {
        return Outcome::stay(RoleState::Candidate(state.clone()));
    }

    let mut votes_granted = state.votes_granted.clone();
    votes_granted.insert(from);

    // Only votes from the active member set count towards quorum.
    let counted = votes_granted
        .iter()
        .filter(|member| view.members.contains(member))
        .count();

    tracing::debug!(
        term = view.current_term,
        votes = counted,
        needed = view.members.quorum_size(),
        "vote granted"
    );

    if view.members.is_quorum(counted) {
        let mut outcome = leader::become_leader(view, view.current_term);
        outcome.election_won = true;
        return outcome;
    }

    Outcome::stay(RoleState::Candidate(CandidateState { votes_granted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Term;
    use crate::config::RaftConfig;
    use crate::consensus::message::{AppendEntriesRequest, Heartbeat};
    use crate::consensus::outcome::{LogOp, Outbound};
    use crate::log::{Command, InMemoryRaftLog, LogEntry};
    use crate::membership::MemberSet;
    use std::time::Instant;

    struct Fixture {
        self_id: MemberId,
        peers: Vec<MemberId>,
        members: MemberSet,
        log: InMemoryRaftLog,
        config: RaftConfig,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            let self_id = MemberId::random();
            let peers: Vec<MemberId> = (1..n).map(|_| MemberId::random()).collect();
            let mut all = peers.clone();
            all.push(self_id);
            Self {
                self_id,
                peers,
                members: MemberSet::new(all),
                log: InMemoryRaftLog::new(),
                config: RaftConfig::new(self_id, "/tmp/unused"),
            }
        }

        fn view(&self, term: Term) -> RaftView<'_> {
            RaftView {
                self_id: self.self_id,
                current_term: term,
                voted_for: Some(self.self_id),
                commit_index: 0,
                leader: None,
                members: &self.members,
                pending_member_change: false,
                log: &self.log,
                config: &self.config,
                now: Instant::now(),
            }
        }

        fn candidate(&self) -> CandidateState {
            let mut votes_granted = HashSet::new();
            votes_granted.insert(self.self_id);
            CandidateState { votes_granted }
        }
    }

    #[test]
    fn test_start_election_broadcasts_vote_request() {
        let fixture = Fixture::new(3);
        let view = fixture.view(1);

        let outcome = start_election(&view);
        assert_eq!(outcome.new_term, Some(2));
        assert_eq!(outcome.new_vote, Some(Some(fixture.self_id)));
        assert!(outcome.election_started);
        assert!(outcome.reset_election_timer);
        match &outcome.outbound[0] {
            Outbound::Broadcast(RaftMessage::VoteRequest(request)) => {
                assert_eq!(request.term, 2);
                assert_eq!(request.candidate, fixture.self_id);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_majority_promotes_to_leader() {
        let fixture = Fixture::new(3);
        let view = fixture.view(2);
        let state = fixture.candidate();

        let outcome = handle(
            &view,
            &state,
            fixture.peers[0],
            &RaftMessage::VoteResponse(VoteResponse {
                term: 2,
                granted: true,
            }),
        );

        assert!(outcome.election_won);
        assert!(matches!(outcome.next_role, RoleState::Leader(_)));
        // A fresh leader pins its term with a no-op entry.
        assert!(matches!(
            &outcome.log_ops[..],
            [LogOp::Append(entries)]
                if entries.len() == 1 && entries[0].command == Command::NoOp
        ));
        assert!(outcome.reset_heartbeat_timer);
    }

    #[test]
    fn test_denied_votes_do_not_promote() {
        let fixture = Fixture::new(5);
        let view = fixture.view(2);
        let state = fixture.candidate();

        let outcome = handle(
            &view,
            &state,
            fixture.peers[0],
            &RaftMessage::VoteResponse(VoteResponse {
                term: 2,
                granted: false,
            }),
        );
        assert!(!outcome.election_won);
        assert!(matches!(outcome.next_role, RoleState::Candidate(_)));
    }

    #[test]
    fn test_votes_from_non_members_do_not_count() {
        let fixture = Fixture::new(3);
        let view = fixture.view(2);
        let state = fixture.candidate();

        let outsider = MemberId::random();
        let outcome = handle(
            &view,
            &state,
            outsider,
            &RaftMessage::VoteResponse(VoteResponse {
                term: 2,
                granted: true,
            }),
        );
        assert!(!outcome.election_won);
    }

    #[test]
    fn test_heartbeat_from_current_term_leader_demotes() {
        let fixture = Fixture::new(3);
        let view = fixture.view(2);
        let state = fixture.candidate();

        let outcome = handle(
            &view,
            &state,
            fixture.peers[0],
            &RaftMessage::Heartbeat(Heartbeat {
                term: 2,
                commit_index: 0,
                commit_term: 0,
            }),
        );
        assert!(outcome.stepped_down);
        assert!(matches!(outcome.next_role, RoleState::Follower));
        assert_eq!(outcome.new_leader, Some(Some(fixture.peers[0])));
    }

    #[test]
    fn test_append_from_current_term_leader_is_handled_after_demotion() {
        let fixture = Fixture::new(3);
        let view = fixture.view(2);
        let state = fixture.candidate();

        let outcome = handle(
            &view,
            &state,
            fixture.peers[0],
            &RaftMessage::AppendRequest(AppendEntriesRequest {
                term: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                leader_commit: 0,
                entries: vec![LogEntry::new(2, Command::NoOp)],
            }),
        );
        assert!(outcome.stepped_down);
        assert!(matches!(&outcome.log_ops[..], [LogOp::Append(_)]));
    }

    #[test]
    fn test_rival_candidate_denied() {
        let fixture = Fixture::new(3);
        let view = fixture.view(2);
        let state = fixture.candidate();

        let outcome = handle(
            &view,
            &state,
            fixture.peers[1],
            &RaftMessage::VoteRequest(VoteRequest {
                term: 2,
                candidate: fixture.peers[1],
                last_log_index: 0,
                last_log_term: 0,
            }),
        );
        match &outcome.outbound[0] {
            Outbound::To(_, RaftMessage::VoteResponse(resp)) => assert!(!resp.granted),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timeout_restarts_election_at_higher_term() {
        let fixture = Fixture::new(3);
        let view = fixture.view(2);
        let state = fixture.candidate();

        let outcome = handle(&view, &state, fixture.self_id, &RaftMessage::ElectionTimeout);
        assert_eq!(outcome.new_term, Some(3));
        assert!(outcome.election_started);
    }

    #[test]
    fn test_single_member_cluster_elects_immediately() {
        let fixture = Fixture::new(1);
        let view = fixture.view(0);

        let outcome = start_election(&view);
        assert_eq!(outcome.new_term, Some(1));
        assert!(matches!(outcome.next_role, RoleState::Leader(_)));
    }
}
