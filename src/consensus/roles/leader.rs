// Leader Role
//
// The single writer for its term: accepts client commands, ships
// batches to followers with one in-flight batch per peer, advances the
// commit index under the current-term quorum rule, and points
// hopelessly lagging followers at snapshot catch-up.

use crate::common::{LogIndex, MemberId, Term};
use crate::consensus::message::{
    AppendEntriesRequest, AppendEntriesResponse, Heartbeat, LogCompactionInfo, RaftMessage,
    VoteResponse,
};
use crate::consensus::outcome::{LogOp, Outbound, Outcome};
use crate::consensus::roles::{handle_prune, LeaderState, RaftView, RoleState};
use crate::consensus::shipping::{FollowerStates, InFlightBatch};
use crate::log::entry::{Command, LogEntry};

/// Promotion at election win (or single-member self-election).
///
/// Follower indexes start optimistically at `append_index + 1`, a
/// no-op entry pins the new term so earlier-term entries can commit,
/// and an initial heartbeat announces the leadership.
pub fn become_leader(view: &RaftView, term: Term) -> Outcome {
    let append_index = view.log.append_index();
    tracing::info!(term, append_index, "won election, becoming leader");

    let followers = FollowerStates::init(view.members, view.self_id, append_index);
    let mut outcome = Outcome::stay(RoleState::Leader(LeaderState { followers }));
    outcome.log_ops.push(LogOp::Append(vec![LogEntry::noop(term)]));
    outcome.new_leader = Some(Some(view.self_id));
    outcome.reset_heartbeat_timer = true;
    outcome.broadcast(RaftMessage::Heartbeat(Heartbeat {
        term,
        commit_index: view.commit_index,
        commit_term: commit_term_of(view),
    }))
}

pub fn handle(
    view: &RaftView,
    state: &LeaderState,
    from: MemberId,
    message: &RaftMessage,
) -> Outcome {
    match message {
        RaftMessage::NewEntry(request) => {
            append_commands(view, state, vec![request.command.clone()])
        }
        RaftMessage::NewBatch(request) => append_commands(view, state, request.commands.clone()),
        RaftMessage::AppendResponse(response) => on_append_response(view, state, from, response),
        RaftMessage::HeartbeatResponse(_) => on_heartbeat_response(view, state, from),
        RaftMessage::HeartbeatTimeout => on_heartbeat_timeout(view, state),
        RaftMessage::Prune(request) => handle_prune(
            view,
            &RoleState::Leader(state.clone()),
            request.prune_index,
        ),

        // We hold this term; any same-term candidate already lost.
        RaftMessage::VoteRequest(_) => Outcome::stay(RoleState::Leader(state.clone())).send(
            from,
            RaftMessage::VoteResponse(VoteResponse {
                term: view.current_term,
                granted: false,
            }),
        ),

        // Election safety guarantees one leader per term; a same-term
        // append here means something is deeply wrong upstream.
        RaftMessage::AppendRequest(_) | RaftMessage::Heartbeat(_) => {
            tracing::error!(
                term = view.current_term,
                from = %from,
                "second leader detected in this term, dropping its traffic"
            );
            Outcome::stay(RoleState::Leader(state.clone()))
        }

        RaftMessage::VoteResponse(_)
        | RaftMessage::LogCompactionInfo(_)
        | RaftMessage::ElectionTimeout => Outcome::stay(RoleState::Leader(state.clone())),
    }
}

/// Append client commands at the current term, ship them to caught-up
/// peers immediately, and re-evaluate the commit index (a single-member
/// cluster commits on append).
fn append_commands(view: &RaftView, state: &LeaderState, commands: Vec<Command>) -> Outcome {
    let mut accepted = Vec::new();
    let mut member_set_in_batch = view.pending_member_change;
    for command in commands {
        if let Command::MemberSet(set) = &command {
            if member_set_in_batch {
                tracing::warn!("refusing member set, another change is uncommitted");
                continue;
            }
            if !set.is_single_step_from(view.members) {
                tracing::warn!(proposed = %set, "refusing non-single-step member set");
                continue;
            }
            member_set_in_batch = true;
        }
        accepted.push(command);
    }

    if accepted.is_empty() {
        return Outcome::stay(RoleState::Leader(state.clone()));
    }

    let append_index = view.log.append_index();
    let first_new = append_index + 1;
    let entries: Vec<LogEntry> = accepted
        .into_iter()
        .map(|command| LogEntry::new(view.current_term, command))
        .collect();
    let new_append = append_index + entries.len() as LogIndex;

    let mut followers = state.followers.clone();
    let mut outcome = Outcome::stay(RoleState::Follower); // placeholder, replaced below
    outcome.log_ops.push(LogOp::Append(entries.clone()));

    // With a quorum of one the entry commits as soon as it is durable.
    let quorum = followers.quorum_match_index(view.members, view.self_id, new_append);
    let mut leader_commit = view.commit_index;
    if quorum > view.commit_index && entry_term(view, quorum, &entries, first_new) == Some(view.current_term) {
        leader_commit = quorum;
        outcome.commit_index = Some(quorum);
    }

    // Peers already at the head receive the fresh entries right away;
    // lagging peers stay paced by the heartbeat tick.
    for peer in peer_ids(&followers) {
        let up_to_date = followers
            .get(&peer)
            .is_some_and(|p| p.in_flight.is_none() && p.next_index == first_new);
        if up_to_date {
            followers.set_in_flight(
                peer,
                InFlightBatch {
                    prev_log_index: append_index,
                    last_index: new_append,
                    sent_at: view.now,
                },
            );
            outcome.outbound.push(Outbound::To(
                peer,
                RaftMessage::AppendRequest(AppendEntriesRequest {
                    term: view.current_term,
                    prev_log_index: append_index,
                    prev_log_term: term_at(view, append_index),
                    leader_commit,
                    entries: entries.clone(),
                }),
            ));
        }
    }

    outcome.next_role = RoleState::Leader(LeaderState { followers });
    outcome
}

fn on_append_response(
    view: &RaftView,
    state: &LeaderState,
    from: MemberId,
    response: &AppendEntriesResponse,
) -> Outcome {
    if !view.members.contains(&from) && state.followers.get(&from).is_none() {
        return Outcome::stay(RoleState::Leader(state.clone()));
    }

    let mut followers = state.followers.clone();
    let mut outcome = Outcome::stay(RoleState::Follower); // placeholder, replaced below
    let append_index = view.log.append_index();

    if response.success {
        followers.on_success(from, response.match_index, view.now);

        // Commit rule: the highest index replicated on a majority,
        // provided the entry there carries the current term. Earlier
        // terms commit only indirectly underneath it.
        let quorum = followers.quorum_match_index(view.members, view.self_id, append_index);
        if quorum > view.commit_index
            && view.log.read_entry_term(quorum).ok() == Some(view.current_term)
        {
            tracing::debug!(commit_index = quorum, "advancing commit index");
            outcome.commit_index = Some(quorum);
        }

        // Keep a lagging follower streaming without waiting for the
        // next heartbeat tick.
        let next = followers.get(&from).map(|p| p.next_index).unwrap_or(0);
        if next != 0 && next <= append_index {
            ship(view, &mut followers, from, outcome.commit_index.unwrap_or(view.commit_index), &mut outcome);
        }
    } else if response.append_index < view.log.prev_index() {
        // The follower's whole log predates our retained window.
        followers.record_contact(from, view.now);
        outcome.outbound.push(Outbound::To(
            from,
            RaftMessage::LogCompactionInfo(LogCompactionInfo {
                term: view.current_term,
                prev_index: view.log.prev_index(),
            }),
        ));
    } else {
        followers.on_failure(
            from,
            response.append_index,
            view.log.prev_index() + 1,
            view.now,
        );
        ship(view, &mut followers, from, view.commit_index, &mut outcome);
    }

    outcome.next_role = RoleState::Leader(LeaderState { followers });
    outcome
}

fn on_heartbeat_response(view: &RaftView, state: &LeaderState, from: MemberId) -> Outcome {
    let mut followers = state.followers.clone();
    followers.record_contact(from, view.now);

    let mut outcome = Outcome::stay(RoleState::Follower); // placeholder, replaced below
    // A follower whose next entry was pruned away cannot be caught up
    // by streaming any more.
    let needs_snapshot = followers
        .get(&from)
        .is_some_and(|p| p.next_index <= view.log.prev_index());
    if needs_snapshot {
        outcome.outbound.push(Outbound::To(
            from,
            RaftMessage::LogCompactionInfo(LogCompactionInfo {
                term: view.current_term,
                prev_index: view.log.prev_index(),
            }),
        ));
    }

    outcome.next_role = RoleState::Leader(LeaderState { followers });
    outcome
}

/// The heartbeat tick: per peer, resend an expired in-flight batch,
/// leave a fresh one alone, send a plain heartbeat to up-to-date peers,
/// and start a batch for lagging ones.
fn on_heartbeat_timeout(view: &RaftView, state: &LeaderState) -> Outcome {
    let mut followers = state.followers.clone();
    let mut outcome = Outcome::stay(RoleState::Follower); // placeholder, replaced below
    outcome.reset_heartbeat_timer = true;

    let append_index = view.log.append_index();
    let rtt_budget = view.config.shipping.rtt_budget;

    for peer in peer_ids(&followers) {
        if let Some(expired) = followers.expired_in_flight(&peer, view.now, rtt_budget) {
            resend(view, &mut followers, peer, expired, &mut outcome);
            continue;
        }
        let progress = match followers.get(&peer) {
            Some(progress) => progress.clone(),
            None => continue,
        };
        if progress.in_flight.is_some() {
            // Recent batch still in its RTT budget; do not pile on.
            continue;
        }
        if progress.next_index > append_index {
            outcome.outbound.push(Outbound::To(
                peer,
                RaftMessage::Heartbeat(Heartbeat {
                    term: view.current_term,
                    commit_index: view.commit_index,
                    commit_term: commit_term_of(view),
                }),
            ));
        } else {
            ship(view, &mut followers, peer, view.commit_index, &mut outcome);
        }
    }

    outcome.next_role = RoleState::Leader(LeaderState { followers });
    outcome
}

/// Frame and queue one AppendEntries batch for `peer` starting at its
/// `next_index`, bounded by the configured entry-count and byte
/// budgets. Falls back to LogCompactionInfo when the needed entries
/// were pruned.
fn ship(
    view: &RaftView,
    followers: &mut FollowerStates,
    peer: MemberId,
    leader_commit: LogIndex,
    outcome: &mut Outcome,
) {
    let next = match followers.get(&peer) {
        Some(progress) => progress.next_index,
        None => return,
    };
    if next <= view.log.prev_index() {
        outcome.outbound.push(Outbound::To(
            peer,
            RaftMessage::LogCompactionInfo(LogCompactionInfo {
                term: view.current_term,
                prev_index: view.log.prev_index(),
            }),
        ));
        return;
    }

    let append_index = view.log.append_index();
    if next > append_index {
        return;
    }

    let max_entries = view.config.shipping.max_batch_entries;
    let max_bytes = view.config.shipping.max_batch_bytes;
    let mut entries = Vec::new();
    let mut bytes = 0usize;
    let mut index = next;
    while index <= append_index && entries.len() < max_entries {
        let entry = match view.log.read_entry(index) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(index, error = %e, "log read failed while batching");
                return;
            }
        };
        bytes += entry.frame_size();
        entries.push(entry);
        if bytes >= max_bytes {
            break;
        }
        index += 1;
    }

    let last_index = next + entries.len() as LogIndex - 1;
    followers.set_in_flight(
        peer,
        InFlightBatch {
            prev_log_index: next - 1,
            last_index,
            sent_at: view.now,
        },
    );
    outcome.outbound.push(Outbound::To(
        peer,
        RaftMessage::AppendRequest(AppendEntriesRequest {
            term: view.current_term,
            prev_log_index: next - 1,
            prev_log_term: term_at(view, next - 1),
            leader_commit,
            entries,
        }),
    ));
}

/// Resend an expired batch from the same position, never advancing
/// `next_index` on a timeout.
fn resend(
    view: &RaftView,
    followers: &mut FollowerStates,
    peer: MemberId,
    expired: InFlightBatch,
    outcome: &mut Outcome,
) {
    let mut entries = Vec::new();
    for index in (expired.prev_log_index + 1)..=expired.last_index {
        match view.log.read_entry(index) {
            Ok(entry) => entries.push(entry),
            Err(_) => {
                // Pruned out from under a silent follower.
                outcome.outbound.push(Outbound::To(
                    peer,
                    RaftMessage::LogCompactionInfo(LogCompactionInfo {
                        term: view.current_term,
                        prev_index: view.log.prev_index(),
                    }),
                ));
                return;
            }
        }
    }

    tracing::debug!(peer = %peer, prev_log_index = expired.prev_log_index, "resending expired batch");
    followers.set_in_flight(
        peer,
        InFlightBatch {
            prev_log_index: expired.prev_log_index,
            last_index: expired.last_index,
            sent_at: view.now,
        },
    );
    outcome.outbound.push(Outbound::To(
        peer,
        RaftMessage::AppendRequest(AppendEntriesRequest {
            term: view.current_term,
            prev_log_index: expired.prev_log_index,
            prev_log_term: term_at(view, expired.prev_log_index),
            leader_commit: view.commit_index,
            entries,
        }),
    ));
}

fn peer_ids(followers: &FollowerStates) -> Vec<MemberId> {
    followers.iter().map(|(peer, _)| *peer).collect()
}

fn term_at(view: &RaftView, index: LogIndex) -> Term {
    if index == 0 {
        return 0;
    }
    view.log.read_entry_term(index).unwrap_or(0)
}

fn commit_term_of(view: &RaftView) -> Term {
    term_at(view, view.commit_index)
}

/// Term of `index` after the pending appends land: fresh entries carry
/// the current term, older ones come from the log.
fn entry_term(
    view: &RaftView,
    index: LogIndex,
    new_entries: &[LogEntry],
    first_new: LogIndex,
) -> Option<Term> {
    if index >= first_new {
        let offset = (index - first_new) as usize;
        return new_entries.get(offset).map(|entry| entry.term);
    }
    view.log.read_entry_term(index).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfig;
    use crate::log::{InMemoryRaftLog, RaftLog};
    use crate::membership::MemberSet;
    use std::time::{Duration, Instant};

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

        fn seed_log(&self, terms: &[Term]) {
            for &term in terms {
                self.log
                    .append(vec![LogEntry::new(term, Command::Payload(vec![0]))])
                    .unwrap();
            }
        }

        fn view(&self, term: Term, commit_index: LogIndex) -> RaftView<'_> {
            RaftView {
                self_id: self.self_id,
                current_term: term,
                voted_for: Some(self.self_id),
                commit_index,
                leader: Some(self.self_id),
                members: &self.members,
                pending_member_change: false,
                log: &self.log,
                config: &self.config,
                now: Instant::now(),
            }
        }

        fn leader_state(&self, append_index: LogIndex) -> LeaderState {
            LeaderState {
                followers: FollowerStates::init(&self.members, self.self_id, append_index),
            }
        }
    }

    fn leader_followers(outcome: &Outcome) -> &FollowerStates {
        match &outcome.next_role {
            RoleState::Leader(state) => &state.followers,
            other => panic!("expected leader, got {:?}", other.name()),
        }
    }

    fn sent_to<'a>(outcome: &'a Outcome, peer: &MemberId) -> Vec<&'a RaftMessage> {
        outcome
            .outbound
            .iter()
            .filter_map(|outbound| match outbound {
                Outbound::To(to, message) if to == peer => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_new_entry_appends_and_ships_to_caught_up_peers() {
        let fixture = Fixture::new(3);
        fixture.seed_log(&[1]);
        let view = fixture.view(1, 0);
        let state = fixture.leader_state(1);

        let outcome = handle(
            &view,
            &state,
            fixture.self_id,
            &RaftMessage::NewEntry(crate::consensus::message::NewEntryRequest {
                command: Command::Payload(b"x".to_vec()),
            }),
        );

        assert!(matches!(
            &outcome.log_ops[..],
            [LogOp::Append(entries)] if entries.len() == 1 && entries[0].term == 1
        ));
        // Both peers start at next_index = 2, exactly where the new
        // entry lands, so both get it immediately.
        for peer in &fixture.peers {
            let messages = sent_to(&outcome, peer);
            assert_eq!(messages.len(), 1);
            match messages[0] {
                RaftMessage::AppendRequest(request) => {
                    assert_eq!(request.prev_log_index, 1);
                    assert_eq!(request.entries.len(), 1);
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(leader_followers(&outcome)
                .get(peer)
                .unwrap()
                .in_flight
                .is_some());
        }
    }

    #[test]
    fn test_success_response_advances_commit_with_quorum() {
        let fixture = Fixture::new(3);
        fixture.seed_log(&[1, 1]);
        let view = fixture.view(1, 0);
        let state = fixture.leader_state(2);

        let outcome = handle(
            &view,
            &state,
            fixture.peers[0],
            &RaftMessage::AppendResponse(AppendEntriesResponse {
                term: 1,
                success: true,
                match_index: 2,
                append_index: 2,
            }),
        );

        // Leader (2) + one peer (2) is a majority of three.
        assert_eq!(outcome.commit_index, Some(2));
        let progress = leader_followers(&outcome).get(&fixture.peers[0]).unwrap();
        assert_eq!(progress.match_index, 2);
        assert_eq!(progress.next_index, 3);
    }

    #[test]
    fn test_prior_term_entry_does_not_commit_directly() {
        // Log has a term-1 entry; we now lead term 2 and have not yet
        // replicated a term-2 entry to a majority.
        let fixture = Fixture::new(3);
        fixture.seed_log(&[1]);
        let view = fixture.view(2, 0);
        let state = fixture.leader_state(1);

        let outcome = handle(
            &view,
            &state,
            fixture.peers[0],
            &RaftMessage::AppendResponse(AppendEntriesResponse {
                term: 2,
                success: true,
                match_index: 1,
                append_index: 1,
            }),
        );
        assert_eq!(outcome.commit_index, None);
    }

    #[test]
    fn test_failure_response_backs_off_and_retries() {
        let fixture = Fixture::new(3);
        fixture.seed_log(&[1, 1, 1, 1, 1]);
        let view = fixture.view(1, 0);
        let state = fixture.leader_state(5);

        let outcome = handle(
            &view,
            &state,
            fixture.peers[0],
            &RaftMessage::AppendResponse(AppendEntriesResponse {
                term: 1,
                success: false,
                match_index: 2,
                append_index: 2,
            }),
        );

        // Hint jumps next_index to follower_append + 1 = 3 and a fresh
        // batch goes out from there.
        let messages = sent_to(&outcome, &fixture.peers[0]);
        assert_eq!(messages.len(), 1);
        match messages[0] {
            RaftMessage::AppendRequest(request) => {
                assert_eq!(request.prev_log_index, 2);
                assert_eq!(request.entries.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(outcome.commit_index, None);
    }

    #[test]
    fn test_follower_below_pruned_prefix_gets_compaction_info() {
        let fixture = Fixture::new(3);
        fixture.seed_log(&[1, 1, 1, 1, 1, 1, 1, 1]);
        fixture.log.prune(4).unwrap();
        let view = fixture.view(1, 0);
        let state = fixture.leader_state(8);

        let outcome = handle(
            &view,
            &state,
            fixture.peers[0],
            &RaftMessage::AppendResponse(AppendEntriesResponse {
                term: 1,
                success: false,
                match_index: 2,
                append_index: 2,
            }),
        );

        let messages = sent_to(&outcome, &fixture.peers[0]);
        assert_eq!(messages.len(), 1);
        match messages[0] {
            RaftMessage::LogCompactionInfo(info) => assert_eq!(info.prev_index, 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_timeout_paces_all_peers() {
        let fixture = Fixture::new(3);
        fixture.seed_log(&[1, 1, 1]);
        let view = fixture.view(1, 1);
        let mut state = fixture.leader_state(3);
        // First peer fully caught up; second knows nothing yet.
        state
            .followers
            .on_success(fixture.peers[0], 3, view.now);
        state.followers.on_failure(fixture.peers[1], 0, 1, view.now);

        let outcome = handle(&view, &state, fixture.self_id, &RaftMessage::HeartbeatTimeout);
        assert!(outcome.reset_heartbeat_timer);

        match sent_to(&outcome, &fixture.peers[0])[0] {
            RaftMessage::Heartbeat(heartbeat) => {
                assert_eq!(heartbeat.commit_index, 1);
                assert_eq!(heartbeat.commit_term, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        match sent_to(&outcome, &fixture.peers[1])[0] {
            RaftMessage::AppendRequest(request) => {
                assert_eq!(request.prev_log_index, 0);
                assert_eq!(request.entries.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expired_in_flight_resends_same_position() {
        let fixture = Fixture::new(2);
        fixture.seed_log(&[1, 1]);
        let mut view = fixture.view(1, 0);
        let mut state = fixture.leader_state(2);
        state.followers.on_failure(fixture.peers[0], 0, 1, view.now);
        state.followers.set_in_flight(
            fixture.peers[0],
            InFlightBatch {
                prev_log_index: 0,
                last_index: 2,
                sent_at: view.now,
            },
        );

        // Within the RTT budget nothing is resent.
        let outcome = handle(&view, &state, fixture.self_id, &RaftMessage::HeartbeatTimeout);
        assert!(sent_to(&outcome, &fixture.peers[0]).is_empty());

        // Past the budget the identical range goes out again.
        view.now += fixture.config.shipping.rtt_budget + Duration::from_millis(1);
        let outcome = handle(&view, &state, fixture.self_id, &RaftMessage::HeartbeatTimeout);
        match sent_to(&outcome, &fixture.peers[0])[0] {
            RaftMessage::AppendRequest(request) => {
                assert_eq!(request.prev_log_index, 0);
                assert_eq!(request.entries.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_member_set_refused_while_change_pending() {
        let fixture = Fixture::new(3);
        fixture.seed_log(&[1]);
        let mut view = fixture.view(1, 0);
        view.pending_member_change = true;
        let state = fixture.leader_state(1);

        let grown = fixture.members.with_member(MemberId::random());
        let outcome = handle(
            &view,
            &state,
            fixture.self_id,
            &RaftMessage::NewEntry(crate::consensus::message::NewEntryRequest {
                command: Command::MemberSet(grown),
            }),
        );
        assert!(outcome.log_ops.is_empty());
    }

    #[test]
    fn test_batch_respects_entry_budget() {
        let fixture = Fixture::new(2);
        fixture.seed_log(&[1; 10]);
        let mut config = RaftConfig::new(fixture.self_id, "/tmp/unused");
        config.shipping.max_batch_entries = 4;
        let mut view = fixture.view(1, 0);
        view.config = &config;
        let mut state = fixture.leader_state(10);
        state.followers.on_failure(fixture.peers[0], 0, 1, view.now);

        let outcome = handle(&view, &state, fixture.self_id, &RaftMessage::HeartbeatTimeout);
        match sent_to(&outcome, &fixture.peers[0])[0] {
            RaftMessage::AppendRequest(request) => {
                assert_eq!(request.entries.len(), 4);
                assert_eq!(request.prev_log_index, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
