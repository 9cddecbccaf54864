// Simulated Cluster Harness
//
// Drives the pure role logic of several members deterministically:
// every message sits in an explicit queue, timeouts fire only when a
// test says so, and partitions drop messages at delivery time. State
// application mirrors the driver machine without touching disk.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use rusty_raft::common::{LogIndex, MemberId, Term};
use rusty_raft::config::RaftConfig;
use rusty_raft::consensus::message::{NewEntryRequest, RaftMessage};
use rusty_raft::consensus::outcome::{LogOp, Outbound, Outcome};
use rusty_raft::consensus::roles::{self, RaftView, RoleState};
use rusty_raft::log::{Command, InMemoryRaftLog, LogEntry, LogReader, RaftLog};
use rusty_raft::membership::{MemberSet, MembershipTracker};

/// Route consensus tracing into test output, once per binary.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
    });
}

/// One simulated member, applying Outcomes the way the driver does.
pub struct SimNode {
    pub id: MemberId,
    pub config: RaftConfig,
    pub log: InMemoryRaftLog,
    pub term: Term,
    pub voted_for: Option<MemberId>,
    pub commit_index: LogIndex,
    pub leader: Option<MemberId>,
    pub role: RoleState,
    pub tracker: MembershipTracker,
    pub crashed: bool,
}

impl SimNode {
    pub fn new(id: MemberId, members: MemberSet) -> Self {
        let mut config = RaftConfig::new(id, "/tmp/sim-unused");
        // Simulated time never advances, so an in-flight batch is
        // always resendable on the next tick.
        config.shipping.rtt_budget = Duration::ZERO;
        config.prune.safety_margin = 0;
        Self {
            id,
            config,
            log: InMemoryRaftLog::new(),
            term: 0,
            voted_for: None,
            commit_index: 0,
            leader: None,
            role: RoleState::Follower,
            tracker: MembershipTracker::new(members),
            crashed: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn members(&self) -> &MemberSet {
        self.tracker.active()
    }

    pub fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        self.log.read_entry(index).ok()
    }

    pub fn entry_term(&self, index: LogIndex) -> Option<Term> {
        self.log.read_entry_term(index).ok()
    }

    pub fn append_index(&self) -> LogIndex {
        self.log.append_index()
    }

    /// Process one message, returning the resulting outbound traffic.
    pub fn handle(&mut self, from: MemberId, message: &RaftMessage) -> Vec<(MemberId, RaftMessage)> {
        if self.crashed {
            return Vec::new();
        }
        let view = RaftView {
            self_id: self.id,
            current_term: self.term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
            leader: self.leader,
            members: self.tracker.active(),
            pending_member_change: self.tracker.has_pending_change(),
            log: &self.log,
            config: &self.config,
            now: Instant::now(),
        };
        let outcome = roles::handle(&view, &self.role, from, message);
        self.apply(outcome)
    }

    fn apply(&mut self, outcome: Outcome) -> Vec<(MemberId, RaftMessage)> {
        if let Some(term) = outcome.new_term {
            self.term = term;
            self.voted_for = outcome.new_vote.clone().flatten();
        } else if let Some(vote) = outcome.new_vote.clone() {
            self.voted_for = vote;
        }

        for op in &outcome.log_ops {
            match op {
                LogOp::Append(entries) => {
                    let first = self.log.append_index() + 1;
                    self.log.append(entries.clone()).unwrap();
                    for (offset, entry) in entries.iter().enumerate() {
                        if let Command::MemberSet(set) = &entry.command {
                            self.tracker.on_append(first + offset as LogIndex, set.clone());
                        }
                    }
                }
                LogOp::Truncate(from) => {
                    self.log.truncate(*from).unwrap();
                    self.tracker.on_truncate(*from);
                }
                LogOp::Prune(up_to) => {
                    self.log.prune(*up_to).unwrap();
                }
            }
        }

        self.role = outcome.next_role;
        if let Some(leader) = outcome.new_leader {
            self.leader = leader;
        }
        if let Some(commit) = outcome.commit_index {
            assert!(
                commit >= self.commit_index,
                "commit index regressed on {}",
                self.id
            );
            self.commit_index = commit;
            if let Some(active) = self.tracker.on_commit(commit) {
                if let RoleState::Leader(state) = &mut self.role {
                    state.followers.retain_members(&active);
                    let append_index = self.log.append_index();
                    for member in active.iter() {
                        if *member != self.id {
                            state.followers.ensure_peer(*member, append_index);
                        }
                    }
                }
            }
        }

        let mut outputs = Vec::new();
        for outbound in outcome.outbound {
            match outbound {
                Outbound::To(peer, message) => outputs.push((peer, message)),
                Outbound::Broadcast(message) => {
                    for member in self.tracker.active().iter() {
                        if *member != self.id {
                            outputs.push((*member, message.clone()));
                        }
                    }
                }
            }
        }
        outputs
    }
}

/// The message fabric between simulated members.
pub struct SimCluster {
    pub nodes: BTreeMap<MemberId, SimNode>,
    ids: Vec<MemberId>,
    queue: VecDeque<(MemberId, MemberId, RaftMessage)>,
    blocked: HashSet<(MemberId, MemberId)>,
    /// (member, term) -> granted vote, for the uniqueness invariant.
    votes_seen: BTreeMap<(MemberId, Term), MemberId>,
    /// term -> member that won it, for the election-safety invariant.
    leaders_seen: BTreeMap<Term, MemberId>,
}

impl SimCluster {
    pub fn new(n: usize) -> Self {
        init_tracing();
        let mut ids: Vec<MemberId> = (0..n).map(|_| MemberId::random()).collect();
        ids.sort();
        let members = MemberSet::new(ids.iter().copied());
        let nodes = ids
            .iter()
            .map(|id| (*id, SimNode::new(*id, members.clone())))
            .collect();
        Self {
            nodes,
            ids,
            queue: VecDeque::new(),
            blocked: HashSet::new(),
            votes_seen: BTreeMap::new(),
            leaders_seen: BTreeMap::new(),
        }
    }

    pub fn ids(&self) -> &[MemberId] {
        &self.ids
    }

    /// Create a joining member that bootstraps with the grown set it
    /// is being added under. Existing members only learn of it through
    /// a committed member-set entry.
    pub fn add_node(&mut self) -> MemberId {
        let id = MemberId::random();
        let mut members: Vec<MemberId> = self.nodes.keys().copied().collect();
        members.push(id);
        let node = SimNode::new(id, MemberSet::new(members));
        self.nodes.insert(id, node);
        self.ids.push(id);
        id
    }

    pub fn node(&self, id: MemberId) -> &SimNode {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: MemberId) -> &mut SimNode {
        self.nodes.get_mut(&id).unwrap()
    }

    pub fn leader(&self) -> Option<MemberId> {
        self.nodes
            .values()
            .find(|node| node.is_leader() && !node.crashed)
            .map(|node| node.id)
    }

    /// Sever both directions between the two groups.
    pub fn partition(&mut self, left: &[MemberId], right: &[MemberId]) {
        for a in left {
            for b in right {
                self.blocked.insert((*a, *b));
                self.blocked.insert((*b, *a));
            }
        }
    }

    pub fn heal(&mut self) {
        self.blocked.clear();
    }

    pub fn crash(&mut self, id: MemberId) {
        self.node_mut(id).crashed = true;
    }

    pub fn fire_election_timeout(&mut self, id: MemberId) {
        self.inject(id, id, RaftMessage::ElectionTimeout);
    }

    pub fn fire_heartbeat_timeout(&mut self, id: MemberId) {
        self.inject(id, id, RaftMessage::HeartbeatTimeout);
    }

    /// Submit a client payload at `id` (only a leader accepts it).
    pub fn submit(&mut self, id: MemberId, payload: &[u8]) {
        self.inject(
            id,
            id,
            RaftMessage::NewEntry(NewEntryRequest {
                command: Command::Payload(payload.to_vec()),
            }),
        );
    }

    pub fn submit_command(&mut self, id: MemberId, command: Command) {
        self.inject(id, id, RaftMessage::NewEntry(NewEntryRequest { command }));
    }

    /// Hand a message straight to a node, queueing what it emits.
    pub fn inject(&mut self, to: MemberId, from: MemberId, message: RaftMessage) {
        let outputs = self.node_mut(to).handle(from, &message);
        self.check_node_invariants(to);
        for (peer, message) in outputs {
            self.queue.push_back((to, peer, message));
        }
    }

    /// Deliver the oldest queued message; false when the queue is dry.
    pub fn deliver_next(&mut self) -> bool {
        let Some((from, to, message)) = self.queue.pop_front() else {
            return false;
        };
        if self.blocked.contains(&(from, to)) {
            return true;
        }
        if self.nodes[&to].crashed {
            return true;
        }
        let outputs = self.node_mut(to).handle(from, &message);
        self.check_node_invariants(to);
        for (peer, message) in outputs {
            self.queue.push_back((to, peer, message));
        }
        true
    }

    /// Deliver until no traffic remains (bounded against livelock).
    pub fn settle(&mut self) {
        let mut budget = 100_000;
        while self.deliver_next() {
            budget -= 1;
            assert!(budget > 0, "message storm did not settle");
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drop everything currently queued.
    pub fn drop_in_flight(&mut self) {
        self.queue.clear();
    }

    fn check_node_invariants(&mut self, id: MemberId) {
        let node = &self.nodes[&id];

        // Vote uniqueness: a persisted vote never flips within a term.
        if let Some(vote) = node.voted_for {
            let prior = self.votes_seen.insert((id, node.term), vote);
            if let Some(prior) = prior {
                assert_eq!(
                    prior, vote,
                    "{} changed its vote within term {}",
                    id, node.term
                );
            }
        }

        // Election safety: at most one leader per term.
        if node.is_leader() {
            let prior = self.leaders_seen.insert(node.term, id);
            if let Some(prior) = prior {
                assert_eq!(prior, id, "two leaders observed in term {}", node.term);
            }
        }
    }

    /// Log matching: any shared `(index, term)` implies identical
    /// prefixes up to that index.
    pub fn assert_log_matching(&self) {
        let nodes: Vec<&SimNode> = self.nodes.values().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i + 1) {
                let shared = a.append_index().min(b.append_index());
                let mut anchor = None;
                for index in (1..=shared).rev() {
                    match (a.entry_term(index), b.entry_term(index)) {
                        (Some(ta), Some(tb)) if ta == tb => {
                            anchor = Some(index);
                            break;
                        }
                        _ => {}
                    }
                }
                if let Some(anchor) = anchor {
                    for index in 1..=anchor {
                        match (a.entry(index), b.entry(index)) {
                            (Some(ea), Some(eb)) => assert_eq!(
                                ea, eb,
                                "logs of {} and {} diverge at {} below matching ({}, {})",
                                a.id, b.id, index, anchor, ea.term
                            ),
                            // Pruned prefixes are committed, hence equal.
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    /// State machine safety: committed prefixes never disagree.
    pub fn assert_committed_prefixes_agree(&self) {
        let nodes: Vec<&SimNode> = self.nodes.values().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i + 1) {
                let shared_commit = a.commit_index.min(b.commit_index);
                for index in 1..=shared_commit {
                    if let (Some(ea), Some(eb)) = (a.entry(index), b.entry(index)) {
                        assert_eq!(
                            ea, eb,
                            "committed entry {} differs between {} and {}",
                            index, a.id, b.id
                        );
                    }
                }
            }
        }
    }
}
