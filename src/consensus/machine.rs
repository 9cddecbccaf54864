// Raft Driver Machine
//
// One cooperative loop owns the whole consensus state: it pulls
// inbound messages and timer expirations off a single queue, runs the
// pure role logic, and commits the resulting Outcome. Within one
// Outcome, term/vote/log persistence completes before any outbound
// message derived from it is emitted; that ordering underpins leader
// completeness and is not negotiable.
//
// A durability failure during a critical step moves the node to the
// inert Stopped role and raises the unrecoverable health signal.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant as TokioInstant;

use crate::common::{ClusterId, LogIndex, MemberId, Term};
use crate::config::RaftConfig;
use crate::consensus::message::{Envelope, NewEntryRequest, RaftMessage};
use crate::consensus::outcome::{LogOp, Outbound, Outcome};
use crate::consensus::roles::{self, RaftView, Role, RoleState};
use crate::error::{RaftError, Result};
use crate::events::{EventBus, RaftEvent};
use crate::log::entry::Command;
use crate::log::RaftLog;
use crate::membership::{MemberSet, MembershipTracker};
use crate::metrics::Metrics;
use crate::state::{MemberSetStore, TermStore, VoteStore};

/// Node liveness as observed by the host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    /// Unrecoverable durability failure; the node is inert.
    Failed(String),
}

/// Snapshot of the externally visible consensus state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Status {
    pub role: Role,
    pub term: Term,
    pub leader: Option<MemberId>,
    pub commit_index: LogIndex,
}

/// A pending submission; resolves once the entry commits.
pub struct Ticket {
    index: LogIndex,
    rx: oneshot::Receiver<Result<LogIndex>>,
}

impl Ticket {
    /// The log index the command was appended at.
    pub fn index(&self) -> LogIndex {
        self.index
    }

    /// Wait until the entry is committed; yields its index.
    pub async fn committed(self) -> Result<LogIndex> {
        self.rx
            .await
            .map_err(|_| RaftError::ClusterUnavailable("consensus core shut down".to_string()))?
    }
}

/// A proposed single-step membership change.
#[derive(Debug, Clone, Copy)]
pub enum MemberChange {
    Add(MemberId),
    Remove(MemberId),
}

enum Input {
    Deliver(Envelope),
    Submit {
        command: Command,
        reply: oneshot::Sender<Result<Ticket>>,
    },
    ProposeMember {
        change: MemberChange,
        reply: oneshot::Sender<Result<Ticket>>,
    },
}

/// Per-peer outbound queues, single-producer (driver), drained by the
/// egress side. When a queue is full the oldest message is dropped;
/// everything the protocol sends is retryable.
pub struct Outbox {
    queues: Mutex<HashMap<MemberId, VecDeque<Envelope>>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, peer: MemberId, envelope: Envelope) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(peer).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(envelope);
        drop(queues);
        self.notify.notify_waiters();
    }

    /// Take everything queued for `peer`, in order.
    pub fn drain(&self, peer: &MemberId) -> Vec<Envelope> {
        let mut queues = self.queues.lock();
        queues
            .get_mut(peer)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Take everything queued for every peer.
    pub fn drain_all(&self) -> Vec<(MemberId, Envelope)> {
        let mut queues = self.queues.lock();
        let mut out = Vec::new();
        for (peer, queue) in queues.iter_mut() {
            out.extend(queue.drain(..).map(|envelope| (*peer, envelope)));
        }
        out
    }

    /// Wait until something new is queued.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable façade over the driver loop.
#[derive(Clone)]
pub struct RaftHandle {
    self_id: MemberId,
    cluster_id: ClusterId,
    max_command_size: usize,
    inbox: mpsc::Sender<Input>,
    status: Arc<RwLock<Status>>,
    outbox: Arc<Outbox>,
    events: Arc<EventBus>,
    commit_watch: watch::Receiver<LogIndex>,
    health: watch::Receiver<NodeHealth>,
}

impl RaftHandle {
    /// Submit an application command for replication. Leader-only;
    /// elsewhere this returns `NotLeader` with the best leader hint.
    pub async fn submit(&self, payload: Vec<u8>) -> Result<Ticket> {
        if payload.len() > self.max_command_size {
            return Err(RaftError::CommandTooLarge {
                size: payload.len(),
                max: self.max_command_size,
            });
        }
        self.request(|reply| Input::Submit {
            command: Command::Payload(payload),
            reply,
        })
        .await
    }

    /// Convenience: submit and wait for the commit in one call.
    pub async fn await_commit(&self, ticket: Ticket) -> Result<LogIndex> {
        ticket.committed().await
    }

    /// Propose adding or removing a single member.
    pub async fn propose_member_change(&self, change: MemberChange) -> Result<Ticket> {
        self.request(|reply| Input::ProposeMember { change, reply })
            .await
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<Ticket>>) -> Input,
    ) -> Result<Ticket> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(build(tx))
            .await
            .map_err(|_| RaftError::ClusterUnavailable("consensus core shut down".to_string()))?;
        rx.await
            .map_err(|_| RaftError::ClusterUnavailable("consensus core shut down".to_string()))?
    }

    /// Hand an inbound network message to the driver loop.
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.inbox
            .send(Input::Deliver(envelope))
            .await
            .map_err(|_| RaftError::ClusterUnavailable("consensus core shut down".to_string()))
    }

    pub fn member_id(&self) -> MemberId {
        self.self_id
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn current_role(&self) -> Role {
        self.status.read().role
    }

    pub fn current_term(&self) -> Term {
        self.status.read().term
    }

    pub fn current_leader(&self) -> Option<MemberId> {
        self.status.read().leader
    }

    pub fn commit_index(&self) -> LogIndex {
        self.status.read().commit_index
    }

    pub fn subscribe_events(&self) -> mpsc::Receiver<RaftEvent> {
        self.events.subscribe()
    }

    /// Monotonic commit watermark, consumed by the commit applier.
    pub fn commit_watch(&self) -> watch::Receiver<LogIndex> {
        self.commit_watch.clone()
    }

    pub fn health(&self) -> watch::Receiver<NodeHealth> {
        self.health.clone()
    }

    pub fn outbox(&self) -> Arc<Outbox> {
        self.outbox.clone()
    }
}

/// The consensus driver. Owns the log and the durable state stores
/// exclusively; everything else reaches it through the handle.
pub struct RaftMachine {
    config: RaftConfig,
    cluster_id: ClusterId,
    log: Arc<dyn RaftLog>,
    term_store: TermStore,
    vote_store: VoteStore,
    member_set_store: MemberSetStore,

    current_term: Term,
    voted_for: Option<MemberId>,
    commit_index: LogIndex,
    leader: Option<MemberId>,
    role: RoleState,
    membership: MembershipTracker,

    inbox: mpsc::Receiver<Input>,
    outbox: Arc<Outbox>,
    events: Arc<EventBus>,
    metrics: Arc<dyn Metrics>,
    status: Arc<RwLock<Status>>,
    commit_watch: watch::Sender<LogIndex>,
    health: watch::Sender<NodeHealth>,

    tickets: BTreeMap<LogIndex, Vec<oneshot::Sender<Result<LogIndex>>>>,
    election_deadline: TokioInstant,
    heartbeat_deadline: TokioInstant,
    mismatched_cluster_messages: u64,
}

impl RaftMachine {
    /// Recover a member from its durable state.
    ///
    /// `last_applied` is the application's checkpoint; entries at or
    /// below it were committed, so the commit index restarts there and
    /// re-advances from leader traffic.
    pub fn recover(
        config: RaftConfig,
        cluster_id: ClusterId,
        bootstrap_members: MemberSet,
        log: Arc<dyn RaftLog>,
        last_applied: LogIndex,
        metrics: Arc<dyn Metrics>,
    ) -> Result<(Self, RaftHandle)> {
        let state_dir = config.data_dir.join("raft-state");
        let term_store = TermStore::new(&state_dir);
        let vote_store = VoteStore::new(&state_dir);
        let member_set_store = MemberSetStore::new(&state_dir);

        let stored_term = term_store.load()?;
        let (vote_term, vote) = vote_store.load()?;
        let current_term = stored_term.max(vote_term);
        let voted_for = if vote_term == current_term { vote } else { None };

        let mut membership = MembershipTracker::new(bootstrap_members);
        if let Some((index, set)) = member_set_store.load()? {
            if index <= log.append_index() {
                membership.restore_active(index, set);
            }
        }
        let commit_index = last_applied;
        Self::replay_membership(&mut membership, log.as_ref(), commit_index)?;

        tracing::info!(
            member = %config.member_id,
            term = current_term,
            commit_index,
            append_index = log.append_index(),
            members = %membership.active(),
            "recovered consensus state"
        );

        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);
        let outbox = Arc::new(Outbox::new(config.outbound_queue_capacity));
        let events = Arc::new(EventBus::new(config.event_queue_capacity));
        let status = Arc::new(RwLock::new(Status {
            role: Role::Follower,
            term: current_term,
            leader: None,
            commit_index,
        }));
        let (commit_watch, commit_rx) = watch::channel(commit_index);
        let (health_tx, health_rx) = watch::channel(NodeHealth::Healthy);

        let now = TokioInstant::now();
        let election_jitter = random_election_timeout(&config);
        let machine = Self {
            cluster_id,
            log,
            term_store,
            vote_store,
            member_set_store,
            current_term,
            voted_for,
            commit_index,
            leader: None,
            role: RoleState::Follower,
            membership,
            inbox: inbox_rx,
            outbox: outbox.clone(),
            events: events.clone(),
            metrics,
            status: status.clone(),
            commit_watch,
            health: health_tx,
            tickets: BTreeMap::new(),
            election_deadline: now + election_jitter,
            heartbeat_deadline: now + config.timers.heartbeat_interval,
            mismatched_cluster_messages: 0,
            config,
        };
        let handle = RaftHandle {
            self_id: machine.config.member_id,
            cluster_id,
            max_command_size: machine.config.max_command_size,
            inbox: inbox_tx,
            status,
            outbox,
            events,
            commit_watch: commit_rx,
            health: health_rx,
        };
        Ok((machine, handle))
    }

    /// The currently active member set.
    pub fn active_members(&self) -> &MemberSet {
        self.membership.active()
    }

    /// Rebuild active/pending member sets from the retained log suffix.
    fn replay_membership(
        membership: &mut MembershipTracker,
        log: &dyn RaftLog,
        commit_index: LogIndex,
    ) -> Result<()> {
        let start = membership.active_index().max(log.prev_index()) + 1;
        for index in start..=log.append_index() {
            let entry = log.read_entry(index)?;
            if let Command::MemberSet(set) = entry.command {
                if index <= commit_index {
                    membership.restore_active(index, set);
                } else {
                    membership.on_append(index, set);
                }
            }
        }
        Ok(())
    }

    /// Run the driver loop until the node stops or every handle drops.
    pub async fn run(mut self) {
        loop {
            if matches!(self.role, RoleState::Stopped) {
                tracing::error!("consensus driver stopped, refusing further work");
                return;
            }
            let deadline = match self.role {
                RoleState::Leader(_) => self.heartbeat_deadline,
                _ => self.election_deadline,
            };
            tokio::select! {
                input = self.inbox.recv() => match input {
                    Some(input) => self.process(input),
                    None => {
                        tracing::info!("all handles dropped, consensus driver exiting");
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => self.on_timer(),
            }
        }
    }

    /// Spawn the driver loop on the runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn process(&mut self, input: Input) {
        match input {
            Input::Deliver(envelope) => {
                if envelope.cluster_id != self.cluster_id {
                    self.mismatched_cluster_messages += 1;
                    self.metrics.message_dropped("cluster-id-mismatch");
                    if self.mismatched_cluster_messages.is_power_of_two() {
                        tracing::warn!(
                            from = %envelope.from,
                            foreign = %envelope.cluster_id,
                            total = self.mismatched_cluster_messages,
                            "dropping message from foreign cluster"
                        );
                    }
                    return;
                }
                self.dispatch(envelope.from, &envelope.message);
            }
            Input::Submit { command, reply } => {
                let result = self.submit_local(command);
                let _ = reply.send(result);
            }
            Input::ProposeMember { change, reply } => {
                let result = self.propose_member(change);
                let _ = reply.send(result);
            }
        }
    }

    fn submit_local(&mut self, command: Command) -> Result<Ticket> {
        if matches!(self.role, RoleState::Stopped) {
            return Err(RaftError::Stopped("consensus driver stopped".to_string()));
        }
        if !self.role.is_leader() {
            return Err(RaftError::NotLeader { hint: self.leader });
        }
        if let Command::MemberSet(set) = &command {
            self.membership.validate_proposal(set)?;
        }

        let before = self.log.append_index();
        self.dispatch(
            self.config.member_id,
            &RaftMessage::NewEntry(NewEntryRequest { command }),
        );
        let after = self.log.append_index();
        if after <= before {
            return Err(RaftError::InvalidOperation(
                "command was not accepted".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        self.tickets.entry(after).or_default().push(tx);
        // A single-member cluster may have committed synchronously.
        self.resolve_tickets();
        Ok(Ticket { index: after, rx })
    }

    fn propose_member(&mut self, change: MemberChange) -> Result<Ticket> {
        let proposed = match change {
            MemberChange::Add(member) => self.membership.active().with_member(member),
            MemberChange::Remove(member) => self.membership.active().without_member(&member),
        };
        self.submit_local(Command::MemberSet(proposed))
    }

    fn dispatch(&mut self, from: MemberId, message: &RaftMessage) {
        let view = RaftView {
            self_id: self.config.member_id,
            current_term: self.current_term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
            leader: self.leader,
            members: self.membership.active(),
            pending_member_change: self.membership.has_pending_change(),
            log: self.log.as_ref(),
            config: &self.config,
            now: std::time::Instant::now(),
        };
        let outcome = roles::handle(&view, &self.role, from, message);
        self.commit_outcome(outcome);
    }

    /// Apply one Outcome: durable writes first, volatile state second,
    /// outbound emission last.
    fn commit_outcome(&mut self, outcome: Outcome) {
        // Persist term and vote. The vote record is rewritten together
        // with every term change so the pair stays consistent.
        if let Some(term) = outcome.new_term {
            let vote = outcome.new_vote.clone().flatten();
            if let Err(e) = self
                .term_store
                .put(term)
                .and_then(|_| self.vote_store.put(term, vote))
            {
                return self.stop(e);
            }
        } else if let Some(vote) = outcome.new_vote.clone() {
            if let Err(e) = self.vote_store.put(self.current_term, vote) {
                return self.stop(e);
            }
        }

        // Log mutations, in order. Append and truncate failures are
        // unrecoverable mid-protocol; a failed prune just waits for the
        // next request.
        for op in &outcome.log_ops {
            match op {
                LogOp::Append(entries) => {
                    let first_index = self.log.append_index() + 1;
                    if let Err(e) = self.log.append(entries.clone()) {
                        return self.stop(e);
                    }
                    self.metrics.entries_appended(entries.len());
                    for (offset, entry) in entries.iter().enumerate() {
                        if let Command::MemberSet(set) = &entry.command {
                            self.membership
                                .on_append(first_index + offset as LogIndex, set.clone());
                        }
                    }
                }
                LogOp::Truncate(from) => {
                    if let Err(e) = self.log.truncate(*from) {
                        return self.stop(e);
                    }
                    self.membership.on_truncate(*from);
                    self.fail_tickets_from(*from);
                }
                LogOp::Prune(up_to) => match self.log.prune(*up_to) {
                    Ok(prev_index) => self.metrics.log_pruned(prev_index),
                    Err(e) => tracing::warn!(error = %e, "prune failed, will retry later"),
                },
            }
        }

        // Volatile state.
        if let Some(term) = outcome.new_term {
            self.current_term = term;
            self.voted_for = outcome.new_vote.clone().flatten();
            self.events.publish(RaftEvent::TermChanged { term });
        } else if let Some(vote) = outcome.new_vote {
            self.voted_for = vote;
        }

        let was_leader = self.role.is_leader();
        self.role = outcome.next_role;

        if let Some(leader) = outcome.new_leader {
            if leader != self.leader {
                self.leader = leader;
                self.events.publish(RaftEvent::LeaderChanged {
                    term: self.current_term,
                    leader,
                });
            }
        }

        if let Some(commit) = outcome.commit_index {
            if commit > self.commit_index {
                self.commit_index = commit;
                self.metrics.commit_advanced(commit);
                self.on_member_set_committed();
                let _ = self.commit_watch.send_replace(commit);
                self.events.publish(RaftEvent::CommitAdvanced { index: commit });
                self.resolve_tickets();
            }
        }

        if outcome.election_started {
            self.metrics.election_started(self.current_term);
        }
        if outcome.election_won {
            self.metrics.election_won(self.current_term);
        }
        if outcome.stepped_down {
            self.metrics.stepped_down(self.current_term);
        }
        if was_leader && !self.role.is_leader() {
            let hint = self.leader;
            self.fail_all_tickets(|| RaftError::NotLeader { hint });
        }

        *self.status.write() = Status {
            role: Role::from(&self.role),
            term: self.current_term,
            leader: self.leader,
            commit_index: self.commit_index,
        };

        let now = TokioInstant::now();
        if outcome.reset_election_timer {
            self.election_deadline = now + random_election_timeout(&self.config);
        }
        if outcome.reset_heartbeat_timer {
            self.heartbeat_deadline = now + self.config.timers.heartbeat_interval;
        }

        // Everything above is durable; only now may the network see
        // messages derived from it.
        for outbound in outcome.outbound {
            match outbound {
                Outbound::To(peer, message) => self.send_to(peer, message),
                Outbound::Broadcast(message) => {
                    let peers: Vec<MemberId> = self
                        .membership
                        .active()
                        .iter()
                        .filter(|member| **member != self.config.member_id)
                        .copied()
                        .collect();
                    for peer in peers {
                        self.send_to(peer, message.clone());
                    }
                }
            }
        }
    }

    /// A newly committed member set reshapes the leader's follower
    /// tracking and is cached for the next startup.
    fn on_member_set_committed(&mut self) {
        let Some(set) = self.membership.on_commit(self.commit_index) else {
            return;
        };
        tracing::info!(members = %set, "member set committed");
        if let Err(e) = self
            .member_set_store
            .put(self.membership.active_index(), &set)
        {
            tracing::warn!(error = %e, "failed to cache member set, will rebuild from log");
        }
        if let RoleState::Leader(state) = &mut self.role {
            state.followers.retain_members(&set);
            let append_index = self.log.append_index();
            for member in set.iter() {
                if *member != self.config.member_id {
                    state.followers.ensure_peer(*member, append_index);
                }
            }
        }
        self.events.publish(RaftEvent::MemberSetChanged { members: set });
    }

    fn on_timer(&mut self) {
        let now = TokioInstant::now();
        if self.role.is_leader() {
            // Pre-arm so a dropped outcome cannot spin the loop.
            self.heartbeat_deadline = now + self.config.timers.heartbeat_interval;
            self.dispatch(self.config.member_id, &RaftMessage::HeartbeatTimeout);
        } else {
            self.election_deadline = now + random_election_timeout(&self.config);
            self.dispatch(self.config.member_id, &RaftMessage::ElectionTimeout);
        }
    }

    fn send_to(&self, peer: MemberId, message: RaftMessage) {
        self.outbox.push(
            peer,
            Envelope::new(self.cluster_id, self.config.member_id, message),
        );
    }

    fn resolve_tickets(&mut self) {
        let pending = self.tickets.split_off(&(self.commit_index + 1));
        let committed = std::mem::replace(&mut self.tickets, pending);
        for (index, senders) in committed {
            for tx in senders {
                let _ = tx.send(Ok(index));
            }
        }
    }

    fn fail_tickets_from(&mut self, from: LogIndex) {
        let truncated = self.tickets.split_off(&from);
        for (_, senders) in truncated {
            for tx in senders {
                let _ = tx.send(Err(RaftError::NotLeader { hint: self.leader }));
            }
        }
    }

    fn fail_all_tickets(&mut self, error: impl Fn() -> RaftError) {
        for (_, senders) in std::mem::take(&mut self.tickets) {
            for tx in senders {
                let _ = tx.send(Err(error()));
            }
        }
    }

    /// Unrecoverable durability failure: go inert and raise the health
    /// signal. Peers observe this node as silent.
    fn stop(&mut self, error: RaftError) {
        tracing::error!(error = %error, "durability failure, stopping consensus driver");
        self.role = RoleState::Stopped;
        self.fail_all_tickets(|| RaftError::Stopped("consensus driver stopped".to_string()));
        *self.status.write() = Status {
            role: Role::Stopped,
            term: self.current_term,
            leader: None,
            commit_index: self.commit_index,
        };
        let _ = self.health.send_replace(NodeHealth::Failed(error.to_string()));
    }
}

/// Uniform draw from `[base, 2 * base)`.
fn random_election_timeout(config: &RaftConfig) -> Duration {
    let base = config.timers.election_timeout_base.as_millis() as u64;
    let millis = rand::rng().random_range(base..base * 2);
    Duration::from_millis(millis)
}
