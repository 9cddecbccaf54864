// RustyRaft - Raft consensus engine for distributed graph database clustering
//
// The core that lets a small group of members agree on an ordered
// sequence of opaque replicated commands despite process and network
// failures: durable segmented log, term/vote stores, pure role
// transition logic driven by a single cooperative loop, log-embedded
// membership, cluster identity binding, and a commit applier feeding
// the application.

pub mod applier;
pub mod binding;
pub mod common;
pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod state;

pub use applier::{Application, CommitApplier};
pub use binding::{ClusterBinding, Discovery};
pub use common::{ClusterId, LogIndex, MemberId, Term};
pub use config::RaftConfig;
pub use consensus::machine::{
    MemberChange, NodeHealth, Outbox, RaftHandle, RaftMachine, Status, Ticket,
};
pub use consensus::message::{Envelope, RaftMessage};
pub use consensus::roles::Role;
pub use error::{RaftError, Result};
pub use events::{EventBus, RaftEvent};
pub use log::{Command, LogEntry, PruneStrategy, RaftLog, SegmentedRaftLog};
pub use membership::MemberSet;
pub use metrics::{Metrics, NullMetrics};
