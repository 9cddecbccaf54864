use std::time::Duration;
use thiserror::Error;

use crate::common::{ClusterId, LogIndex, MemberId};

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log IO error: {0}")]
    LogIo(String),

    #[error("log index {index} out of range ({low}, {high}]")]
    OutOfRange {
        index: LogIndex,
        low: LogIndex,
        high: LogIndex,
    },

    #[error("corrupt record: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not the leader")]
    NotLeader { hint: Option<MemberId> },

    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(String),

    #[error("command too large: {size} bytes (max {max})")]
    CommandTooLarge { size: usize, max: usize },

    #[error("cluster binding timed out after {0:?}")]
    BindingTimeout(Duration),

    #[error("cluster id mismatch: persisted {persisted}, discovery {observed}")]
    BindingMismatch {
        persisted: ClusterId,
        observed: ClusterId,
    },

    #[error("membership error: {0}")]
    Membership(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("node stopped: {0}")]
    Stopped(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
