// Consensus Engine Configuration
//
// All tunables for the Raft core: election and heartbeat timers,
// replication batching, segment rotation, pruning policy, and the
// cluster-id binding handshake.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::common::MemberId;
use crate::log::pruning::PruneStrategy;

/// Top-level configuration for one consensus core member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// This member's stable identifier.
    pub member_id: MemberId,

    /// Directory holding `raft-log/` and `raft-state/`.
    pub data_dir: PathBuf,

    /// Election and heartbeat timers.
    pub timers: TimerConfig,

    /// Replication pacing towards followers.
    pub shipping: ShippingConfig,

    /// Durable log layout.
    pub log: LogConfig,

    /// Log pruning policy.
    pub prune: PruneConfig,

    /// Cluster-id binding handshake.
    pub binding: BindingConfig,

    /// Largest accepted command payload in bytes.
    pub max_command_size: usize,

    /// Capacity of each per-peer outbound queue. When full, the oldest
    /// retryable message is dropped rather than blocking the driver.
    pub outbound_queue_capacity: usize,

    /// Capacity of each event subscriber queue (drop-on-overflow).
    pub event_queue_capacity: usize,

    /// Capacity of the driver's inbound message queue.
    pub inbox_capacity: usize,
}

impl RaftConfig {
    pub fn new(member_id: MemberId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            member_id,
            data_dir: data_dir.into(),
            timers: TimerConfig::default(),
            shipping: ShippingConfig::default(),
            log: LogConfig::default(),
            prune: PruneConfig::default(),
            binding: BindingConfig::default(),
            max_command_size: 8 * 1024 * 1024,
            outbound_queue_capacity: 1024,
            event_queue_capacity: 256,
            inbox_capacity: 4096,
        }
    }
}

/// Timer configuration.
///
/// The election timeout is drawn uniformly from `[base, 2 * base)` and
/// re-randomized on every reset. The heartbeat interval must be much
/// smaller than the election base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    pub election_timeout_base: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            election_timeout_base: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

/// Replication pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingConfig {
    /// Maximum number of entries per AppendEntries batch.
    pub max_batch_entries: usize,

    /// Maximum total payload bytes per AppendEntries batch. A single
    /// oversized entry still ships alone.
    pub max_batch_bytes: usize,

    /// How long one in-flight batch may stay unacknowledged before it
    /// is resent from the same position.
    pub rtt_budget: Duration,

    /// A follower silent for longer than this no longer holds back
    /// pruning.
    pub follower_liveness_window: Duration,
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            max_batch_entries: 100,
            max_batch_bytes: 1024 * 1024,
            rtt_budget: Duration::from_millis(250),
            follower_liveness_window: Duration::from_secs(30),
        }
    }
}

/// Durable log layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// A new segment starts once the active one crosses this size.
    pub segment_rotate_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_rotate_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Pruning policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Strategy that proposes how much prefix to release.
    pub strategy: PruneStrategy,

    /// Entries kept below the commit index regardless of strategy.
    pub safety_margin: u64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            strategy: PruneStrategy::KeepEntries(16 * 1024),
            safety_margin: 1024,
        }
    }
}

/// Cluster-id binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    /// How long a non-bootstrap member waits for a cluster id to appear
    /// in discovery before startup fails.
    pub deadline: Duration,

    /// Discovery polling interval while waiting.
    pub poll_interval: Duration,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timers_are_sane() {
        let timers = TimerConfig::default();
        assert!(timers.heartbeat_interval * 2 < timers.election_timeout_base);
    }

    #[test]
    fn test_config_roundtrips_through_bincode() {
        let config = RaftConfig::new(MemberId::random(), "/tmp/raft");
        let bytes =
            bincode::serde::encode_to_vec(&config, bincode::config::standard()).unwrap();
        let (decoded, _): (RaftConfig, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded.member_id, config.member_id);
        assert_eq!(decoded.shipping.max_batch_entries, config.shipping.max_batch_entries);
    }
}
