// Consensus Event Fan-Out
//
// Observable state transitions delivered to subscribers over bounded
// per-subscriber queues. A slow subscriber loses events rather than
// ever blocking the driver loop.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::common::{LogIndex, MemberId, Term};
use crate::membership::MemberSet;

/// Observable consensus transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum RaftEvent {
    TermChanged {
        term: Term,
    },
    LeaderChanged {
        term: Term,
        leader: Option<MemberId>,
    },
    CommitAdvanced {
        index: LogIndex,
    },
    MemberSetChanged {
        members: MemberSet,
    },
}

/// Fan-out hub with drop-on-overflow per subscriber.
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<RaftEvent>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<RaftEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: RaftEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Events lost to full subscriber queues since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
