// Commit Applier
//
// A dedicated consumer that follows the commit watermark and hands
// committed application payloads to the host, in order, at least once
// per entry. The application keys idempotence on the entry index; its
// checkpoint seeds `last_applied` after a restart. No-op barriers and
// membership entries advance the watermark without reaching the
// application.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::common::LogIndex;
use crate::error::Result;
use crate::log::entry::Command;
use crate::log::RaftLog;

/// Entries handed to the application per apply call.
const APPLY_BATCH: usize = 64;

/// Backoff before retrying a failed apply callback.
const APPLY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The application side of the replicated state machine.
#[async_trait]
pub trait Application: Send + Sync {
    /// Apply committed commands in log order. Called at least once per
    /// entry; must be idempotent keyed on the index.
    async fn apply(&self, entries: Vec<(LogIndex, Vec<u8>)>) -> Result<()>;

    /// The highest index the application has durably applied; read
    /// once at startup.
    fn snapshot_last_applied(&self) -> LogIndex;
}

/// Follows `commit_index` and feeds the application.
pub struct CommitApplier {
    log: Arc<dyn RaftLog>,
    application: Arc<dyn Application>,
    commit_rx: watch::Receiver<LogIndex>,
    last_applied: LogIndex,
    applied_tx: watch::Sender<LogIndex>,
}

impl CommitApplier {
    pub fn new(
        log: Arc<dyn RaftLog>,
        application: Arc<dyn Application>,
        commit_rx: watch::Receiver<LogIndex>,
    ) -> (Self, watch::Receiver<LogIndex>) {
        let last_applied = application.snapshot_last_applied();
        let (applied_tx, applied_rx) = watch::channel(last_applied);
        (
            Self {
                log,
                application,
                commit_rx,
                last_applied,
                applied_tx,
            },
            applied_rx,
        )
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Run until the commit watch closes.
    pub async fn run(mut self) {
        loop {
            let commit_index = *self.commit_rx.borrow_and_update();
            if let Err(e) = self.apply_up_to(commit_index).await {
                tracing::warn!(error = %e, "apply failed, retrying");
                tokio::time::sleep(APPLY_RETRY_DELAY).await;
                continue;
            }
            if self.commit_rx.changed().await.is_err() {
                tracing::info!("commit watch closed, applier exiting");
                return;
            }
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Feed `(last_applied, commit_index]` to the application in
    /// bounded batches, advancing the watermark after each batch.
    async fn apply_up_to(&mut self, commit_index: LogIndex) -> Result<()> {
        while self.last_applied < commit_index {
            let start = self.last_applied + 1;
            let end = commit_index.min(start + APPLY_BATCH as LogIndex - 1);

            let mut batch = Vec::new();
            for index in start..=end {
                let entry = self.log.read_entry(index)?;
                if let Command::Payload(payload) = entry.command {
                    batch.push((index, payload));
                }
            }
            if !batch.is_empty() {
                self.application.apply(batch).await?;
            }

            self.last_applied = end;
            let _ = self.applied_tx.send_replace(end);
        }
        Ok(())
    }
}
