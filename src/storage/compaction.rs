//! Background compaction worker for the revision log.
//!
//! Compaction deletes rows that a newer row has superseded, plus tombstones, up to a target
//! revision. The worker wakes on a fixed interval and walks from the last compacted revision to
//! the current one in bounded batches, each its own short transaction, always leaving the most
//! recent `min_retain` revisions alone so watchers that are slightly behind can still resume.
//!
//! Several processes may share one database; each runs its own compactor. A batch only commits
//! if the stored compact revision is still the one this worker last saw, so concurrent workers
//! never redo or undo each other's work.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::backend::CompactOutcome;
use crate::storage::log::SqlLog;
use crate::storage::{StorageError, StorageResult};

/// Configuration for the background compactor.
#[derive(Clone, Debug)]
pub struct CompactorConfig {
    /// Time between compaction passes; zero disables the worker.
    pub interval: Duration,

    /// Revisions below the current one that are never compacted.
    pub min_retain: i64,

    /// Revisions covered by one transaction.
    pub batch_size: i64,

    /// Upper bound on a single batch.
    pub timeout: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            min_retain: 1000,
            batch_size: 1000,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Clamps `target` so at least `min_retain` revisions below `current` survive.
pub fn safe_compact_rev(target: i64, current: i64, min_retain: i64) -> i64 {
    target.min(current - min_retain).max(0)
}

/// Background compactor that removes superseded revisions.
pub struct Compactor {
    log: Arc<SqlLog>,

    config: CompactorConfig,
}

impl Compactor {
    pub fn new(log: Arc<SqlLog>, config: CompactorConfig) -> Self {
        Self { log, config }
    }

    /// Spawns the periodic worker. It stops when `cancel` fires.
    pub fn run(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_periodic(cancel).await })
    }

    async fn run_periodic(&self, cancel: CancellationToken) {
        info!(
            "Starting periodic compactor with interval: {:?}, min_retain: {}",
            self.config.interval, self.config.min_retain
        );

        let mut compact_rev = self.log.compact_revision().await.unwrap_or(0);
        let mut target_rev = self.log.current_revision().await.unwrap_or(0);

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.compact_range(compact_rev, target_rev).await {
                Ok((compacted, current)) => {
                    compact_rev = compacted;
                    target_rev = current;
                }
                Err(e) => warn!("Periodic compaction failed: {}", e),
            }
        }

        info!("Compactor stopped");
    }

    /// Compacts from `compact_rev` towards `target_rev` in batches.
    ///
    /// Returns the compact revision reached and the current revision last observed, which the
    /// next pass uses as its target. Stops early if another worker moved the compact revision.
    pub async fn compact_range(&self, compact_rev: i64, target_rev: i64) -> StorageResult<(i64, i64)> {
        let batch = self.config.batch_size.max(1);
        let mut compacted = compact_rev;
        let mut current = target_rev;
        let mut iter = compact_rev;

        if iter >= target_rev {
            current = self.log.current_revision().await?;
            debug!(
                "Nothing to compact: compact_rev={}, target={}, current={}",
                compact_rev, target_rev, current
            );
            return Ok((compacted, current));
        }

        while iter < target_rev {
            iter = (iter + batch).min(target_rev);

            let step = tokio::time::timeout(
                self.config.timeout,
                self.log.compact(Some(compacted), iter, self.config.min_retain),
            )
            .await
            .map_err(|_| {
                StorageError::Unavailable(format!("compaction to revision {} timed out", iter))
            })??;

            match step {
                CompactOutcome::Compacted {
                    compact_revision,
                    current_revision,
                    deleted_rows,
                } => {
                    debug!(
                        "Compacted to revision {}: deleted {} rows",
                        compact_revision, deleted_rows
                    );
                    compacted = compact_revision;
                    current = current_revision;
                }
                CompactOutcome::Skipped {
                    compact_revision,
                    current_revision,
                } => {
                    compacted = compact_revision;
                    current = current_revision;
                    break;
                }
            }
        }

        if compacted > compact_rev {
            info!("Periodic compaction completed to revision {}", compacted);
        }
        Ok((compacted, current))
    }
}
