//! Multi-Version Concurrency Control (MVCC) store.
//!
//! This is the key-value face of the revision log. Every mutation appends one row, and the row's
//! id becomes both the global revision and the key's new `mod_revision`:
//!
//! - **Create** appends with `prev_revision` pointing at the key's tombstone, or 0 for a new name
//! - **Update** appends with `prev_revision` set to the caller's expected revision
//! - **Delete** appends a tombstone the same way
//!
//! Because `(name, prev_revision)` is unique, two writers that observed the same revision cannot
//! both append: the database rejects the loser, which surfaces as [`StorageError::Conflict`].
//! No explicit locking is involved.
//!
//! Watchers read the shared change feed directly. Each one may fall at most `watch_capacity`
//! events behind; past that its stream ends and it has to re-list and watch again.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::storage::backend::{CompactOutcome, InsertRow, LogRow};
use crate::storage::dialect::{COMPACT_REV_KEY, FILL_PREFIX};
use crate::storage::log::SqlLog;
use crate::storage::{StorageError, StorageResult};

/// A key-value pair with MVCC metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// The actual key
    pub key: String,

    /// The revision when this key was created
    pub create_revision: i64,

    /// The revision when this key was last modified
    pub mod_revision: i64,

    /// The actual value
    pub value: Vec<u8>,

    /// Associated lease TTL in seconds (0 if none)
    pub lease: i64,
}

/// Event type for watch notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change to a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// The key did not exist before this change.
    pub create: bool,

    /// This change is a tombstone.
    pub delete: bool,

    /// State after the change; for a delete, the value that was removed.
    pub kv: KeyValue,

    /// State before the change, absent for creates.
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        if self.delete {
            EventType::Delete
        } else {
            EventType::Put
        }
    }
}

/// The previous state's lease is reported as 0: rows only record the lease of the new state.
impl From<LogRow> for Event {
    fn from(row: LogRow) -> Self {
        let create_revision = if row.created {
            row.id
        } else {
            row.create_revision
        };
        let prev_kv = (!row.created).then(|| KeyValue {
            key: row.name.clone(),
            create_revision,
            mod_revision: row.prev_revision,
            value: row.old_value,
            lease: 0,
        });
        Event {
            create: row.created,
            delete: row.deleted,
            kv: KeyValue {
                key: row.name,
                create_revision,
                mod_revision: row.id,
                value: row.value,
                lease: row.lease,
            },
            prev_kv,
        }
    }
}

/// Result of a range read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeResult {
    /// Revision the read was served at.
    pub revision: i64,

    /// Matching keys, ordered by key.
    pub kvs: Vec<KeyValue>,
}

/// Events, in revision order, for one watcher.
pub type WatchStream = ReceiverStream<Event>;

/// The MVCC Store - the key-value engine.
pub struct MvccStore {
    log: Arc<SqlLog>,
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidArgument("key must not be empty".to_string()));
    }
    let fill = key
        .strip_prefix(FILL_PREFIX)
        .is_some_and(|n| n.parse::<i64>().is_ok());
    if key == COMPACT_REV_KEY || fill {
        return Err(StorageError::InvalidArgument(format!("key {} is reserved", key)));
    }
    Ok(())
}

impl MvccStore {
    pub fn new(log: Arc<SqlLog>) -> Arc<Self> {
        info!("Initializing MVCC store");
        Arc::new(Self { log })
    }

    pub fn log(&self) -> &Arc<SqlLog> {
        &self.log
    }

    /// Gets the current global revision: the highest revision ever committed.
    pub async fn current_revision(&self) -> StorageResult<i64> {
        self.log.current_revision().await
    }

    /// Gets the compact revision (history at or below it may be gone).
    pub async fn compact_revision(&self) -> StorageResult<i64> {
        self.log.compact_revision().await
    }

    /// Latest live value of `key`.
    pub async fn get(&self, key: &str) -> StorageResult<KeyValue> {
        self.get_at(key, 0).await
    }

    /// Value of `key` as of `revision`; 0 reads the latest.
    pub async fn get_at(&self, key: &str, revision: i64) -> StorageResult<KeyValue> {
        validate_key(key)?;
        let (_, event) = self.log.get(key, revision, false).await?;
        event.map(|e| e.kv).ok_or(StorageError::NotFound)
    }

    /// Live keys under `prefix` as of `revision` (0 for latest), ordered by key.
    ///
    /// `start_key` resumes a paginated listing; a `limit` of 0 returns everything.
    pub async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> StorageResult<RangeResult> {
        let (mut current, mut events) = self.log.list(prefix, start_key, limit, revision, false).await?;

        // A latest read that found nothing is pinned to a concrete revision and retried, so the
        // returned revision is one the caller can watch from without missing a create.
        if revision == 0 && events.is_empty() {
            (current, events) = self.log.list(prefix, start_key, limit, current, false).await?;
        }

        trace!(
            "LIST prefix={} start_key={} limit={} revision={} => revision={} kvs={}",
            prefix,
            start_key,
            limit,
            revision,
            current,
            events.len()
        );

        Ok(RangeResult {
            revision: if revision > 0 { revision } else { current },
            kvs: events.into_iter().map(|e| e.kv).collect(),
        })
    }

    /// Number of live keys under `prefix`, with the current revision.
    pub async fn count(&self, prefix: &str) -> StorageResult<(i64, i64)> {
        self.log.count(prefix).await
    }

    /// Creates `key`. Fails with [`StorageError::KeyExists`] if it is live.
    pub async fn create(&self, key: &str, value: &[u8], lease: i64) -> StorageResult<i64> {
        validate_key(key)?;

        let (_, latest) = self.log.get(key, 0, true).await?;
        let prev_revision = match latest {
            Some(event) if !event.delete => return Err(StorageError::KeyExists),
            Some(tombstone) => tombstone.kv.mod_revision,
            None => 0,
        };

        let row = InsertRow {
            name: key,
            created: true,
            deleted: false,
            create_revision: 0,
            prev_revision,
            lease,
            value,
            old_value: &[],
        };
        let result = self.log.append(&row).await;
        debug!(
            "CREATE {}, size={}, lease={} => {:?}",
            key,
            value.len(),
            lease,
            result.as_ref().map_err(|e| e.to_string())
        );
        result
    }

    /// Replaces the value of `key` if its current revision is `expected_revision`.
    pub async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: i64,
        lease: i64,
    ) -> StorageResult<KeyValue> {
        validate_key(key)?;

        let current = self.get(key).await?;
        if current.mod_revision != expected_revision {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                expected: expected_revision,
                current: current.mod_revision,
            });
        }

        let row = InsertRow {
            name: key,
            created: false,
            deleted: false,
            create_revision: current.create_revision,
            prev_revision: expected_revision,
            lease,
            value,
            old_value: &current.value,
        };
        let result = self.log.append(&row).await;
        debug!(
            "UPDATE {}, expected={}, size={}, lease={} => {:?}",
            key,
            expected_revision,
            value.len(),
            lease,
            result.as_ref().map_err(|e| e.to_string())
        );

        match result {
            Ok(revision) => Ok(KeyValue {
                key: key.to_string(),
                create_revision: current.create_revision,
                mod_revision: revision,
                value: value.to_vec(),
                lease,
            }),
            Err(StorageError::KeyExists) => Err(self.conflict(key, expected_revision).await),
            Err(e) => Err(e),
        }
    }

    /// Deletes `key`, returning the tombstone revision and the value that was removed.
    ///
    /// An `expected_revision` of 0 deletes unconditionally.
    pub async fn delete(&self, key: &str, expected_revision: i64) -> StorageResult<(i64, KeyValue)> {
        validate_key(key)?;

        let current = self.get(key).await?;
        if expected_revision != 0 && current.mod_revision != expected_revision {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                expected: expected_revision,
                current: current.mod_revision,
            });
        }

        let row = InsertRow {
            name: key,
            created: false,
            deleted: true,
            create_revision: current.create_revision,
            prev_revision: current.mod_revision,
            lease: current.lease,
            value: &current.value,
            old_value: &current.value,
        };
        let result = self.log.append(&row).await;
        debug!(
            "DELETE {}, expected={} => {:?}",
            key,
            expected_revision,
            result.as_ref().map_err(|e| e.to_string())
        );

        match result {
            Ok(revision) => Ok((revision, current)),
            Err(StorageError::KeyExists) => Err(self.conflict(key, current.mod_revision).await),
            Err(e) => Err(e),
        }
    }

    /// Builds the error for a lost compare-and-swap, reporting the winner's revision if visible.
    async fn conflict(&self, key: &str, expected: i64) -> StorageError {
        let current = match self.log.get(key, 0, true).await {
            Ok((_, Some(event))) => event.kv.mod_revision,
            _ => 0,
        };
        StorageError::Conflict {
            key: key.to_string(),
            expected,
            current,
        }
    }

    /// Every event under `prefix` from `from_revision` onwards, in revision order.
    ///
    /// Fails with [`StorageError::Compacted`] if `from_revision` is at or below the compact
    /// revision.
    pub async fn replay(&self, prefix: &str, from_revision: i64) -> StorageResult<(i64, Vec<Event>)> {
        self.log.after(prefix, from_revision.max(1) - 1, 0).await
    }

    /// Watches `prefix` starting at `start_revision`; 0 starts from the next write.
    ///
    /// History from `start_revision` is replayed first, then live events follow without gaps or
    /// duplicates. The stream ends when `cancel` fires or when the watcher falls more than
    /// `watch_capacity` events behind.
    pub async fn watch(
        &self,
        prefix: &str,
        start_revision: i64,
        cancel: CancellationToken,
    ) -> StorageResult<WatchStream> {
        // Subscribe before reading history so nothing committed in between is lost.
        let mut live = self.log.subscribe().await?;

        let backlog = if start_revision > 0 {
            self.replay(prefix, start_revision).await?.1
        } else {
            Vec::new()
        };
        let mut last = match backlog.last() {
            Some(event) => event.kv.mod_revision,
            None if start_revision > 0 => start_revision - 1,
            None => self.current_revision().await?,
        };

        debug!(
            "WATCH prefix={} start_revision={} replayed={} last={}",
            prefix,
            start_revision,
            backlog.len(),
            last
        );

        let capacity = self.log.config().watch_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            for event in backlog {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(event) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
            'feed: loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    batch = live.recv() => batch,
                };
                let Some(batch) = batch else { break };

                let fresh: Vec<&Event> = batch
                    .iter()
                    .filter(|e| e.kv.mod_revision > last && e.kv.key.starts_with(&prefix))
                    .collect();
                if fresh.is_empty() {
                    continue;
                }
                // This task is the only sender, so the free capacity cannot shrink under us.
                if tx.capacity() < fresh.len() {
                    warn!(
                        "Dropping slow watcher on {}: more than {} events behind",
                        prefix, capacity
                    );
                    break;
                }
                for event in fresh {
                    last = event.kv.mod_revision;
                    match tx.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => break 'feed,
                    }
                }
            }
            live.unsubscribe();
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Compacts history up to `revision`. Repeating a compaction is a no-op.
    pub async fn compact(&self, revision: i64) -> StorageResult<CompactOutcome> {
        let current = self.current_revision().await?;
        if revision > current {
            return Err(StorageError::InvalidArgument(format!(
                "cannot compact to future revision {} (current {})",
                revision, current
            )));
        }
        let outcome = self.log.compact(None, revision, 0).await?;
        info!("Compaction to revision {} finished: {:?}", revision, outcome);
        Ok(outcome)
    }

    /// Approximate size of the backing store in bytes.
    pub async fn size(&self) -> StorageResult<i64> {
        self.log.size().await
    }
}
