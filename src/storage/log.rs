//! Event view of the revision log, and the poll loop that turns new rows into a change feed.
//!
//! Writers append rows and nudge the poller with the revision they wrote. The poller also wakes
//! on a fixed interval, so rows written by other processes sharing the same database are picked
//! up too. Rows are published strictly in revision order: when a revision is missing (an
//! uncommitted or rolled-back insert), the poller retries once quickly and then fills the hole
//! with a placeholder row so the feed can move on. Missing revisions at or below the compact
//! revision were removed by compaction and are stepped over, never filled.
//!
//! While the feed is streaming, compaction never passes the last revision it published, so
//! rows are not deleted before watchers have seen them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::storage::backend::{Backend, CompactOutcome, InsertRow, LogRows};
use crate::storage::mvcc::Event;
use crate::storage::{StorageError, StorageResult};
use crate::watch::{Broadcaster, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};

/// Pending write notifications kept for the poller.
const NOTIFY_CAPACITY: usize = 1024;

/// Configuration for the log and its poll loop.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Upper bound on how long a row written elsewhere waits before being published.
    pub poll_interval: Duration,

    /// Rows fetched per poll.
    pub poll_batch_size: i64,

    /// How long a revision gap may stay open before the poller steps over it.
    pub gap_skip_timeout: Duration,

    /// Unread events a watcher may fall behind before it is dropped.
    pub watch_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_batch_size: 500,
            gap_skip_timeout: Duration::from_secs(1),
            watch_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// The revision log as a sequence of events.
pub struct SqlLog {
    backend: Arc<Backend>,

    config: LogConfig,

    broadcaster: Broadcaster<Arc<Vec<Event>>>,

    /// Last revision the poll loop handed to the broadcaster.
    published: AtomicI64,

    notify_tx: mpsc::Sender<i64>,

    /// Owned by whichever poll loop is running.
    notify_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<i64>>>,
}

impl SqlLog {
    pub fn new(backend: Arc<Backend>, config: LogConfig) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CAPACITY);
        Arc::new(Self {
            backend,
            broadcaster: Broadcaster::new(config.watch_capacity),
            published: AtomicI64::new(0),
            config,
            notify_tx,
            notify_rx: Arc::new(tokio::sync::Mutex::new(notify_rx)),
        })
    }

    /// Prepares the log for use: makes sure the compact bookkeeping row exists.
    pub async fn start(&self) -> StorageResult<()> {
        self.backend.ensure_compact_key().await?;
        Ok(())
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub async fn current_revision(&self) -> StorageResult<i64> {
        Ok(self.backend.current_revision().await?)
    }

    pub async fn compact_revision(&self) -> StorageResult<i64> {
        Ok(self.backend.compact_revision().await?)
    }

    /// Revision the rows were read at; falls back to a separate query when nothing matched.
    async fn observed_revision(&self, rows: &LogRows) -> StorageResult<i64> {
        if rows.rows.is_empty() {
            self.current_revision().await
        } else {
            Ok(rows.revision)
        }
    }

    /// Fails when history before `requested` may already be gone.
    async fn ensure_retained(&self, requested: i64, rows: &LogRows) -> StorageResult<()> {
        let compact_revision = if rows.rows.is_empty() {
            self.compact_revision().await?
        } else {
            rows.compact_revision
        };
        if requested < compact_revision {
            return Err(StorageError::Compacted {
                requested,
                compact_revision,
            });
        }
        Ok(())
    }

    /// Latest row for `key` at or below `revision` (0 means latest).
    ///
    /// Point reads do not check the compact revision: whatever row survived compaction at or
    /// below `revision` is returned.
    pub async fn get(
        &self,
        key: &str,
        revision: i64,
        include_deleted: bool,
    ) -> StorageResult<(i64, Option<Event>)> {
        let rows = self.backend.get(key, revision, include_deleted).await?;
        let current = self.observed_revision(&rows).await?;
        Ok((current, rows.rows.into_iter().next().map(Event::from)))
    }

    /// Latest row per key under `prefix`, ordered by key, starting at `start_key`.
    pub async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> StorageResult<(i64, Vec<Event>)> {
        let rows = self
            .backend
            .list(prefix, start_key, revision, limit, include_deleted)
            .await?;
        if revision > 0 {
            self.ensure_retained(revision, &rows).await?;
        }
        let current = self.observed_revision(&rows).await?;
        Ok((current, into_events(rows)))
    }

    pub async fn count(&self, prefix: &str) -> StorageResult<(i64, i64)> {
        Ok(self.backend.count(prefix).await?)
    }

    /// Every event under `prefix` with a revision strictly greater than `revision`.
    pub async fn after(&self, prefix: &str, revision: i64, limit: i64) -> StorageResult<(i64, Vec<Event>)> {
        let rows = self.backend.after(prefix, revision, limit).await?;
        self.ensure_retained(revision, &rows).await?;
        let current = self.observed_revision(&rows).await?;
        Ok((current, into_events(rows)))
    }

    /// Appends a row and wakes the poller.
    pub async fn append(&self, row: &InsertRow<'_>) -> StorageResult<i64> {
        let revision = self.backend.insert(row).await?;
        // A full queue already guarantees a wake-up.
        let _ = self.notify_tx.try_send(revision);
        Ok(revision)
    }

    /// Last revision published to watchers, while the change feed is running.
    pub fn published_revision(&self) -> Option<i64> {
        self.broadcaster
            .is_streaming()
            .then(|| self.published.load(Ordering::Acquire))
    }

    /// Compacts towards `target`, never past what the running feed has published.
    pub async fn compact(
        &self,
        expected_compact: Option<i64>,
        target: i64,
        min_retain: i64,
    ) -> StorageResult<CompactOutcome> {
        let target = match self.published_revision() {
            Some(published) if published < target => {
                debug!(
                    "Holding compaction at revision {} until the change feed catches up to {}",
                    published, target
                );
                published
            }
            _ => target,
        };
        Ok(self.backend.compact(expected_compact, target, min_retain).await?)
    }

    pub async fn size(&self) -> StorageResult<i64> {
        Ok(self.backend.size().await?)
    }

    /// Joins the change feed, starting the poll loop if nobody else is listening.
    ///
    /// Every batch published after registration is delivered, unfiltered. The subscription ends
    /// when it is dropped or when it falls a full queue behind.
    pub async fn subscribe(self: &Arc<Self>) -> StorageResult<Subscription<Arc<Vec<Event>>>> {
        let log = Arc::clone(self);
        self.broadcaster
            .subscribe(move |feed_cancel| log.start_feed(feed_cancel))
            .await
    }

    async fn start_feed(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> StorageResult<mpsc::Receiver<Arc<Vec<Event>>>> {
        let last = self.current_revision().await?;
        let (tx, rx) = mpsc::channel(16);
        self.published.store(last, Ordering::Release);
        debug!("Starting poll loop at revision {}", last);
        tokio::spawn(self.poll(tx, last, cancel));
        Ok(rx)
    }

    async fn poll(
        self: Arc<Self>,
        tx: mpsc::Sender<Arc<Vec<Event>>>,
        mut last: i64,
        cancel: CancellationToken,
    ) {
        let mut notify = tokio::select! {
            _ = cancel.cancelled() => return,
            guard = self.notify_rx.lock() => guard,
        };

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut wait_for_more = true;
        let mut skip = 0;
        let mut skip_time = Instant::now();

        loop {
            if wait_for_more {
                let proceed = tokio::select! {
                    _ = cancel.cancelled() => return,
                    revision = notify.recv() => revision.map_or(true, |revision| revision > last),
                    _ = ticker.tick() => true,
                };
                if !proceed {
                    continue;
                }
            }
            wait_for_more = true;

            let batch_size = self.config.poll_batch_size;
            let LogRows {
                compact_revision,
                rows,
                ..
            } = match self.backend.after("", last, batch_size).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("Failed to poll for changes after revision {}: {}", last, e);
                    continue;
                }
            };
            if rows.is_empty() {
                continue;
            }
            wait_for_more = (rows.len() as i64) < batch_size;

            let mut revision = last;
            let mut advanced = false;
            let mut sequential = Vec::with_capacity(rows.len());

            for row in rows {
                let mut next = revision + 1;
                if row.id != next && next <= compact_revision {
                    // Compacted away elsewhere; nothing there will ever be published.
                    debug!(
                        "Revisions {} to {} were compacted before being published",
                        next,
                        compact_revision.min(row.id - 1)
                    );
                    revision = compact_revision.min(row.id - 1);
                    next = revision + 1;
                    advanced = true;
                }
                if row.id != next {
                    trace!("Revision gap: expected {}, got {}", next, row.id);
                    if next == skip && skip_time.elapsed() > self.config.gap_skip_timeout {
                        error!(
                            "Skipping revision gap at {}: publishing {} at revision {}",
                            next, row.name, row.id
                        );
                    } else if next != skip {
                        // First sighting; give an in-flight write a moment to commit.
                        skip = next;
                        skip_time = Instant::now();
                        let _ = self.notify_tx.try_send(next);
                        break;
                    } else {
                        match self.backend.fill(next).await {
                            Ok(()) => {
                                debug!("Filled revision gap at {}", next);
                                let _ = self.notify_tx.try_send(next);
                            }
                            Err(e) => debug!("Failed to fill revision gap at {}: {}", next, e),
                        }
                        break;
                    }
                }

                advanced = true;
                revision = row.id;
                if row.is_internal() {
                    trace!("Not publishing {} at revision {}", row.name, row.id);
                } else {
                    sequential.push(Event::from(row));
                }
            }

            if advanced {
                last = revision;
                if !sequential.is_empty() && tx.send(Arc::new(sequential)).await.is_err() {
                    return;
                }
                self.published.store(last, Ordering::Release);
            }
        }
    }
}

fn into_events(rows: LogRows) -> Vec<Event> {
    rows.rows
        .into_iter()
        .filter(|row| !row.is_internal())
        .map(Event::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::BackendConfig;
    use tempfile::TempDir;

    async fn open_log(temp_dir: &TempDir, config: LogConfig) -> Arc<SqlLog> {
        let backend = Backend::open(BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        let log = SqlLog::new(backend, config);
        log.start().await.unwrap();
        log
    }

    async fn setup_log(temp_dir: &TempDir) -> Arc<SqlLog> {
        open_log(
            temp_dir,
            LogConfig {
                poll_interval: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .await
    }

    fn create<'a>(name: &'a str, value: &'a [u8]) -> InsertRow<'a> {
        InsertRow {
            name,
            created: true,
            deleted: false,
            create_revision: 0,
            prev_revision: 0,
            lease: 0,
            value,
            old_value: &[],
        }
    }

    #[tokio::test]
    async fn test_list_hides_bookkeeping_rows() {
        let temp_dir = TempDir::new().unwrap();
        let log = setup_log(&temp_dir).await;

        let rev = log.append(&create("/a", b"1")).await.unwrap();
        let (current, events) = log.list("", "", 0, 0, false).await.unwrap();
        assert_eq!(current, rev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kv.key, "/a");

        let (_, events) = log.after("", 0, 0).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_after_on_compacted_revision() {
        let temp_dir = TempDir::new().unwrap();
        let log = setup_log(&temp_dir).await;

        let r1 = log.append(&create("/a", b"1")).await.unwrap();
        let r2 = log
            .append(&InsertRow {
                created: false,
                prev_revision: r1,
                create_revision: r1,
                ..create("/a", b"2")
            })
            .await
            .unwrap();
        log.compact(None, r2, 0).await.unwrap();

        let err = log.after("/", r1 - 1, 0).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Compacted { compact_revision, .. } if compact_revision == r2
        ));
        assert!(log.after("/", r2, 0).await.unwrap().1.is_empty());
    }

    async fn next_batch(subscription: &mut Subscription<Arc<Vec<Event>>>) -> Arc<Vec<Event>> {
        tokio::time::timeout(Duration::from_secs(10), subscription.recv())
            .await
            .expect("timed out waiting for events")
            .expect("subscription ended")
    }

    #[tokio::test]
    async fn test_subscription_receives_appended_rows() {
        let temp_dir = TempDir::new().unwrap();
        let log = setup_log(&temp_dir).await;

        let mut subscription = log.subscribe().await.unwrap();
        assert!(log.published_revision().is_some());

        let r1 = log.append(&create("/other", b"x")).await.unwrap();
        let r2 = log.append(&create("/w/1", b"v")).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.extend(next_batch(&mut subscription).await.iter().cloned());
        }
        let revisions: Vec<_> = seen.iter().map(|e| e.kv.mod_revision).collect();
        assert_eq!(revisions, vec![r1, r2]);
        assert!(seen[1].create);

        subscription.unsubscribe();
        assert!(log.published_revision().is_none());
    }

    #[tokio::test]
    async fn test_poll_picks_up_external_writes() {
        let temp_dir = TempDir::new().unwrap();
        let log = setup_log(&temp_dir).await;

        let mut subscription = log.subscribe().await.unwrap();

        // Straight to the backend: no notification, as if another process wrote it.
        let rev = log.backend().insert(&create("/ext", b"v")).await.unwrap();

        let batch = next_batch(&mut subscription).await;
        assert_eq!(batch[0].kv.mod_revision, rev);
        assert_eq!(log.published_revision(), Some(rev));
    }

    #[tokio::test]
    async fn test_poll_fills_revision_gap() {
        let temp_dir = TempDir::new().unwrap();
        let log = setup_log(&temp_dir).await;

        let mut subscription = log.subscribe().await.unwrap();

        let current = log.current_revision().await.unwrap();
        // Leave a hole at current + 1 by writing current + 2 directly.
        log.backend().fill(current + 2).await.unwrap();
        let rev = log.append(&create("/after-gap", b"v")).await.unwrap();
        assert_eq!(rev, current + 3);

        let batch = next_batch(&mut subscription).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kv.key, "/after-gap");

        let rows = log.backend().after("", current, 0).await.unwrap().rows;
        assert!(rows.iter().any(|r| r.id == current + 1 && r.is_fill()));
    }

    #[tokio::test]
    async fn test_poll_steps_over_compacted_revisions() {
        let temp_dir = TempDir::new().unwrap();
        let log = open_log(
            &temp_dir,
            LogConfig {
                poll_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        )
        .await;

        let mut subscription = log.subscribe().await.unwrap();
        // Let the first poll run so the next one only happens on notification.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let backend = log.backend();
        let r1 = backend.insert(&create("/k", b"1")).await.unwrap();
        let r2 = backend
            .insert(&InsertRow {
                created: false,
                prev_revision: r1,
                create_revision: r1,
                ..create("/k", b"2")
            })
            .await
            .unwrap();
        // Another process compacts past rows this feed has not published yet.
        backend.compact(None, r2, 0).await.unwrap();
        let r3 = log.append(&create("/trigger", b"t")).await.unwrap();

        let mut seen = Vec::new();
        while seen.last() != Some(&r3) {
            seen.extend(next_batch(&mut subscription).await.iter().map(|e| e.kv.mod_revision));
        }
        assert_eq!(seen, vec![r2, r3]);

        let rows = backend.after("", 0, 0).await.unwrap().rows;
        assert!(rows.iter().all(|r| !r.is_fill()));
        assert!(rows.iter().all(|r| r.id != r1));
    }

    #[tokio::test]
    async fn test_compaction_waits_for_feed() {
        let temp_dir = TempDir::new().unwrap();
        let log = open_log(
            &temp_dir,
            LogConfig {
                poll_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        )
        .await;

        let mut subscription = log.subscribe().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let published = log.published_revision().unwrap();

        let r1 = log.backend().insert(&create("/k", b"1")).await.unwrap();
        let outcome = log.compact(None, r1, 0).await.unwrap();
        assert!(outcome.compact_revision() <= published);

        let r2 = log.append(&create("/trigger", b"t")).await.unwrap();
        let mut seen = Vec::new();
        while seen.last() != Some(&r2) {
            seen.extend(next_batch(&mut subscription).await.iter().map(|e| e.kv.mod_revision));
        }
        assert_eq!(seen, vec![r1, r2]);

        let outcome = log.compact(None, r1, 0).await.unwrap();
        assert_eq!(outcome.compact_revision(), r1);
    }

    #[tokio::test]
    async fn test_full_batch_polls_again() {
        let temp_dir = TempDir::new().unwrap();
        let log = open_log(
            &temp_dir,
            LogConfig {
                poll_interval: Duration::from_secs(3600),
                poll_batch_size: 2,
                ..Default::default()
            },
        )
        .await;

        let mut subscription = log.subscribe().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..5 {
            log.backend()
                .insert(&create(&format!("/b/{}", i), b"v"))
                .await
                .unwrap();
        }
        // One wake-up has to drain every batch; the next tick is an hour away.
        let last = log.append(&create("/b/last", b"v")).await.unwrap();

        let mut seen = Vec::new();
        while seen.last() != Some(&last) {
            seen.extend(next_batch(&mut subscription).await.iter().map(|e| e.kv.mod_revision));
        }
        assert_eq!(seen.len(), 6);
    }
}
