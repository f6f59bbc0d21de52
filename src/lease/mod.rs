//! Expiry of keys written with a lease.
//!
//! A key's `lease` is a TTL in seconds. The sweeper keeps an in-memory schedule of every leased
//! key and deletes each one when its TTL runs out:
//!
//! - Priority queue (BinaryHeap) of deadlines instead of periodic scanning
//! - Seeded from a full listing, then kept current by watching every write after it
//! - Deletes are conditional on the revision that was scheduled, so a key rewritten in the
//!   meantime survives and is rescheduled from its own write

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::mvcc::{Event, MvccStore};
use crate::storage::{StorageError, StorageResult};

/// Keys fetched per page while seeding the schedule.
const LIST_PAGE_SIZE: i64 = 1000;

/// Pause before re-seeding after the watch ends or fails.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Internal structure for tracking key expiry.
#[derive(Debug, Clone, Eq, PartialEq)]
struct KeyExpiry {
    expires_at: Instant,
    key: String,
    mod_revision: i64,
}

impl Ord for KeyExpiry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering so BinaryHeap acts as a min-heap
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.mod_revision.cmp(&self.mod_revision))
    }
}

impl PartialOrd for KeyExpiry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Deletes leased keys once their TTL has passed.
pub struct TtlSweeper {
    store: Arc<MvccStore>,

    /// Upcoming expirations, earliest first
    queue: BinaryHeap<KeyExpiry>,
}

impl TtlSweeper {
    pub fn new(store: Arc<MvccStore>) -> Self {
        Self {
            store,
            queue: BinaryHeap::new(),
        }
    }

    /// Spawns the sweeper. It stops when `cancel` fires.
    pub fn run(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting TTL sweeper");
            loop {
                match self.sweep(&cancel).await {
                    Ok(()) => break,
                    Err(e) => warn!("TTL sweeper restarting: {}", e),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                }
            }
            info!("TTL sweeper stopped");
        })
    }

    /// Number of scheduled expirations.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn schedule(&mut self, key: String, mod_revision: i64, ttl_secs: i64) {
        let ttl = Duration::from_secs(ttl_secs.max(0) as u64);
        debug!("Scheduling expiry of {} (revision {}) in {:?}", key, mod_revision, ttl);
        self.queue.push(KeyExpiry {
            expires_at: Instant::now() + ttl,
            key,
            mod_revision,
        });
    }

    fn track(&mut self, event: Event) {
        if !event.delete && event.kv.lease > 0 {
            self.schedule(event.kv.key, event.kv.mod_revision, event.kv.lease);
        }
    }

    /// Rebuilds the schedule from a listing and returns the revision it was taken at.
    async fn seed(&mut self) -> StorageResult<i64> {
        self.queue.clear();

        let mut revision = 0;
        let mut start_key = String::new();
        loop {
            let page = self.store.list("", &start_key, LIST_PAGE_SIZE, revision).await?;
            revision = page.revision;
            let full = page.kvs.len() as i64 == LIST_PAGE_SIZE;

            let mut last_key = None;
            for kv in page.kvs {
                // Pages start inclusively at the previous page's last key.
                if !start_key.is_empty() && kv.key == start_key {
                    continue;
                }
                if kv.lease > 0 {
                    self.schedule(kv.key.clone(), kv.mod_revision, kv.lease);
                }
                last_key = Some(kv.key);
            }

            match last_key {
                Some(key) if full => start_key = key,
                _ => break,
            }
        }

        debug!(
            "TTL schedule seeded with {} key(s) at revision {}",
            self.queue.len(),
            revision
        );
        Ok(revision)
    }

    async fn sweep(&mut self, cancel: &CancellationToken) -> StorageResult<()> {
        let revision = self.seed().await?;
        let mut events = self.store.watch("", revision + 1, cancel.child_token()).await?;

        loop {
            let deadline = self.queue.peek().map(|e| e.expires_at);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep_until(deadline), if deadline.is_some() => self.expire_due().await,
                event = events.next() => match event {
                    Some(event) => self.track(event),
                    None => return Err(StorageError::Unavailable("watch stream ended".to_string())),
                },
            }
        }
    }

    async fn expire_due(&mut self) {
        let now = Instant::now();
        while self.queue.peek().is_some_and(|e| e.expires_at <= now) {
            let Some(expiry) = self.queue.pop() else { break };
            match self.store.delete(&expiry.key, expiry.mod_revision).await {
                Ok((revision, _)) => {
                    info!("Expired key {} at revision {}", expiry.key, revision);
                }
                Err(StorageError::Conflict { .. }) | Err(StorageError::NotFound) => {
                    debug!(
                        "Key {} changed since revision {}; not expiring",
                        expiry.key, expiry.mod_revision
                    );
                }
                Err(e) => warn!("Failed to expire key {}: {}", expiry.key, e),
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
