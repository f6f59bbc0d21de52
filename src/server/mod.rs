//! Main server module that orchestrates all subsystems.
//!
//! This module coordinates the initialization and execution of:
//! - Persistent storage backend (SQLite, PostgreSQL or MySQL)
//! - Revision log and its change feed
//! - MVCC store (the key-value operations)
//! - Background compactor
//! - TTL sweeper for leased keys

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::lease::TtlSweeper;
use crate::storage::backend::{Backend, BackendConfig, PoolConfig, TlsConfig};
use crate::storage::compaction::{Compactor, CompactorConfig};
use crate::storage::dialect::redact_endpoint;
use crate::storage::log::{LogConfig, SqlLog};
use crate::storage::mvcc::MvccStore;

/// Configuration for the relkv server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Path to the data directory (holds the default SQLite database).
    pub data_dir: PathBuf,

    /// Storage endpoint: empty, `sqlite://path`, `postgres://...` or `mysql://...`.
    pub endpoint: String,

    /// TLS material for networked backends.
    pub tls: TlsConfig,

    /// Connection pool sizing.
    pub pool: PoolConfig,

    /// Attempts to reach the database at startup.
    pub connect_retries: u32,

    /// Upper bound on change-feed latency for writes from other processes.
    pub poll_interval: Duration,

    /// Rows fetched per poll.
    pub poll_batch_size: i64,

    /// Queue depth per watcher before it is dropped as slow.
    pub watch_capacity: usize,

    /// Time between compaction passes (zero disables compaction).
    pub compaction_interval: Duration,

    /// Most recent revisions never compacted.
    pub compaction_min_retain: i64,

    /// Revisions compacted per transaction.
    pub compaction_batch_size: i64,

    /// Expire keys written with a lease.
    pub enable_ttl: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let backend = BackendConfig::default();
        let log = LogConfig::default();
        let compactor = CompactorConfig::default();
        Self {
            data_dir: backend.data_dir,
            endpoint: backend.endpoint,
            tls: backend.tls,
            pool: backend.pool,
            connect_retries: backend.connect_retries,
            poll_interval: log.poll_interval,
            poll_batch_size: log.poll_batch_size,
            watch_capacity: log.watch_capacity,
            compaction_interval: compactor.interval,
            compaction_min_retain: compactor.min_retain,
            compaction_batch_size: compactor.batch_size,
            enable_ttl: true,
        }
    }
}

impl ServerConfig {
    fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            endpoint: self.endpoint.clone(),
            data_dir: self.data_dir.clone(),
            tls: self.tls.clone(),
            pool: self.pool.clone(),
            connect_retries: self.connect_retries,
            ..Default::default()
        }
    }

    fn log_config(&self) -> LogConfig {
        LogConfig {
            poll_interval: self.poll_interval,
            poll_batch_size: self.poll_batch_size,
            watch_capacity: self.watch_capacity,
            ..Default::default()
        }
    }

    fn compactor_config(&self) -> CompactorConfig {
        CompactorConfig {
            interval: self.compaction_interval,
            min_retain: self.compaction_min_retain,
            batch_size: self.compaction_batch_size,
            ..Default::default()
        }
    }

    /// Rejects settings that cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow::anyhow!("Poll interval must be greater than zero"));
        }
        if self.poll_batch_size <= 0 {
            return Err(anyhow::anyhow!("Poll batch size must be greater than zero"));
        }
        if self.watch_capacity == 0 {
            return Err(anyhow::anyhow!("Watch buffer must be greater than zero"));
        }
        if self.compaction_min_retain < 0 {
            return Err(anyhow::anyhow!("Compaction min-retain must not be negative"));
        }
        if self.pool.max_open == 0 {
            return Err(anyhow::anyhow!("Max open connections must be greater than zero"));
        }
        Ok(())
    }
}

/// Main relkv server that coordinates all subsystems.
pub struct RelkvServer {
    config: ServerConfig,
    backend: Arc<Backend>,
    log: Arc<SqlLog>,
    store: Arc<MvccStore>,
    cancel: CancellationToken,
    background_tasks: Vec<JoinHandle<()>>,
}

impl RelkvServer {
    /// Create a new relkv server instance with the given configuration.
    ///
    /// This initializes all subsystems:
    /// 1. Persistent storage backend (connect, create schema)
    /// 2. Revision log (compact bookkeeping row)
    /// 3. MVCC store
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        info!(
            endpoint = %redact_endpoint(&config.endpoint),
            data_dir = %config.data_dir.display(),
            "Initializing relkv server"
        );

        // 1. Initialize backend storage
        let backend = Backend::open(config.backend_config())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize backend: {}", e))?;
        info!(dialect = %backend.dialect(), "Backend storage initialized");

        // 2. Initialize the revision log
        let log = SqlLog::new(Arc::clone(&backend), config.log_config());
        log.start()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize revision log: {}", e))?;

        // 3. Initialize MVCC store
        let store = MvccStore::new(Arc::clone(&log));
        let revision = store.current_revision().await?;
        info!(revision = revision, "MVCC store initialized");

        Ok(Self {
            config,
            backend,
            log,
            store,
            cancel: CancellationToken::new(),
            background_tasks: Vec::new(),
        })
    }

    /// Starts the compactor and TTL sweeper. Calling it again has no effect.
    pub fn start(&mut self) {
        if !self.background_tasks.is_empty() {
            return;
        }

        if self.config.compaction_interval.is_zero() {
            info!("Background compaction disabled");
        } else {
            let compactor = Compactor::new(Arc::clone(&self.log), self.config.compactor_config());
            self.background_tasks.push(compactor.run(self.cancel.child_token()));
        }

        if self.config.enable_ttl {
            let sweeper = TtlSweeper::new(Arc::clone(&self.store));
            self.background_tasks.push(sweeper.run(self.cancel.child_token()));
        }
    }

    /// Run the server's background work until `shutdown` resolves, then stop it.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        self.start();
        info!(
            "relkv server running; poll interval {:?}, compaction interval {:?}",
            self.config.poll_interval, self.config.compaction_interval
        );

        shutdown.await;

        info!("relkv server shutting down");
        self.stop().await;
        Ok(())
    }

    /// Stops background tasks and closes the connection pool.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.background_tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.backend.close().await;
    }

    /// Get reference to the MVCC store.
    pub fn store(&self) -> Arc<MvccStore> {
        self.store.clone()
    }

    /// Get reference to the storage backend.
    pub fn backend(&self) -> Arc<Backend> {
        self.backend.clone()
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
