//! SQL-backed persistent storage backend.
//!
//! This module owns the connection pool and every statement issued against the revision log
//! table, `kv_log`. Each row is one write: a create, an update or a tombstone. The row id is the
//! revision, and the unique `(name, prev_revision)` index is what makes compare-and-swap atomic:
//! two writers racing on the same predecessor cannot both insert.
//!
//! - **Dialects**: SQLite (embedded, single file), PostgreSQL and MySQL through sqlx's `Any` driver
//! - **Retries**: lock contention is retried with linear backoff and jitter; exhaustion surfaces
//!   as [`BackendError::Unavailable`]
//! - **Single writer**: SQLite writes are serialized through an in-process lock
//! - **Bootstrap**: schema creation is idempotent and retried while the database comes up

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::storage::compaction::safe_compact_rev;
use crate::storage::dialect::{
    prefix_pattern, redact_endpoint, stripped, Dialect, Endpoint, ErrorClass, Statements,
    COMPACT_REV_KEY, FILL_PREFIX,
};

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Key exists")]
    KeyExists,

    #[error("Database unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("Schema bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Client TLS material for networked backends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Encrypt without verifying the server certificate.
    pub skip_verify: bool,
}

impl TlsConfig {
    pub fn is_empty(&self) -> bool {
        self.ca_file.is_none() && self.cert_file.is_none() && self.key_file.is_none() && !self.skip_verify
    }
}

/// Connection pool sizing.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Upper bound on open connections.
    pub max_open: u32,

    /// Connections kept warm; connections above this are closed after `idle_timeout`.
    pub max_idle: u32,

    /// Recycle connections older than this.
    pub max_lifetime: Option<Duration>,

    pub idle_timeout: Duration,

    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: 2,
            max_lifetime: None,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the backend storage.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Storage endpoint; empty selects SQLite under `data_dir`.
    pub endpoint: String,

    /// Directory holding the default SQLite database.
    pub data_dir: PathBuf,

    pub tls: TlsConfig,

    pub pool: PoolConfig,

    /// Attempts to reach the database and create the schema before giving up.
    pub connect_retries: u32,

    pub connect_retry_interval: Duration,

    /// Attempts for a statement that keeps failing with lock contention, or for a read that
    /// keeps losing its connection.
    pub write_retries: u32,

    /// Base delay between attempts; grows linearly with the attempt number.
    pub write_retry_backoff: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            data_dir: PathBuf::from("./db"),
            tls: TlsConfig::default(),
            pool: PoolConfig::default(),
            connect_retries: 30,
            connect_retry_interval: Duration::from_secs(1),
            write_retries: 20,
            write_retry_backoff: Duration::from_millis(10),
        }
    }
}

/// One physical row of the revision log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRow {
    /// Revision of this write.
    pub id: i64,
    pub name: String,
    pub created: bool,
    pub deleted: bool,
    /// Revision at which the key was created; only meaningful when `created` is false.
    pub create_revision: i64,
    /// Revision this write supersedes; 0 for the first write of a name.
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub old_value: Vec<u8>,
}

impl LogRow {
    fn decode(row: &AnyRow, offset: usize) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get(offset)?,
            name: row.try_get(offset + 1)?,
            created: row.try_get::<i64, _>(offset + 2)? != 0,
            deleted: row.try_get::<i64, _>(offset + 3)? != 0,
            create_revision: row.try_get::<Option<i64>, _>(offset + 4)?.unwrap_or(0),
            prev_revision: row.try_get::<Option<i64>, _>(offset + 5)?.unwrap_or(0),
            lease: row.try_get::<Option<i64>, _>(offset + 6)?.unwrap_or(0),
            value: row.try_get::<Option<Vec<u8>>, _>(offset + 7)?.unwrap_or_default(),
            old_value: row.try_get::<Option<Vec<u8>>, _>(offset + 8)?.unwrap_or_default(),
        })
    }

    /// Whether this row was written by the poll loop to close a revision gap.
    pub fn is_fill(&self) -> bool {
        self.name.starts_with(FILL_PREFIX) && self.name[FILL_PREFIX.len()..].parse::<i64>().is_ok()
    }

    /// Bookkeeping rows never surface as keys or events.
    pub fn is_internal(&self) -> bool {
        self.name == COMPACT_REV_KEY || self.is_fill()
    }
}

/// Rows returned by a log query, along with the revisions observed by the same statement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogRows {
    /// Highest revision in the table; 0 when no row was returned.
    pub revision: i64,
    /// Last compacted revision; 0 when no row was returned.
    pub compact_revision: i64,
    pub rows: Vec<LogRow>,
}

fn decode_rows(rows: &[AnyRow]) -> Result<LogRows, sqlx::Error> {
    let mut out = LogRows::default();
    for row in rows {
        out.revision = row.try_get::<Option<i64>, _>(0)?.unwrap_or(0);
        out.compact_revision = row.try_get::<Option<i64>, _>(1)?.unwrap_or(0);
        out.rows.push(LogRow::decode(row, 2)?);
    }
    Ok(out)
}

/// A row to append.
#[derive(Clone, Copy, Debug)]
pub struct InsertRow<'a> {
    pub name: &'a str,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: &'a [u8],
    pub old_value: &'a [u8],
}

/// Result of a compaction step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactOutcome {
    /// Rows at or below `compact_revision` were removed.
    Compacted {
        compact_revision: i64,
        current_revision: i64,
        deleted_rows: u64,
    },
    /// Nothing to do: the target was already compacted, or another compactor moved first.
    Skipped {
        compact_revision: i64,
        current_revision: i64,
    },
}

impl CompactOutcome {
    pub fn compact_revision(&self) -> i64 {
        match self {
            CompactOutcome::Compacted { compact_revision, .. }
            | CompactOutcome::Skipped { compact_revision, .. } => *compact_revision,
        }
    }

    pub fn current_revision(&self) -> i64 {
        match self {
            CompactOutcome::Compacted { current_revision, .. }
            | CompactOutcome::Skipped { current_revision, .. } => *current_revision,
        }
    }
}

/// The persistent storage backend.
pub struct Backend {
    pool: AnyPool,

    dialect: Dialect,

    /// Statement text, translated once for the dialect.
    statements: Statements,

    /// Held around every write on single-writer backends.
    write_lock: Option<tokio::sync::Mutex<()>>,

    config: BackendConfig,
}

impl Backend {
    /// Opens the backend described by `config` and ensures the schema exists.
    ///
    /// Connection and schema errors that look transient are retried up to `connect_retries`
    /// times; anything else fails immediately.
    pub async fn open(config: BackendConfig) -> BackendResult<Arc<Self>> {
        sqlx::any::install_default_drivers();

        let endpoint = Endpoint::parse(&config.endpoint, &config.data_dir)?;
        let dialect = endpoint.dialect;
        debug!(
            "Initializing {} storage backend at {}",
            dialect,
            redact_endpoint(&endpoint.dsn)
        );

        if let Some(parent) = endpoint.path.as_ref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if dialect == Dialect::Sqlite && !config.tls.is_empty() {
            warn!("TLS settings are ignored by the sqlite backend");
        }
        let dsn = dialect.apply_tls(&endpoint.dsn, &config.tls);

        let pool = Self::connect(dialect, &dsn, &config).await?;
        let backend = Self {
            pool,
            dialect,
            statements: Statements::new(dialect),
            write_lock: dialect.locks_writes().then(|| tokio::sync::Mutex::new(())),
            config,
        };
        backend.bootstrap().await?;

        info!(
            "Storage backend initialized: dialect={}, max_open={}, max_idle={}",
            dialect, backend.config.pool.max_open, backend.config.pool.max_idle
        );

        Ok(Arc::new(backend))
    }

    async fn connect(dialect: Dialect, dsn: &str, config: &BackendConfig) -> BackendResult<AnyPool> {
        let init = dialect.connection_init();
        let pool_config = &config.pool;
        let max_open = pool_config.max_open.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = AnyPoolOptions::new()
                .max_connections(max_open)
                .min_connections(pool_config.max_idle.min(max_open))
                .max_lifetime(pool_config.max_lifetime)
                .idle_timeout(Some(pool_config.idle_timeout))
                .acquire_timeout(pool_config.acquire_timeout)
                .after_connect(move |conn, _meta| {
                    Box::pin(async move {
                        for statement in init {
                            sqlx::query(statement).execute(&mut *conn).await?;
                        }
                        Ok(())
                    })
                })
                .connect(dsn)
                .await;

            match result {
                Ok(pool) => return Ok(pool),
                Err(e) => match dialect.classify(&e) {
                    ErrorClass::Unavailable | ErrorClass::Busy if attempt < config.connect_retries => {
                        warn!(
                            "Failed to connect to {} (attempt {}/{}): {}",
                            dialect, attempt, config.connect_retries, e
                        );
                        tokio::time::sleep(config.connect_retry_interval).await;
                    }
                    ErrorClass::Unavailable | ErrorClass::Busy => {
                        return Err(BackendError::Unavailable {
                            attempts: attempt,
                            source: e,
                        })
                    }
                    _ => {
                        return Err(BackendError::ConfigError(format!(
                            "Failed to open {} database: {}",
                            dialect, e
                        )))
                    }
                },
            }
        }
    }

    /// Creates the table and indexes. Safe to run against an existing schema.
    async fn bootstrap(&self) -> BackendResult<()> {
        let mut attempt = 0;
        'retry: loop {
            attempt += 1;
            for statement in self.dialect.schema() {
                trace!("EXEC {}", stripped(statement));
                let Err(e) = sqlx::query(statement).execute(&self.pool).await else {
                    continue;
                };
                match self.dialect.classify(&e) {
                    ErrorClass::DuplicateObject => {
                        debug!("Schema object already exists: {}", stripped(statement));
                    }
                    ErrorClass::Unavailable | ErrorClass::Busy
                        if attempt < self.config.connect_retries =>
                    {
                        warn!(
                            "Schema bootstrap failed (attempt {}/{}): {}",
                            attempt, self.config.connect_retries, e
                        );
                        tokio::time::sleep(self.config.connect_retry_interval).await;
                        continue 'retry;
                    }
                    _ => return Err(BackendError::Bootstrap(e.to_string())),
                }
            }
            debug!("Schema ready after {} attempt(s)", attempt);
            return Ok(());
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.write_retry_backoff;
        let jitter_ms = (base.as_millis() as u64 / 2).max(1);
        base * attempt + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Runs `op`, retrying while the backend reports lock contention. Reads are also retried
    /// while the database is unreachable; a write that may have committed is not.
    async fn retry<T, F, Fut>(&self, label: &'static str, read: bool, mut op: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let attempts = self.config.write_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let e = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match self.dialect.classify(&e) {
                ErrorClass::UniqueViolation => return Err(BackendError::KeyExists),
                class if retryable(class, read) && attempt < attempts => {
                    debug!("{} failed (attempt {}/{}): {}", label, attempt, attempts, e);
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                ErrorClass::Busy | ErrorClass::Unavailable => {
                    return Err(BackendError::Unavailable {
                        attempts: attempt,
                        source: e,
                    })
                }
                _ => return Err(e.into()),
            }
        }
    }

    async fn read<T, F, Fut>(&self, label: &'static str, op: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        self.retry(label, true, op).await
    }

    /// Like [`Backend::retry`], holding the single-writer lock if the dialect needs one.
    async fn write<T, F, Fut>(&self, label: &'static str, op: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let _guard = match &self.write_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        self.retry(label, false, op).await
    }

    async fn fetch_rows(&self, label: &'static str, sql: &str, binds: &[Bind<'_>]) -> BackendResult<LogRows> {
        trace!("QUERY {} {:?}", stripped(sql), binds);
        let pool = &self.pool;
        let rows = self
            .read(label, move || async move {
                let mut query = sqlx::query(sql);
                for bind in binds {
                    query = match *bind {
                        Bind::Str(s) => query.bind(s),
                        Bind::Int(i) => query.bind(i),
                    };
                }
                query.fetch_all(pool).await
            })
            .await?;
        Ok(decode_rows(&rows)?)
    }

    /// Highest revision in the log, or 0 for an empty log.
    pub async fn current_revision(&self) -> BackendResult<i64> {
        let (pool, sql) = (&self.pool, self.statements.current_revision.as_str());
        let revision = self
            .read("current_revision", move || async move {
                sqlx::query_scalar::<_, Option<i64>>(sql).fetch_one(pool).await
            })
            .await?;
        Ok(revision.unwrap_or(0))
    }

    /// Last compacted revision, or 0 if the log was never compacted.
    pub async fn compact_revision(&self) -> BackendResult<i64> {
        let (pool, sql) = (&self.pool, self.statements.compact_revision.as_str());
        let revision = self
            .read("compact_revision", move || async move {
                sqlx::query_scalar::<_, Option<i64>>(sql).fetch_one(pool).await
            })
            .await?;
        Ok(revision.unwrap_or(0))
    }

    /// Latest row for `name` at or below `revision`; a revision of 0 means latest.
    pub async fn get(&self, name: &str, revision: i64, include_deleted: bool) -> BackendResult<LogRows> {
        let sql = self.statements.get.sql(include_deleted);
        self.fetch_rows("get", sql, &[Bind::Str(name), Bind::Int(upper_bound(revision))])
            .await
    }

    /// Latest row per name under `prefix`, names ordered ascending, starting at `start_key`.
    pub async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        revision: i64,
        limit: i64,
        include_deleted: bool,
    ) -> BackendResult<LogRows> {
        let sql = with_limit(self.statements.list.sql(include_deleted), limit);
        let pattern = prefix_pattern(prefix);
        self.fetch_rows(
            "list",
            &sql,
            &[Bind::Str(&pattern), Bind::Str(start_key), Bind::Int(upper_bound(revision))],
        )
        .await
    }

    /// Number of live keys under `prefix`, with the current revision.
    pub async fn count(&self, prefix: &str) -> BackendResult<(i64, i64)> {
        let (pool, sql) = (&self.pool, self.statements.count.as_str());
        let pattern = prefix_pattern(prefix);
        let pattern = pattern.as_str();
        trace!("QUERY {} [{:?}]", stripped(sql), pattern);
        let (revision, count) = self
            .read("count", move || async move {
                let row = sqlx::query(sql).bind(pattern).fetch_one(pool).await?;
                Ok((row.try_get::<Option<i64>, _>(0)?, row.try_get::<i64, _>(1)?))
            })
            .await?;
        Ok((revision.unwrap_or(0), count))
    }

    /// Every row under `prefix` with a revision strictly greater than `revision`, in revision
    /// order. A limit of 0 returns everything.
    pub async fn after(&self, prefix: &str, revision: i64, limit: i64) -> BackendResult<LogRows> {
        let sql = with_limit(&self.statements.after, limit);
        let pattern = prefix_pattern(prefix);
        self.fetch_rows("after", &sql, &[Bind::Str(&pattern), Bind::Int(revision)])
            .await
    }

    /// Appends a row and returns its revision.
    ///
    /// Fails with [`BackendError::KeyExists`] when another row already supersedes the same
    /// `(name, prev_revision)`.
    pub async fn insert(&self, row: &InsertRow<'_>) -> BackendResult<i64> {
        trace!(
            "INSERT name={} created={} deleted={} create_revision={} prev_revision={} lease={}",
            row.name,
            row.created,
            row.deleted,
            row.create_revision,
            row.prev_revision,
            row.lease
        );
        let (pool, sql) = (&self.pool, self.statements.insert.as_str());
        let row = *row;

        if self.dialect.supports_returning() {
            self.write("insert", move || async move {
                let inserted = bind_insert(sqlx::query(sql), &row).fetch_one(pool).await?;
                inserted.try_get::<i64, _>(0)
            })
            .await
        } else {
            let result = self
                .write("insert", move || async move {
                    bind_insert(sqlx::query(sql), &row).execute(pool).await
                })
                .await?;
            result.last_insert_id().ok_or_else(|| {
                BackendError::Sqlx(sqlx::Error::Protocol(
                    "insert did not report a row id".to_string(),
                ))
            })
        }
    }

    /// Inserts a placeholder row at `revision` so the log has no hole there.
    pub async fn fill(&self, revision: i64) -> BackendResult<()> {
        let (pool, sql) = (&self.pool, self.statements.fill.as_str());
        let name = format!("{}{}", FILL_PREFIX, revision);
        let name = name.as_str();
        let empty: &[u8] = &[];
        self.write("fill", move || async move {
            sqlx::query(sql)
                .bind(revision)
                .bind(name)
                .bind(0_i64)
                .bind(1_i64)
                .bind(0_i64)
                .bind(0_i64)
                .bind(0_i64)
                .bind(empty)
                .bind(empty)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Removes a single row by revision.
    pub async fn delete_revision(&self, revision: i64) -> BackendResult<()> {
        let (pool, sql) = (&self.pool, self.statements.delete_revision.as_str());
        self.write("delete_revision", move || async move {
            sqlx::query(sql).bind(revision).execute(pool).await
        })
        .await?;
        Ok(())
    }

    /// Makes sure exactly one compact bookkeeping row exists.
    ///
    /// A missing row is inserted. Duplicates, left behind by concurrent first starts, are
    /// collapsed onto the one carrying the highest compacted revision.
    pub async fn ensure_compact_key(&self) -> BackendResult<()> {
        let (pool, sql) = (&self.pool, self.statements.compact_keys.as_str());
        let rows = self
            .read("compact_keys", move || async move {
                sqlx::query(sql).fetch_all(pool).await
            })
            .await?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            keys.push((
                row.try_get::<i64, _>(0)?,
                row.try_get::<Option<i64>, _>(1)?.unwrap_or(0),
            ));
        }

        if keys.is_empty() {
            let row = InsertRow {
                name: COMPACT_REV_KEY,
                created: true,
                deleted: false,
                create_revision: 0,
                prev_revision: 0,
                lease: 0,
                value: &[],
                old_value: &[],
            };
            return match self.insert(&row).await {
                Ok(revision) => {
                    debug!("Created compact revision row at revision {}", revision);
                    Ok(())
                }
                // Another process got there first.
                Err(BackendError::KeyExists) => Ok(()),
                Err(e) => Err(e),
            };
        }

        if keys.len() > 1 {
            let keep = keys
                .iter()
                .max_by_key(|(id, prev)| (*prev, *id))
                .map(|(id, _)| *id)
                .unwrap_or_default();
            for (id, _) in keys.iter().filter(|(id, _)| *id != keep) {
                warn!("Removing duplicate compact revision row at revision {}", id);
                self.delete_revision(*id).await?;
            }
        }
        Ok(())
    }

    /// Deletes superseded rows and tombstones up to `target`, in one transaction.
    ///
    /// The target is clamped so that at least `min_retain` revisions stay below the current
    /// revision. When `expected_compact` is set and the stored compact revision differs, another
    /// compactor has moved and the step is skipped.
    pub async fn compact(
        &self,
        expected_compact: Option<i64>,
        target: i64,
        min_retain: i64,
    ) -> BackendResult<CompactOutcome> {
        let _guard = match &self.write_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let result = self.compact_in_tx(expected_compact, target, min_retain).await;
        result.map_err(|e| match self.dialect.classify(&e) {
            ErrorClass::Busy | ErrorClass::Unavailable => BackendError::Unavailable {
                attempts: 1,
                source: e,
            },
            _ => e.into(),
        })
    }

    async fn compact_in_tx(
        &self,
        expected_compact: Option<i64>,
        target: i64,
        min_retain: i64,
    ) -> Result<CompactOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let current_revision = sqlx::query_scalar::<_, Option<i64>>(&self.statements.current_revision)
            .fetch_one(&mut *tx)
            .await?
            .unwrap_or(0);
        let compact_revision = sqlx::query_scalar::<_, Option<i64>>(&self.statements.compact_revision)
            .fetch_one(&mut *tx)
            .await?
            .unwrap_or(0);

        if expected_compact.is_some_and(|expected| expected != compact_revision) {
            debug!(
                "Compact revision changed underneath us: expected={:?} found={}",
                expected_compact, compact_revision
            );
            return Ok(CompactOutcome::Skipped {
                compact_revision,
                current_revision,
            });
        }

        let target = safe_compact_rev(target, current_revision, min_retain);
        if target <= compact_revision {
            return Ok(CompactOutcome::Skipped {
                compact_revision,
                current_revision,
            });
        }

        let deleted_rows = sqlx::query(&self.statements.compact)
            .bind(target)
            .bind(target)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(&self.statements.update_compact)
            .bind(target)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(
            "Compacted to revision {}: deleted {} rows, current revision {}",
            target, deleted_rows, current_revision
        );
        Ok(CompactOutcome::Compacted {
            compact_revision: target,
            current_revision,
            deleted_rows,
        })
    }

    /// Approximate on-disk size of the log in bytes.
    pub async fn size(&self) -> BackendResult<i64> {
        let (pool, sql) = (&self.pool, self.statements.size.as_str());
        let size = self
            .read("size", move || async move {
                sqlx::query_scalar::<_, Option<i64>>(sql).fetch_one(pool).await
            })
            .await?;
        Ok(size.unwrap_or(0))
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Storage backend closed");
    }
}

#[derive(Clone, Copy, Debug)]
enum Bind<'a> {
    Str(&'a str),
    Int(i64),
}

fn upper_bound(revision: i64) -> i64 {
    if revision <= 0 {
        i64::MAX
    } else {
        revision
    }
}

fn with_limit(sql: &str, limit: i64) -> String {
    if limit > 0 {
        format!("{} LIMIT {}", sql, limit)
    } else {
        sql.to_string()
    }
}

type AnyQuery<'q> = sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>;

fn bind_insert<'q>(query: AnyQuery<'q>, row: &InsertRow<'q>) -> AnyQuery<'q> {
    query
        .bind(row.name)
        .bind(row.created as i64)
        .bind(row.deleted as i64)
        .bind(row.create_revision)
        .bind(row.prev_revision)
        .bind(row.lease)
        .bind(row.value)
        .bind(row.old_value)
}

fn retryable(class: ErrorClass, read: bool) -> bool {
    match class {
        ErrorClass::Busy => true,
        ErrorClass::Unavailable => read,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open(temp_dir: &TempDir) -> Arc<Backend> {
        let config = BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        Backend::open(config).await.unwrap()
    }

    fn put<'a>(name: &'a str, prev_revision: i64, value: &'a [u8]) -> InsertRow<'a> {
        InsertRow {
            name,
            created: prev_revision == 0,
            deleted: false,
            create_revision: 0,
            prev_revision,
            lease: 0,
            value,
            old_value: &[],
        }
    }

    #[tokio::test]
    async fn test_backend_creation() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        assert_eq!(backend.dialect(), Dialect::Sqlite);
        assert_eq!(backend.current_revision().await.unwrap(), 0);
        assert!(temp_dir.path().join("state.db").exists());
        assert!(backend.size().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        {
            let backend = open(&temp_dir).await;
            backend.insert(&put("/a", 0, b"1")).await.unwrap();
            backend.bootstrap().await.unwrap();
            backend.close().await;
        }

        let backend = open(&temp_dir).await;
        assert_eq!(backend.current_revision().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_revisions() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        let r1 = backend.insert(&put("/a", 0, b"1")).await.unwrap();
        let r2 = backend.insert(&put("/b", 0, b"2")).await.unwrap();
        let r3 = backend.insert(&put("/a", r1, b"3")).await.unwrap();
        assert!(r1 < r2 && r2 < r3);
        assert_eq!(backend.current_revision().await.unwrap(), r3);
    }

    #[tokio::test]
    async fn test_unique_predecessor() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        let r1 = backend.insert(&put("/a", 0, b"1")).await.unwrap();
        backend.insert(&put("/a", r1, b"2")).await.unwrap();

        let err = backend.insert(&put("/a", r1, b"3")).await.unwrap_err();
        assert!(matches!(err, BackendError::KeyExists));

        let err = backend.insert(&put("/a", 0, b"again")).await.unwrap_err();
        assert!(matches!(err, BackendError::KeyExists));
    }

    #[tokio::test]
    async fn test_get_latest_and_historical() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        let r1 = backend.insert(&put("/a", 0, b"1")).await.unwrap();
        let r2 = backend.insert(&put("/a", r1, b"2")).await.unwrap();

        let latest = backend.get("/a", 0, false).await.unwrap();
        assert_eq!(latest.revision, r2);
        assert_eq!(latest.rows.len(), 1);
        assert_eq!(latest.rows[0].value, b"2");
        assert_eq!(latest.rows[0].prev_revision, r1);

        let old = backend.get("/a", r1, false).await.unwrap();
        assert_eq!(old.rows[0].id, r1);
        assert_eq!(old.rows[0].value, b"1");

        assert!(backend.get("/missing", 0, false).await.unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn test_list_escapes_like_metacharacters() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        backend.insert(&put("/a_b/1", 0, b"x")).await.unwrap();
        backend.insert(&put("/axb/1", 0, b"x")).await.unwrap();
        backend.insert(&put("/A_b/1", 0, b"x")).await.unwrap();

        let rows = backend.list("/a_b/", "", 0, 0, false).await.unwrap();
        let names: Vec<_> = rows.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["/a_b/1"]);
    }

    #[tokio::test]
    async fn test_list_limit_and_start_key() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        for name in ["/k/c", "/k/a", "/k/b", "/other"] {
            backend.insert(&put(name, 0, b"v")).await.unwrap();
        }

        let rows = backend.list("/k/", "", 0, 2, false).await.unwrap();
        let names: Vec<_> = rows.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["/k/a", "/k/b"]);

        let rows = backend.list("/k/", "/k/b", 0, 0, false).await.unwrap();
        let names: Vec<_> = rows.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["/k/b", "/k/c"]);
    }

    #[tokio::test]
    async fn test_count_excludes_tombstones() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        backend.insert(&put("/c/1", 0, b"v")).await.unwrap();
        let r2 = backend.insert(&put("/c/2", 0, b"v")).await.unwrap();
        let tombstone = InsertRow {
            deleted: true,
            created: false,
            create_revision: r2,
            ..put("/c/2", r2, b"v")
        };
        let r3 = backend.insert(&tombstone).await.unwrap();

        assert_eq!(backend.count("/c/").await.unwrap(), (r3, 1));
    }

    #[tokio::test]
    async fn test_after_returns_rows_in_revision_order() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        let r1 = backend.insert(&put("/w/b", 0, b"1")).await.unwrap();
        let r2 = backend.insert(&put("/w/a", 0, b"2")).await.unwrap();
        backend.insert(&put("/x", 0, b"3")).await.unwrap();

        let rows = backend.after("/w/", 0, 0).await.unwrap();
        let ids: Vec<_> = rows.rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![r1, r2]);

        let rows = backend.after("/w/", r1, 0).await.unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(rows.rows[0].id, r2);
    }

    #[tokio::test]
    async fn test_fill_occupies_revision() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        backend.fill(5).await.unwrap();
        let rows = backend.after("", 0, 0).await.unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert!(rows.rows[0].is_fill());
        assert!(rows.rows[0].deleted);
        assert_eq!(rows.rows[0].id, 5);

        let next = backend.insert(&put("/a", 0, b"1")).await.unwrap();
        assert!(next > 5);
    }

    #[tokio::test]
    async fn test_ensure_compact_key_collapses_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        backend.ensure_compact_key().await.unwrap();
        backend.ensure_compact_key().await.unwrap();
        assert_eq!(backend.compact_revision().await.unwrap(), 0);

        // A second row with a different predecessor slips past the unique index.
        let stray = InsertRow {
            name: COMPACT_REV_KEY,
            created: false,
            deleted: false,
            create_revision: 0,
            prev_revision: 7,
            lease: 0,
            value: &[],
            old_value: &[],
        };
        backend.insert(&stray).await.unwrap();

        backend.ensure_compact_key().await.unwrap();
        let rows = backend.after(COMPACT_REV_KEY, 0, 0).await.unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(backend.compact_revision().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_compact_removes_superseded_rows() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;
        backend.ensure_compact_key().await.unwrap();

        let r1 = backend.insert(&put("/a", 0, b"1")).await.unwrap();
        let r2 = backend.insert(&put("/a", r1, b"2")).await.unwrap();
        let r3 = backend.insert(&put("/b", 0, b"1")).await.unwrap();

        let outcome = backend.compact(None, r3, 0).await.unwrap();
        assert_eq!(
            outcome,
            CompactOutcome::Compacted {
                compact_revision: r3,
                current_revision: r3,
                deleted_rows: 1,
            }
        );
        assert_eq!(backend.compact_revision().await.unwrap(), r3);
        assert!(backend.get("/a", r1, false).await.unwrap().rows.is_empty());
        assert_eq!(backend.get("/a", 0, false).await.unwrap().rows[0].id, r2);

        let again = backend.compact(None, r3, 0).await.unwrap();
        assert!(matches!(again, CompactOutcome::Skipped { compact_revision, .. } if compact_revision == r3));
    }

    #[tokio::test]
    async fn test_compact_skips_when_expectation_is_stale() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;
        backend.ensure_compact_key().await.unwrap();

        let r1 = backend.insert(&put("/a", 0, b"1")).await.unwrap();
        backend.insert(&put("/a", r1, b"2")).await.unwrap();

        let outcome = backend.compact(Some(42), r1, 0).await.unwrap();
        assert!(matches!(outcome, CompactOutcome::Skipped { .. }));
        assert_eq!(backend.get("/a", r1, false).await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn test_compact_respects_min_retain() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;
        backend.ensure_compact_key().await.unwrap();

        let mut prev = 0;
        for i in 0..10 {
            prev = backend
                .insert(&put("/a", prev, format!("{}", i).as_bytes()))
                .await
                .unwrap();
        }

        let outcome = backend.compact(None, prev, 5).await.unwrap();
        assert_eq!(outcome.compact_revision(), prev - 5);
    }

    #[tokio::test]
    async fn test_reads_retry_lost_connections() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir).await;

        let calls = std::sync::atomic::AtomicU32::new(0);
        let flaky = || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(7)
                }
            }
        };

        assert_eq!(backend.read("flaky", flaky).await.unwrap(), 7);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        calls.store(0, std::sync::atomic::Ordering::SeqCst);
        let err = backend.write("flaky", flaky).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable { attempts: 1, .. }));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
