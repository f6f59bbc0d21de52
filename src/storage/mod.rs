//! Storage engine module providing MVCC (Multi-Version Concurrency Control) semantics on top of
//! an ordinary relational database.
//!
//! All state lives in one append-only table. Each write is a row whose auto-assigned id is the
//! global revision, so the database itself provides ordering and atomicity:
//!
//! 1. **Linearizable writes**: compare-and-swap is an insert guarded by a unique index on
//!    `(name, prev_revision)`
//! 2. **Point-in-time reads**: the latest row per name at or below any retained revision
//! 3. **Change feed**: a poll loop tails the table and fans new rows out to watchers
//! 4. **Compaction**: superseded rows and tombstones are deleted in bounded batches
//!
//! Layers, bottom up: [`dialect`] (SQL text per engine), [`backend`] (pool, statements,
//! retries), [`log`] (events, polling, gap handling), [`mvcc`] (key-value semantics) and
//! [`compaction`] (background reclamation).

pub mod backend;
pub mod compaction;
pub mod dialect;
pub mod log;
pub mod mvcc;

pub use backend::{
    Backend, BackendConfig, BackendError, BackendResult, CompactOutcome, PoolConfig, TlsConfig,
};
pub use compaction::{Compactor, CompactorConfig};
pub use dialect::Dialect;
pub use log::{LogConfig, SqlLog};
pub use mvcc::{Event, EventType, KeyValue, MvccStore, RangeResult, WatchStream};

use thiserror::Error;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(BackendError),

    #[error("Key exists")]
    KeyExists,

    #[error("Revision conflict on {key}: expected {expected}, current {current}")]
    Conflict {
        key: String,
        expected: i64,
        current: i64,
    },

    #[error("Key not found")]
    NotFound,

    #[error("Required revision {requested} has been compacted (compact revision {compact_revision})")]
    Compacted {
        requested: i64,
        compact_revision: i64,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Fatal storage error: {0}")]
    Fatal(String),
}

impl From<BackendError> for StorageError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::KeyExists => StorageError::KeyExists,
            BackendError::Unavailable { .. } => StorageError::Unavailable(err.to_string()),
            BackendError::Bootstrap(_) | BackendError::ConfigError(_) => {
                StorageError::Fatal(err.to_string())
            }
            other => StorageError::Backend(other),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
