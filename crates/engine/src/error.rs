use thiserror::Error;

use crate::heap::Rid;

/// Errors surfaced by the index-management core. All mutation failures are
/// reported synchronously to the caller; none are swallowed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] storage::BufferPoolError),
    #[error("lock error: {0}")]
    Lock(#[from] txn::LockError),
    #[error("duplicate key {key} in unique index {index}")]
    DuplicateKey { index: String, key: String },
    #[error("index {0} already exists")]
    AlreadyExists(String),
    #[error("index {0} not found")]
    NotFound(String),
    #[error("table {0} not found")]
    TableNotFound(String),
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("table {table} already has clustered index {existing}")]
    ClusteredConflict { table: String, existing: String },
    #[error("invalid key type: {0}")]
    InvalidKeyType(String),
    #[error("invalid index descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("row {0:?} not found")]
    RowNotFound(Rid),
    #[error("index entry too large for a page")]
    EntryTooLarge,
    #[error("buffer pool exhausted")]
    PoolExhausted,
    #[error("corrupt page: {0}")]
    Corrupt(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
