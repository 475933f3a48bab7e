//! Store errors, split along the two families the engine cares about:
//! recoverable lookups (`NotFound`) versus everything that means the record
//! file can no longer be trusted.

use thiserror::Error;

use trustdb_core::record::{RecNum, RecordKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(RecNum),

    #[error("record {recnum}: requested type {expected}, got {got}")]
    TypeMismatch {
        recnum: RecNum,
        expected: RecordKind,
        got: RecordKind,
    },

    #[error("record file corrupted: {0}")]
    Corrupt(String),

    #[error("unknown schema version {0:?}")]
    Schema(String),

    #[error("no transaction is open")]
    NoTransaction,

    #[error("a transaction is already open")]
    NestedTransaction,

    #[error("record codec: {0}")]
    Codec(#[from] serde_cbor::Error),

    #[error("storage backend: {0}")]
    Backend(#[from] rocksdb::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
