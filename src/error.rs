/// Low-level storage errors (RocksDB, serialization).
/// This is the error type for the persistent store — storage operations can
/// only fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Domain errors surfaced through the queue contract.
///
/// Capacity and codec errors are surfaced synchronously and never retried
/// inside the engine; retry policy belongs to the caller (or, for orphan
/// rescue, to the sweeper).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("operation not supported: {0}")]
    OperationNotSupported(&'static str),

    #[error("queue is full (max {max})")]
    QueueIsFull { max: usize },

    #[error("ephemeral store is full (max {max})")]
    EphemeralIsFull { max: usize },

    #[error("cannot serialize message: {0}")]
    CannotSerializeMessage(String),

    #[error("cannot deserialize message: {0}")]
    CannotDeserializeMessage(String),

    #[error("sweeper spawn failed: {0}")]
    SweeperSpawn(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type Result<T> = std::result::Result<T, QueueError>;
