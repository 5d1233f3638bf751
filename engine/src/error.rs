/// Errors surfaced by a [`crate::StorageEngine`] implementation. These are
/// I/O-level failures; anything that reaches a caller through this type is
/// treated as fatal by the apply loop (§7 of the design).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The requested table name is not one of the tables the engine opened.
    #[error("table not found: {0}")]
    TableNotFound(String),
    /// The underlying RocksDB instance reported an error.
    #[error("rocksdb error: {0}")]
    RocksDb(String),
    /// Failed to open or create the on-disk database.
    #[error("failed to open database at {path}: {source}")]
    Open {
        /// Directory the engine tried to open.
        path: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<rocksdb::Error> for EngineError {
    fn from(err: rocksdb::Error) -> Self {
        EngineError::RocksDb(err.to_string())
    }
}
