//! Local store contract (§4.9 of the design): point `get`, ordered range
//! iteration, an atomic write batch, and a best-effort native compaction
//! hook. Everything above this boundary — revisions, leases, transactions,
//! watches — is backend agnostic; this crate only knows about bytes and
//! table names.

mod error;
mod memory;
mod rocks;
mod write_batch;

pub use error::EngineError;
pub use memory::MemoryEngine;
pub use rocks::RocksEngine;
pub use write_batch::{WriteOp, WriteOperation};

/// A table (RocksDB: column family; memory: namespace prefix) the engine
/// organizes keys under. The core always opens the same fixed set of tables;
/// the trait does not support creating new ones at runtime.
pub type Table = &'static str;

/// Polymorphic local store: an ordered key-value map with atomic batched
/// writes and a compaction hook, implemented either by [`MemoryEngine`] (an
/// ordered in-memory map, used in tests and single-process demos) or
/// [`RocksEngine`] (a real LSM tree, used in production).
pub trait StorageEngine: Send + Sync + std::fmt::Debug + 'static {
    /// Look up a single key in `table`.
    ///
    /// # Errors
    /// Returns an error if the underlying storage I/O fails.
    fn get(&self, table: Table, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, EngineError>;

    /// Look up several keys in `table` in one round trip, preserving the
    /// order of `keys` and returning `None` for keys that are absent.
    ///
    /// # Errors
    /// Returns an error if the underlying storage I/O fails.
    fn get_multi(
        &self,
        table: Table,
        keys: &[impl AsRef<[u8]>],
    ) -> Result<Vec<Option<Vec<u8>>>, EngineError>;

    /// Iterate `table` in key order over `[start, end)`. An empty `end`
    /// means "to the end of the table".
    ///
    /// # Errors
    /// Returns an error if the underlying storage I/O fails.
    fn scan(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError>;

    /// Return every key-value pair in `table`, in key order.
    ///
    /// # Errors
    /// Returns an error if the underlying storage I/O fails.
    fn get_all(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError>;

    /// Apply a batch of writes atomically: either all operations become
    /// visible or none do.
    ///
    /// # Errors
    /// Returns an error if the underlying storage I/O fails.
    fn write_batch(&self, ops: Vec<WriteOperation<'_>>) -> Result<(), EngineError>;

    /// Drop every key in every table, resetting the engine to empty. Used
    /// when restoring from a full snapshot (§4.8).
    ///
    /// # Errors
    /// Returns an error if the underlying storage I/O fails.
    fn reset(&self) -> Result<(), EngineError>;

    /// Request native compaction of the underlying storage below `until_key`
    /// in `table`. Best-effort: backends that have no notion of physical
    /// compaction (e.g. the in-memory engine) treat this as a no-op.
    ///
    /// # Errors
    /// Returns an error if the compaction request itself fails to submit.
    fn compact(&self, table: Table, until_key: &[u8]) -> Result<(), EngineError>;
}
