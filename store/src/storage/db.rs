use std::sync::Arc;

use engine::{StorageEngine, Table, WriteOp, WriteOperation};

use crate::error::FatalError;

/// Table storing `kv:`-prefixed [`crate::rpc::KeyValue`] records, keyed by
/// the encoded [`crate::revision::Revision`] that created them (§6.3).
pub const KV_TABLE: Table = "kv";
/// Table storing `lease:<id>` records (§6.3).
pub const LEASE_TABLE: Table = "lease";
/// Table storing the two reserved scalars: current revision and compacted
/// revision (§6.3). A dedicated table rather than a prefix inside `kv:`
/// keeps a full-table scan of `KV_TABLE` free of bookkeeping rows.
pub const META_TABLE: Table = "meta";

/// Reserved key for the current MVCC revision.
pub const META_REVISION_KEY: &[u8] = b"meta:revision";
/// Reserved key for the compacted revision.
pub const META_COMPACTED_REVISION_KEY: &[u8] = b"meta:compacted_revision";

/// The fixed set of tables every backend opens.
pub const TABLES: &[Table] = &[KV_TABLE, LEASE_TABLE, META_TABLE];

/// Thin façade over a [`StorageEngine`] that understands the core's table
/// layout and reserved keys, so the kv store, lease store and snapshotter
/// don't each re-derive table names and meta-key encodings.
#[derive(Debug)]
pub struct Db<E> {
    engine: Arc<E>,
}

impl<E: StorageEngine> Db<E> {
    /// Wrap an already-open engine.
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// Read the persisted revision counter, defaulting to 0 for a fresh
    /// store.
    pub fn load_revision(&self) -> Result<i64, FatalError> {
        Ok(self
            .engine
            .get(META_TABLE, META_REVISION_KEY)?
            .map(|bytes| decode_i64(&bytes))
            .unwrap_or(0))
    }

    /// Read the persisted compacted revision, defaulting to 0.
    pub fn load_compacted_revision(&self) -> Result<i64, FatalError> {
        Ok(self
            .engine
            .get(META_TABLE, META_COMPACTED_REVISION_KEY)?
            .map(|bytes| decode_i64(&bytes))
            .unwrap_or(0))
    }

    /// Apply a batch of writes atomically, optionally also persisting the
    /// new revision and/or compacted revision in the same batch so a crash
    /// can never observe data writes without the revision bump that
    /// produced them, or vice versa.
    pub fn commit(
        &self,
        ops: Vec<WriteOp>,
        new_revision: Option<i64>,
        new_compacted_revision: Option<i64>,
    ) -> Result<(), FatalError> {
        let mut batch: Vec<WriteOperation<'_>> = ops.iter().map(WriteOp::as_operation).collect();
        if let Some(rev) = new_revision {
            batch.push(WriteOperation::Put {
                table: META_TABLE,
                key: META_REVISION_KEY.to_vec(),
                value: std::borrow::Cow::Owned(encode_i64(rev)),
            });
        }
        if let Some(rev) = new_compacted_revision {
            batch.push(WriteOperation::Put {
                table: META_TABLE,
                key: META_COMPACTED_REVISION_KEY.to_vec(),
                value: std::borrow::Cow::Owned(encode_i64(rev)),
            });
        }
        self.engine.write_batch(batch)?;
        Ok(())
    }

    /// Access the underlying engine directly, for range scans and point
    /// lookups that don't need the meta-key bookkeeping above.
    pub fn engine(&self) -> &E {
        &self.engine
    }
}

/// Encode an `i64` as big-endian bytes, sortable and fixed-width.
pub fn encode_i64(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn decode_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0_u8; 8];
    let len = bytes.len().min(8);
    buf[8 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    i64::from_be_bytes(buf)
}
