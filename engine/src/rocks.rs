use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatchWithTransaction, DB};

use crate::{error::EngineError, write_batch::WriteOperation, StorageEngine, Table};

/// RocksDB-backed [`StorageEngine`]. Each logical table is a column family;
/// writes go through a single `WriteBatch` so a multi-table mutation (e.g. a
/// key write plus the lease record it attaches to) commits atomically.
#[derive(Debug)]
pub struct RocksEngine {
    db: DB,
}

impl RocksEngine {
    /// Open (creating if necessary) a RocksDB instance at `path` with one
    /// column family per entry in `tables`.
    ///
    /// # Errors
    /// Returns an error if RocksDB fails to open the database directory.
    pub fn open(path: impl AsRef<Path>, tables: &[Table]) -> Result<Self, EngineError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cfs: Vec<ColumnFamilyDescriptor> = tables
            .iter()
            .map(|&table| ColumnFamilyDescriptor::new(table, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &path, cfs).map_err(|source| {
            EngineError::Open {
                path: path.as_ref().display().to_string(),
                source: Box::new(source),
            }
        })?;
        Ok(Self { db })
    }

    fn cf(&self, table: Table) -> Result<&rocksdb::ColumnFamily, EngineError> {
        self.db
            .cf_handle(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_owned()))
    }
}

impl StorageEngine for RocksEngine {
    fn get(&self, table: Table, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, EngineError> {
        let cf = self.cf(table)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    fn get_multi(
        &self,
        table: Table,
        keys: &[impl AsRef<[u8]>],
    ) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        let cf = self.cf(table)?;
        keys.iter()
            .map(|key| self.db.get_cf(cf, key).map_err(EngineError::from))
            .collect()
    }

    fn scan(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let cf = self.cf(table)?;
        let mode = IteratorMode::From(start, rocksdb::Direction::Forward);
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, mode) {
            let (key, value) = item?;
            if !end.is_empty() && key.as_ref() >= end {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn get_all(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let cf = self.cf(table)?;
        self.db
            .iterator_cf(cf, IteratorMode::Start)
            .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(EngineError::from))
            .collect()
    }

    fn write_batch(&self, ops: Vec<WriteOperation<'_>>) -> Result<(), EngineError> {
        let mut batch: WriteBatchWithTransaction<false> = WriteBatchWithTransaction::default();
        for op in ops {
            match op {
                WriteOperation::Put { table, key, value } => {
                    let cf = self.cf(table)?;
                    batch.put_cf(cf, key, value);
                }
                WriteOperation::Delete { table, key } => {
                    let cf = self.cf(table)?;
                    batch.delete_cf(cf, key);
                }
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn reset(&self) -> Result<(), EngineError> {
        for table in self.db.cf_names() {
            let cf = self
                .db
                .cf_handle(&table)
                .ok_or_else(|| EngineError::TableNotFound(table.clone()))?;
            let mut batch: WriteBatchWithTransaction<false> = WriteBatchWithTransaction::default();
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
            self.db.write(batch)?;
        }
        Ok(())
    }

    fn compact(&self, table: Table, until_key: &[u8]) -> Result<(), EngineError> {
        let cf = self.cf(table)?;
        let end = if until_key.is_empty() {
            None
        } else {
            Some(until_key)
        };
        self.db.compact_range_cf(cf, None::<&[u8]>, end);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Table = "kv";

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RocksEngine::open(dir.path(), &[T]).unwrap();
        engine
            .write_batch(vec![WriteOperation::Put {
                table: T,
                key: b"foo".to_vec(),
                value: std::borrow::Cow::Borrowed(b"bar"),
            }])
            .unwrap();
        assert_eq!(engine.get(T, b"foo").unwrap(), Some(b"bar".to_vec()));
    }

    #[test]
    fn scan_respects_half_open_range() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RocksEngine::open(dir.path(), &[T]).unwrap();
        engine
            .write_batch(vec![
                WriteOperation::Put {
                    table: T,
                    key: b"a".to_vec(),
                    value: std::borrow::Cow::Borrowed(b"1"),
                },
                WriteOperation::Put {
                    table: T,
                    key: b"b".to_vec(),
                    value: std::borrow::Cow::Borrowed(b"2"),
                },
                WriteOperation::Put {
                    table: T,
                    key: b"c".to_vec(),
                    value: std::borrow::Cow::Borrowed(b"3"),
                },
            ])
            .unwrap();
        let got = engine.scan(T, b"a", b"c").unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn reopen_recovers_previously_written_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = RocksEngine::open(dir.path(), &[T]).unwrap();
            engine
                .write_batch(vec![WriteOperation::Put {
                    table: T,
                    key: b"k".to_vec(),
                    value: std::borrow::Cow::Borrowed(b"v"),
                }])
                .unwrap();
        }
        let engine = RocksEngine::open(dir.path(), &[T]).unwrap();
        assert_eq!(engine.get(T, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
