use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::{error::EngineError, write_batch::WriteOperation, StorageEngine, Table};

/// An ordered in-memory [`StorageEngine`]. State does not survive a
/// restart; used for tests, single-process demos, and recovering a fresh
/// engine from a snapshot blob entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    tables: RwLock<HashMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryEngine {
    /// Create an empty engine with the given set of table names already
    /// registered.
    pub fn new(tables: &[Table]) -> Self {
        let mut map = HashMap::with_capacity(tables.len());
        for &table in tables {
            let _ignore = map.insert(table, BTreeMap::new());
        }
        Self {
            tables: RwLock::new(map),
        }
    }
}

/// Compute the exclusive upper bound for a `[start, end)` scan where an
/// empty `end` means "no upper bound".
fn end_bound(end: &[u8]) -> std::ops::Bound<Vec<u8>> {
    if end.is_empty() {
        std::ops::Bound::Unbounded
    } else {
        std::ops::Bound::Excluded(end.to_vec())
    }
}

impl StorageEngine for MemoryEngine {
    fn get(&self, table: Table, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, EngineError> {
        let tables = self.tables.read();
        let map = tables
            .get(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_owned()))?;
        Ok(map.get(key.as_ref()).cloned())
    }

    fn get_multi(
        &self,
        table: Table,
        keys: &[impl AsRef<[u8]>],
    ) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        let tables = self.tables.read();
        let map = tables
            .get(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_owned()))?;
        Ok(keys
            .iter()
            .map(|key| map.get(key.as_ref()).cloned())
            .collect())
    }

    fn scan(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let tables = self.tables.read();
        let map = tables
            .get(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_owned()))?;
        let range = (
            std::ops::Bound::Included(start.to_vec()),
            end_bound(end),
        );
        Ok(map
            .range(range)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn get_all(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let tables = self.tables.read();
        let map = tables
            .get(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_owned()))?;
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn write_batch(&self, ops: Vec<WriteOperation<'_>>) -> Result<(), EngineError> {
        let mut tables = self.tables.write();
        for op in ops {
            match op {
                WriteOperation::Put { table, key, value } => {
                    let map = tables
                        .get_mut(table)
                        .ok_or_else(|| EngineError::TableNotFound(table.to_owned()))?;
                    let _ignore = map.insert(key, value.into_owned());
                }
                WriteOperation::Delete { table, key } => {
                    let map = tables
                        .get_mut(table)
                        .ok_or_else(|| EngineError::TableNotFound(table.to_owned()))?;
                    let _ignore = map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn reset(&self) -> Result<(), EngineError> {
        let mut tables = self.tables.write();
        for map in tables.values_mut() {
            map.clear();
        }
        Ok(())
    }

    fn compact(&self, _table: Table, _until_key: &[u8]) -> Result<(), EngineError> {
        // The in-memory engine keeps no historical versions beyond what the
        // MVCC index already discards, so there is no physical work to do.
        Ok(())
    }
}
