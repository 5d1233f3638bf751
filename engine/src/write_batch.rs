use crate::Table;

/// One write inside an atomic [`crate::StorageEngine::write_batch`] call.
/// Borrows its payload so callers building a batch from already-owned
/// buffers don't need to clone them again.
#[derive(Debug, Clone)]
pub enum WriteOperation<'a> {
    /// Insert or overwrite `key` with `value` in `table`.
    Put {
        /// Destination table.
        table: Table,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: std::borrow::Cow<'a, [u8]>,
    },
    /// Remove `key` from `table`, if present.
    Delete {
        /// Destination table.
        table: Table,
        /// Key bytes.
        key: Vec<u8>,
    },
}

/// An owned, 'static write operation, used where the caller wants to buffer
/// ops before a batch boundary is known (e.g. accumulating the effects of a
/// transaction's sub-operations before the whole apply commits).
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert or overwrite `key` with `value` in `table`.
    Put {
        /// Destination table.
        table: Table,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove `key` from `table`, if present.
    Delete {
        /// Destination table.
        table: Table,
        /// Key bytes.
        key: Vec<u8>,
    },
}

impl WriteOp {
    /// Borrow this owned op as a [`WriteOperation`] suitable for
    /// [`crate::StorageEngine::write_batch`].
    pub fn as_operation(&self) -> WriteOperation<'_> {
        match *self {
            WriteOp::Put {
                table,
                ref key,
                ref value,
            } => WriteOperation::Put {
                table,
                key: key.clone(),
                value: std::borrow::Cow::Borrowed(value),
            },
            WriteOp::Delete { table, ref key } => WriteOperation::Delete {
                table,
                key: key.clone(),
            },
        }
    }
}
