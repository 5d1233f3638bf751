/// The reserved-key / table-name façade over a [`engine::StorageEngine`].
pub mod db;
/// In-memory per-key revision history backing point/range lookups.
pub mod index;
/// The apply engine for `Range`/`Put`/`DeleteRange`/`Txn` (§4.1, §4.2).
pub mod kv_store;
/// The lease subsystem: grant/revoke/renew and expiry-driven GC (§4.3).
pub mod lease_store;
