//! Shared, dependency-light utilities used across the metadata store crates.

/// Static configuration loaded at process startup (storage backend, cluster
/// membership, timeouts). Parsing only; process lifecycle stays outside this
/// crate's scope.
pub mod config;

/// Tracing/telemetry bootstrap shared by every binary that embeds the core.
#[cfg(feature = "tokio")]
pub mod trace;

/// Parking-lot based synchronization helpers, gated the same way the rest of
/// the workspace gates its lock implementation choice.
#[cfg(feature = "parking_lot")]
pub mod lock;
