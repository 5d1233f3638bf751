use std::{path::PathBuf, time::Duration};

use getset::Getters;
use serde::{Deserialize, Serialize};

/// Which local store backend the engine should open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Ordered in-memory map; state is lost on restart. Used by tests and
    /// single-node demos.
    Memory,
    /// RocksDB-backed LSM store at `data_dir`.
    RocksDB {
        /// On-disk directory holding the column families.
        data_dir: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Timeouts governing the proposal submission / commit-wait round trip and
/// the watch slow-consumer grace period. Mirrors the defaults called out in
/// the design: 30s for proposal round trips, 5s for watch delivery.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct TimeoutConfig {
    /// Deadline for submitting a proposal to the consensus input channel.
    #[serde(with = "humantime_serde", default = "default_propose_timeout")]
    propose_timeout: Duration,
    /// Deadline for awaiting the commit/apply wakeup once proposed.
    #[serde(with = "humantime_serde", default = "default_commit_timeout")]
    commit_timeout: Duration,
    /// Grace period before a slow watch subscriber is forcibly cancelled.
    #[serde(with = "humantime_serde", default = "default_watch_timeout")]
    watch_send_timeout: Duration,
}

const fn default_propose_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_commit_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_watch_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            propose_timeout: default_propose_timeout(),
            commit_timeout: default_commit_timeout(),
            watch_send_timeout: default_watch_timeout(),
        }
    }
}

/// Tunables for the proposal batcher's adaptive sizing (§4.6).
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct BatchConfig {
    /// Smallest batch the batcher will flush on a timeout.
    #[serde(default = "default_min_batch_size")]
    min_batch_size: usize,
    /// Largest batch the batcher will accumulate before forcing a flush.
    #[serde(default = "default_max_batch_size")]
    max_batch_size: usize,
    /// Shortest flush timeout used under light load.
    #[serde(with = "humantime_serde", default = "default_min_flush_timeout")]
    min_flush_timeout: Duration,
    /// Longest flush timeout used under heavy load.
    #[serde(with = "humantime_serde", default = "default_max_flush_timeout")]
    max_flush_timeout: Duration,
    /// Pending-queue depth above which the batcher grows batch size /
    /// shrinks flush timeout.
    #[serde(default = "default_load_threshold")]
    load_threshold: usize,
}

const fn default_min_batch_size() -> usize {
    1
}

const fn default_max_batch_size() -> usize {
    128
}

const fn default_min_flush_timeout() -> Duration {
    Duration::from_millis(1)
}

const fn default_max_flush_timeout() -> Duration {
    Duration::from_millis(20)
}

const fn default_load_threshold() -> usize {
    64
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            min_flush_timeout: default_min_flush_timeout(),
            max_flush_timeout: default_max_flush_timeout(),
            load_threshold: default_load_threshold(),
        }
    }
}

/// Lease subsystem tunables (§4.3): the expiry ticker runs at a small
/// multiple of the smallest granted TTL, capped so it never becomes a busy
/// loop.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct LeaseConfig {
    /// Upper bound on the expiry-scan ticker interval.
    #[serde(with = "humantime_serde", default = "default_max_ticker_interval")]
    max_ticker_interval: Duration,
    /// Smallest ttl value accepted by `LeaseGrant` (clamped, not rejected).
    #[serde(default = "default_min_lease_ttl")]
    min_lease_ttl: i64,
    /// Largest ttl value accepted by `LeaseGrant`.
    #[serde(default = "default_max_lease_ttl")]
    max_lease_ttl: i64,
}

const fn default_max_ticker_interval() -> Duration {
    Duration::from_millis(500)
}

const fn default_min_lease_ttl() -> i64 {
    1
}

const fn default_max_lease_ttl() -> i64 {
    9_000_000_000
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_ticker_interval: default_max_ticker_interval(),
            min_lease_ttl: default_min_lease_ttl(),
            max_lease_ttl: default_max_lease_ttl(),
        }
    }
}

/// Linearizable-read tunables (§4.7): the leader-lease fast path trusts its
/// own clock for up to `lease_read_timeout` past the last confirmed
/// heartbeat, bounded by `clock_drift` so a fast local clock on a partitioned
/// leader can't keep serving stale reads past that window.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct ReadPathConfig {
    /// How often the leader refreshes its lease-read deadline.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    heartbeat_interval: Duration,
    /// Assumed upper bound on clock drift across the cluster; subtracted
    /// from the lease-read deadline for safety margin.
    #[serde(with = "humantime_serde", default = "default_clock_drift")]
    clock_drift: Duration,
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

const fn default_clock_drift() -> Duration {
    Duration::from_millis(10)
}

impl Default for ReadPathConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            clock_drift: default_clock_drift(),
        }
    }
}

/// Snapshot tunables (§4.8, §9 "Snapshot granularity"): the blob is streamed
/// as a sequence of chunks rather than one allocation, so a full-keyspace
/// snapshot doesn't require materializing the whole thing in memory at once.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct SnapshotConfig {
    /// Target size, in bytes, of one `SnapshotChunk`.
    #[serde(default = "default_snapshot_chunk_size")]
    chunk_size: usize,
}

const fn default_snapshot_chunk_size() -> usize {
    1 << 20
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_snapshot_chunk_size(),
        }
    }
}

/// Top level configuration for an engine instance. Front-end adapters parse
/// their own sections of the TOML file and pass this subset in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Getters, Serialize, Deserialize)]
#[getset(get = "pub")]
#[serde(default)]
pub struct EngineConfig {
    /// Local store selection.
    storage: StorageConfig,
    /// Proposal round-trip timeouts.
    timeout: TimeoutConfig,
    /// Proposal batcher tunables.
    batch: BatchConfig,
    /// Lease expiry tunables.
    lease: LeaseConfig,
    /// Linearizable-read tunables.
    read_path: ReadPathConfig,
    /// Snapshot chunking tunables.
    snapshot: SnapshotConfig,
    /// Default bound on a watch subscriber's event channel.
    #[serde(default = "default_watch_channel_size")]
    watch_channel_size: usize,
}

const fn default_watch_channel_size() -> usize {
    100
}

impl EngineConfig {
    /// Parse configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if `content` is not valid TOML or does not match the
    /// expected schema.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_memory_backed() {
        let cfg = EngineConfig::default();
        assert_eq!(*cfg.storage(), StorageConfig::Memory);
        assert_eq!(cfg.watch_channel_size, 100);
        assert_eq!(cfg.read_path().clock_drift, Duration::from_millis(10));
        assert_eq!(cfg.snapshot().chunk_size, 1 << 20);
    }

    #[test]
    fn parses_rocksdb_backend_from_toml() {
        let toml = r#"
            watch_channel_size = 256

            [storage]
            engine = "rocksdb"
            data_dir = "/var/lib/store/data"
        "#;
        let cfg = EngineConfig::from_toml(toml).expect("valid config");
        assert_eq!(cfg.watch_channel_size, 256);
        match cfg.storage() {
            StorageConfig::RocksDB { data_dir } => {
                assert_eq!(data_dir, &PathBuf::from("/var/lib/store/data"));
            }
            StorageConfig::Memory => panic!("expected rocksdb backend"),
        }
    }
}
