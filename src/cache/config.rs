//! Engine tunables.
//!
//! Deserialized from the `[cache]` table of `ormcache.toml`; every field has a
//! default so an empty table is valid.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_SHARDS: usize = 16;

/// Visibility model of the transactions the cache runs alongside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionIsolation {
    /// Each statement sees everything committed before it started.
    #[default]
    ReadCommitted,
    /// Every statement in a transaction sees the snapshot taken at `BEGIN`.
    RepeatableRead,
}

/// Cache engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. When off every read executes and nothing is stored.
    pub enabled: bool,
    /// Capacity of the in-memory backend across all shards.
    pub max_entries: usize,
    /// Number of independently locked shards in the in-memory backend.
    pub shards: usize,
    /// Optional time-to-live for stored entries.
    pub entry_ttl_seconds: Option<u64>,
    /// Isolation level of the database transactions.
    pub isolation: TransactionIsolation,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            shards: DEFAULT_SHARDS,
            entry_ttl_seconds: None,
            isolation: TransactionIsolation::default(),
        }
    }
}

impl CacheConfig {
    /// Shard count, clamped to at least one.
    pub fn shard_count(&self) -> usize {
        self.shards.max(1)
    }

    /// Per-shard capacity; the total is split evenly and rounded up.
    pub fn shard_capacity(&self) -> NonZeroUsize {
        let per_shard = self.max_entries.div_ceil(self.shard_count());
        NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_ttl_seconds.map(Duration::from_secs)
    }
}
