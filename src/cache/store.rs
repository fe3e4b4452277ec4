//! Cache store backends.
//!
//! A backend holds opaque payloads keyed by [`CacheKey`]. It knows nothing
//! about invalidation; the dependency set is stored alongside the payload only
//! so an index can be rebuilt from a persistent backend.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;

use super::config::CacheConfig;
use super::deps::TableSet;
use super::error::StoreError;
use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";
const METRIC_CAPACITY_EVICT: &str = "ormcache_capacity_evict_total";

/// A stored read result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Bytes,
    pub dependencies: TableSet,
    pub created_at: OffsetDateTime,
    /// Invalidation clock value observed before the underlying read ran.
    pub stamp: u64,
}

/// Pluggable key/value backend.
///
/// Every operation must be atomic per key. Concurrent `set`s for one key may
/// resolve last-write-wins.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    /// Store `entry`, replacing any previous value for its key. Returns the
    /// key of an entry the backend dropped to make room, if any.
    fn set(&self, entry: CacheEntry) -> Result<Option<CacheKey>, StoreError>;

    fn delete(&self, key: &CacheKey) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

/// In-memory LRU backend split into independently locked shards.
pub struct MemoryStore {
    shards: Vec<Mutex<LruCache<CacheKey, CacheEntry>>>,
    ttl: Option<Duration>,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = config.shard_capacity();
        let shards = (0..config.shard_count())
            .map(|_| Mutex::new(LruCache::new(capacity)))
            .collect();
        Self {
            shards,
            ttl: config.entry_ttl(),
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<LruCache<CacheKey, CacheEntry>> {
        &self.shards[key.shard_hint() % self.shards.len()]
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl
            .is_some_and(|ttl| OffsetDateTime::now_utc() - entry.created_at > ttl)
    }

    /// Number of live entries across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| mutex_lock(shard, SOURCE, "len").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let mut shard = mutex_lock(self.shard(key), SOURCE, "get");
        let expired = match shard.get(key) {
            None => return Ok(None),
            Some(entry) => self.is_expired(entry),
        };
        if expired {
            shard.pop(key);
            return Ok(None);
        }
        Ok(shard.get(key).cloned())
    }

    fn set(&self, entry: CacheEntry) -> Result<Option<CacheKey>, StoreError> {
        let key = entry.key;
        let evicted = mutex_lock(self.shard(&key), SOURCE, "set")
            .push(key, entry)
            .map(|(evicted_key, _)| evicted_key)
            .filter(|evicted_key| *evicted_key != key);
        if evicted.is_some() {
            counter!(METRIC_CAPACITY_EVICT).increment(1);
        }
        Ok(evicted)
    }

    fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        mutex_lock(self.shard(key), SOURCE, "delete").pop(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        for shard in &self.shards {
            mutex_lock(shard, SOURCE, "clear").clear();
        }
        Ok(())
    }
}
