//! Invalidation index.
//!
//! Tracks table → cache keys (and the reverse) so a write to a table can evict
//! every stored result that read from it.
//!
//! Each table owns a slot behind its own mutex; unrelated tables never contend.
//! A monotonic invalidation clock orders evictions against in-flight reads:
//! a read takes a [`Stamp`] before touching the database, and its result is
//! only stored if none of its tables has been invalidated since. Registration
//! and eviction of a table serialize on that table's slot, so an
//! evict/register race always ends evicted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use super::deps::{TableRef, TableSet};
use super::error::{CacheError, StoreError};
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::store::{CacheEntry, CacheStore};

const SOURCE: &str = "cache::registry";
const METRIC_INDEXED_KEYS: &str = "ormcache_indexed_keys";
const METRIC_INVALIDATED_KEYS: &str = "ormcache_invalidated_keys_total";
const METRIC_REGISTER_RACE: &str = "ormcache_register_race_total";
const METRIC_BACKEND_ERROR: &str = "ormcache_backend_error_total";

/// Invalidation clock reading taken before an underlying read executes.
pub type Stamp = u64;

#[derive(Default)]
struct TableSlot {
    keys: HashSet<CacheKey>,
    /// Clock value of the most recent eviction of this table.
    invalidated_at: Stamp,
}

/// Result of [`InvalidationIndex::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Entry written to the backend and indexed.
    Stored,
    /// A dependent table was invalidated after the stamp; nothing stored.
    Raced,
    /// The backend refused the write; nothing indexed.
    BackendFailed(StoreError),
}

pub struct InvalidationIndex {
    store: Arc<dyn CacheStore>,
    clock: AtomicU64,
    /// Clock value of the most recent full flush.
    flushed_at: AtomicU64,
    /// Clock value of the most recent flush per database alias.
    database_flushes: DashMap<String, Stamp>,
    tables: DashMap<TableRef, Arc<Mutex<TableSlot>>>,
    keys: DashMap<CacheKey, TableSet>,
    degraded: AtomicBool,
}

impl InvalidationIndex {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            clock: AtomicU64::new(0),
            flushed_at: AtomicU64::new(0),
            database_flushes: DashMap::new(),
            tables: DashMap::new(),
            keys: DashMap::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Current clock reading. Take it before executing the read it guards.
    pub fn stamp(&self) -> Stamp {
        self.clock.load(Ordering::SeqCst)
    }

    fn tick(&self) -> Stamp {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn slot(&self, table: &TableRef) -> Arc<Mutex<TableSlot>> {
        self.tables.entry(table.clone()).or_default().clone()
    }

    /// Lock the slots of `tables` in their sorted order.
    fn lock_all<'a>(
        slots: &'a [Arc<Mutex<TableSlot>>],
        op: &'static str,
    ) -> Vec<MutexGuard<'a, TableSlot>> {
        slots.iter().map(|slot| mutex_lock(slot, SOURCE, op)).collect()
    }

    fn flushed_after(&self, table: &TableRef, stamp: Stamp) -> bool {
        if self.flushed_at.load(Ordering::SeqCst) > stamp {
            return true;
        }
        self.database_flushes
            .get(&table.database)
            .is_some_and(|marker| *marker > stamp)
    }

    /// Write `entry` to the backend and index it under its dependencies.
    ///
    /// Refused when any dependency was invalidated after `entry.stamp`: the
    /// result may predate that write.
    pub fn register(&self, entry: CacheEntry) -> RegisterOutcome {
        let key = entry.key;
        let tables = entry.dependencies.clone();
        let slots: Vec<_> = tables.iter().map(|table| self.slot(table)).collect();

        let evicted = {
            let mut guards = Self::lock_all(&slots, "register");

            let raced = self.degraded.load(Ordering::SeqCst)
                || tables.iter().zip(guards.iter()).any(|(table, guard)| {
                    guard.invalidated_at > entry.stamp || self.flushed_after(table, entry.stamp)
                });
            if raced {
                counter!(METRIC_REGISTER_RACE).increment(1);
                debug!(cache_key = %key, stamp = entry.stamp, "Registration lost to invalidation");
                return RegisterOutcome::Raced;
            }

            let evicted = match self.store.set(entry) {
                Ok(evicted) => evicted,
                Err(err) => {
                    counter!(METRIC_BACKEND_ERROR, "op" => "set").increment(1);
                    warn!(cache_key = %key, error = %err, "Cache backend rejected write");
                    return RegisterOutcome::BackendFailed(err);
                }
            };

            for guard in guards.iter_mut() {
                guard.keys.insert(key);
            }
            self.keys.insert(key, tables);
            evicted
        };

        if let Some(evicted) = evicted {
            self.prune(&evicted);
        }
        gauge!(METRIC_INDEXED_KEYS).set(self.keys.len() as f64);
        RegisterOutcome::Stored
    }

    /// Evict every entry depending on `table` from the index and the backend.
    ///
    /// Safe to call repeatedly; a second call finds nothing left to evict.
    pub fn evict(&self, table: &TableRef) -> HashSet<CacheKey> {
        let slot = self.slot(table);
        let evicted = {
            let mut guard = mutex_lock(&slot, SOURCE, "evict");
            guard.invalidated_at = self.tick();
            let evicted: HashSet<CacheKey> = guard.keys.drain().collect();
            self.delete_keys(&evicted);
            evicted
        };

        for key in &evicted {
            self.prune(key);
        }
        if !evicted.is_empty() {
            counter!(METRIC_INVALIDATED_KEYS).increment(evicted.len() as u64);
        }
        gauge!(METRIC_INDEXED_KEYS).set(self.keys.len() as f64);
        debug!(table = %table, evicted = evicted.len(), "Table invalidated");
        evicted
    }

    /// Evict every entry of one database alias.
    pub fn evict_database(&self, database: &str) -> HashSet<CacheKey> {
        let marker = self.tick();
        self.database_flushes
            .entry(database.to_string())
            .and_modify(|current| *current = (*current).max(marker))
            .or_insert(marker);

        let tables: Vec<TableRef> = self
            .tables
            .iter()
            .filter(|slot| slot.key().database == database)
            .map(|slot| slot.key().clone())
            .collect();

        let mut evicted = HashSet::new();
        for table in &tables {
            evicted.extend(self.evict(table));
        }
        info!(database, evicted = evicted.len(), "Database cache invalidated");
        evicted
    }

    /// Drop everything from the backend and the index.
    ///
    /// Holds every known slot while clearing, so a registration that passed
    /// its check before the flush has finished writing by the time the
    /// backend is cleared. Slots created after the flush marker was set
    /// reject reads stamped before it.
    pub fn evict_all(&self) -> Result<(), CacheError> {
        let marker = self.tick();
        self.flushed_at.fetch_max(marker, Ordering::SeqCst);

        let mut known: Vec<_> = self
            .tables
            .iter()
            .map(|slot| (slot.key().clone(), slot.value().clone()))
            .collect();
        known.sort_by(|(left, _), (right, _)| left.cmp(right));
        let slots: Vec<_> = known.into_iter().map(|(_, slot)| slot).collect();

        let cleared = {
            let mut guards = Self::lock_all(&slots, "evict_all");
            let mut drained = HashSet::new();
            for guard in guards.iter_mut() {
                guard.invalidated_at = guard.invalidated_at.max(marker);
                drained.extend(guard.keys.drain());
            }

            let cleared = self.store.clear();
            if cleared.is_err() {
                self.delete_keys(&drained);
            }
            for key in &drained {
                self.keys.remove(key);
            }
            cleared
        };
        gauge!(METRIC_INDEXED_KEYS).set(self.keys.len() as f64);

        match cleared {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                info!(tables = slots.len(), "Cache flushed");
                Ok(())
            }
            Err(err) => {
                counter!(METRIC_BACKEND_ERROR, "op" => "clear").increment(1);
                self.degraded.store(true, Ordering::SeqCst);
                error!(error = %err, "Cache flush failed; bypassing cache until backend recovers");
                Err(CacheError::backend("clear", &err))
            }
        }
    }

    /// True while a backend fault may have left stale entries behind.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Retry the flush that leaves degraded mode. Returns true once healthy.
    pub fn recover(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        self.evict_all().is_ok()
    }

    /// Drop `key` from the index if the backend no longer holds it, e.g.
    /// after the backend expired it.
    pub fn forget(&self, key: &CacheKey) {
        self.prune(key);
        gauge!(METRIC_INDEXED_KEYS).set(self.keys.len() as f64);
    }

    pub fn is_indexed(&self, key: &CacheKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Delete `keys` from the backend while the caller holds the slot lock.
    fn delete_keys(&self, keys: &HashSet<CacheKey>) {
        let failed = keys
            .iter()
            .filter(|key| self.store.delete(key).is_err())
            .count();
        if failed == 0 {
            return;
        }

        counter!(METRIC_BACKEND_ERROR, "op" => "delete").increment(failed as u64);
        warn!(failed, "Cache backend failed to delete invalidated entries; clearing");
        if let Err(err) = self.store.clear() {
            counter!(METRIC_BACKEND_ERROR, "op" => "clear").increment(1);
            self.degraded.store(true, Ordering::SeqCst);
            error!(error = %err, "Cache backend clear failed; bypassing cache until it recovers");
        }
    }

    /// Drop index references to `key` once it is gone from the backend.
    ///
    /// Runs under every slot the key is indexed in, the same locks
    /// registration takes, so a concurrent re-registration is never undone.
    fn prune(&self, key: &CacheKey) {
        let Some(tables) = self.keys.get(key).map(|entry| entry.value().clone()) else {
            return;
        };
        let slots: Vec<_> = tables.iter().map(|table| self.slot(table)).collect();
        let mut guards = Self::lock_all(&slots, "prune");

        match self.store.get(key) {
            Ok(None) => {}
            Ok(Some(_)) | Err(_) => return,
        }
        for guard in guards.iter_mut() {
            guard.keys.remove(key);
        }
        self.keys.remove(key);
    }
}
