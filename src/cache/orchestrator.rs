//! Cache orchestrator.
//!
//! Single entry point the ORM integration shim talks to. Reads go through
//! [`QueryCache::read`] with an executor that runs the real query on a miss;
//! writes go through [`QueryCache::write`] (or [`QueryCache::notify_write`]
//! when the shim executes the statement itself).

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use super::config::{CacheConfig, TransactionIsolation};
use super::deps::{self, TableDependencies, TableSet};
use super::error::{Bypass, CacheError};
use super::keys::{CacheKey, fingerprint};
use super::query::{CompiledQuery, WriteStatement};
use super::registry::{InvalidationIndex, RegisterOutcome, Stamp};
use super::store::{CacheEntry, CacheStore, MemoryStore};
use super::transaction::Transaction;

const METRIC_HIT: &str = "ormcache_hit_total";
const METRIC_MISS: &str = "ormcache_miss_total";
const METRIC_BYPASS: &str = "ormcache_bypass_total";
const METRIC_STORE: &str = "ormcache_store_total";
const METRIC_FLUSH: &str = "ormcache_flush_total";
const METRIC_BACKEND_ERROR: &str = "ormcache_backend_error_total";

struct ReadPlan {
    key: CacheKey,
    tables: TableSet,
}

/// Process-scoped cache context: one backend plus its invalidation index.
pub struct QueryCache {
    config: CacheConfig,
    index: InvalidationIndex,
}

impl QueryCache {
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        info!(
            enabled = config.enabled,
            isolation = ?config.isolation,
            "Query cache initialized"
        );
        Self {
            config,
            index: InvalidationIndex::new(store),
        }
    }

    /// Cache backed by the sharded in-memory LRU store.
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(config.clone(), Arc::new(MemoryStore::new(config)))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn index(&self) -> &InvalidationIndex {
        &self.index
    }

    pub fn is_degraded(&self) -> bool {
        self.index.is_degraded()
    }

    /// Serve `query` from the cache, or run `execute` and cache its result.
    ///
    /// Cache faults never surface here; the only error returned is the one
    /// produced by `execute`.
    pub fn read<T, E, F>(&self, query: &CompiledQuery, execute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        self.read_with(query, None, execute)
    }

    /// [`read`](Self::read) on the connection that owns `transaction`.
    pub fn read_in<T, E, F>(
        &self,
        transaction: &Transaction,
        query: &CompiledQuery,
        execute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        self.read_with(query, Some(transaction), execute)
    }

    fn read_with<T, E, F>(
        &self,
        query: &CompiledQuery,
        transaction: Option<&Transaction>,
        execute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        let plan = match self.plan_read(query, transaction) {
            Ok(plan) => plan,
            Err(reason) => {
                counter!(METRIC_BYPASS, "reason" => reason.as_str()).increment(1);
                debug!(%reason, sql = query.descriptor.sql(), "Cache bypassed");
                return execute();
            }
        };

        if let Some(value) = self.lookup(&plan.key, transaction) {
            counter!(METRIC_HIT).increment(1);
            debug!(cache_key = %plan.key, "Cache hit");
            return Ok(value);
        }
        counter!(METRIC_MISS).increment(1);
        debug!(cache_key = %plan.key, "Cache miss");

        let stamp = self.read_stamp(transaction);
        let value = execute()?;
        self.remember(plan, stamp, &value);
        Ok(value)
    }

    fn plan_read(
        &self,
        query: &CompiledQuery,
        transaction: Option<&Transaction>,
    ) -> Result<ReadPlan, Bypass> {
        if !self.config.enabled {
            return Err(Bypass::Disabled);
        }
        if query.row_lock {
            return Err(Bypass::LockingRead);
        }
        if self.index.is_degraded() && !self.index.recover() {
            return Err(Bypass::Degraded);
        }
        let TableDependencies::Known(tables) = deps::extract(query) else {
            return Err(Bypass::UnknownDependencies);
        };
        if transaction.is_some_and(|tx| tx.is_dirty_for(&tables)) {
            return Err(Bypass::DirtyTransaction);
        }
        Ok(ReadPlan {
            key: fingerprint(&query.descriptor),
            tables,
        })
    }

    /// Under repeatable read a transaction sees its begin snapshot, so its
    /// reads are only as fresh as the begin stamp.
    fn read_stamp(&self, transaction: Option<&Transaction>) -> Stamp {
        match (transaction, self.config.isolation) {
            (Some(tx), TransactionIsolation::RepeatableRead) => tx.begin_stamp(),
            _ => self.index.stamp(),
        }
    }

    fn lookup<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        transaction: Option<&Transaction>,
    ) -> Option<T> {
        let entry = match self.index.store().get(key) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                if self.index.is_indexed(key) {
                    // Expired or dropped by the backend on its own.
                    self.index.forget(key);
                }
                return None;
            }
            Err(err) => {
                counter!(METRIC_BACKEND_ERROR, "op" => "get").increment(1);
                warn!(cache_key = %key, error = %err, "Cache backend read failed; treating as miss");
                return None;
            }
        };

        // Writes only evict indexed entries; an unindexed one may be stale.
        if !self.index.is_indexed(key) {
            debug!(cache_key = %key, "Unindexed entry ignored");
            return None;
        }

        let snapshot_bound = self.config.isolation == TransactionIsolation::RepeatableRead;
        if snapshot_bound && transaction.is_some_and(|tx| entry.stamp > tx.begin_stamp()) {
            debug!(cache_key = %key, "Entry newer than transaction snapshot");
            return None;
        }

        match decode(&entry) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(cache_key = %key, error = %err, "Undecodable cache entry dropped");
                if let Err(err) = self.index.store().delete(key) {
                    counter!(METRIC_BACKEND_ERROR, "op" => "delete").increment(1);
                    warn!(cache_key = %key, error = %err, "Cache backend delete failed");
                }
                None
            }
        }
    }

    fn remember<T: Serialize>(&self, plan: ReadPlan, stamp: Stamp, value: &T) {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(cache_key = %plan.key, error = %err, "Result not serializable; not cached");
                return;
            }
        };
        let entry = CacheEntry {
            key: plan.key,
            payload: Bytes::from(payload),
            dependencies: plan.tables,
            created_at: OffsetDateTime::now_utc(),
            stamp,
        };
        if self.index.register(entry) == RegisterOutcome::Stored {
            counter!(METRIC_STORE).increment(1);
            debug!(cache_key = %plan.key, "Result cached");
        }
    }

    /// Run a write and raise its invalidation.
    ///
    /// The invalidation is raised even when `execute` fails: the database may
    /// have applied part of the statement.
    pub fn write<R, E, F>(
        &self,
        statement: &WriteStatement,
        transaction: Option<&mut Transaction>,
        execute: F,
    ) -> Result<R, E>
    where
        E: From<CacheError>,
        F: FnOnce() -> Result<R, E>,
    {
        let outcome = execute();
        self.notify_write(statement, transaction)?;
        outcome
    }

    /// Record that `statement` ran.
    ///
    /// Outside a transaction the affected entries are evicted before this
    /// returns. Inside one they join the pending batch.
    pub fn notify_write(
        &self,
        statement: &WriteStatement,
        transaction: Option<&mut Transaction>,
    ) -> Result<(), CacheError> {
        let targets = deps::extract_write(statement);
        match transaction {
            Some(tx) if tx.database() == statement.database => {
                tx.record(&targets)?;
                debug!(
                    tx_id = %tx.id(),
                    kind = statement.kind.as_str(),
                    "Write deferred to commit"
                );
            }
            _ => {
                let evicted = self.invalidate(&statement.database, &targets);
                debug!(kind = statement.kind.as_str(), evicted, "Write invalidated");
            }
        }
        Ok(())
    }

    fn invalidate(&self, database: &str, targets: &TableDependencies) -> usize {
        match targets {
            TableDependencies::Known(tables) => tables
                .iter()
                .map(|table| self.index.evict(table).len())
                .sum(),
            TableDependencies::Unknown => self.index.evict_database(database).len(),
        }
    }

    /// Open a transaction context for `database`.
    pub fn begin(&self, database: impl Into<String>) -> Transaction {
        Transaction::open(database, self.index.stamp())
    }

    /// Commit through `commit`, then apply the transaction's invalidations.
    ///
    /// Nothing is invalidated unless `commit` succeeds; on failure the batch is
    /// discarded and the error returned.
    #[instrument(skip_all, fields(tx_id = %transaction.id()))]
    pub fn commit<E, F>(&self, transaction: &mut Transaction, commit: F) -> Result<(), E>
    where
        E: From<CacheError>,
        F: FnOnce() -> Result<(), E>,
    {
        let pending = transaction.start_commit()?;
        if let Err(err) = commit() {
            transaction.start_rollback()?;
            transaction.finish_rollback();
            warn!(
                discarded_tables = pending.tables.len(),
                "Commit failed; pending invalidations discarded"
            );
            return Err(err);
        }

        if !pending.is_empty() {
            let targets = if pending.everything {
                TableDependencies::Unknown
            } else {
                TableDependencies::Known(pending.tables)
            };
            let evicted = self.invalidate(&pending.database, &targets);
            info!(evicted, "Committed invalidations applied");
        }
        transaction.finish_commit();
        Ok(())
    }

    /// Abort `transaction`; its pending invalidations are dropped.
    pub fn rollback(&self, transaction: &mut Transaction) -> Result<(), CacheError> {
        transaction.start_rollback()?;
        transaction.finish_rollback();
        debug!(tx_id = %transaction.id(), "Transaction rolled back");
        Ok(())
    }

    /// Invalidate everything, e.g. after a schema change.
    pub fn flush_all(&self) -> Result<(), CacheError> {
        counter!(METRIC_FLUSH).increment(1);
        self.index.evict_all()
    }

    /// Flush before the context goes away.
    pub fn teardown(&self) -> Result<(), CacheError> {
        self.flush_all()?;
        info!("Query cache torn down");
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(entry: &CacheEntry) -> Result<T, CacheError> {
    Ok(serde_json::from_slice(&entry.payload)?)
}
