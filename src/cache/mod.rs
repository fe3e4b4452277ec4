//! ORM read cache.
//!
//! Caches the results of compiled ORM reads and evicts them whenever a table
//! they read from is written:
//!
//! - **Fingerprint** ([`fingerprint`]): deterministic key per read.
//! - **Dependencies** ([`extract`]): the tables a read touches, or `Unknown`.
//! - **Store** ([`CacheStore`]): pluggable backend, [`MemoryStore`] by default.
//! - **Index** ([`InvalidationIndex`]): table → keys, with eviction.
//! - **Transactions** ([`Transaction`]): invalidations deferred to commit.
//! - **Orchestrator** ([`QueryCache`]): the read/write entry points.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_entries = 10000
//! shards = 16
//! # entry_ttl_seconds = 600
//! isolation = "read_committed"
//! ```

mod config;
mod deps;
mod error;
mod keys;
mod lock;
mod orchestrator;
mod query;
mod registry;
mod store;
mod transaction;

pub use config::{CacheConfig, TransactionIsolation};
pub use deps::{TableDependencies, TableRef, TableSet, extract, extract_write, normalize_identifier};
pub use error::{Bypass, CacheError, StoreError};
pub use keys::{CacheKey, fingerprint};
pub use orchestrator::QueryCache;
pub use query::{
    Clause, CompiledQuery, DEFAULT_DATABASE, Declarative, FreeText, QueryDescriptor, ResultShape,
    SqlValue, TableRole, WriteKind, WriteStatement, table_clause,
};
pub use registry::{InvalidationIndex, RegisterOutcome, Stamp};
pub use store::{CacheEntry, CacheStore, MemoryStore};
pub use transaction::{Transaction, TxState};
