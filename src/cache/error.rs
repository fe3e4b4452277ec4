use std::fmt;

use thiserror::Error;

/// Failure reported by a [`CacheStore`](super::CacheStore) backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Errors the cache layer can surface to the integration shim.
///
/// Backend faults are absorbed on the read path and only reach callers of
/// operations that explicitly ask the backend for something (`flush_all`).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable during {op}: {message}")]
    BackendUnavailable { op: &'static str, message: String },
    #[error("transaction state violation: {0}")]
    TransactionStateViolation(String),
    /// A cached payload did not decode into the requested type.
    #[error("cache payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CacheError {
    pub fn backend(op: &'static str, error: &StoreError) -> Self {
        Self::BackendUnavailable {
            op,
            message: error.to_string(),
        }
    }

    pub fn transaction_state(message: impl Into<String>) -> Self {
        Self::TransactionStateViolation(message.into())
    }
}

/// Why a read went straight to the database.
///
/// Not an error: bypassing is the safe answer whenever caching cannot be
/// proven correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bypass {
    /// Caching is switched off in configuration.
    Disabled,
    /// The query's table dependencies could not be enumerated.
    UnknownDependencies,
    /// The read takes row locks and must reach the database.
    LockingRead,
    /// The enclosing transaction has written to a table the read depends on.
    DirtyTransaction,
    /// A backend fault left possibly-stale entries behind.
    Degraded,
}

impl Bypass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::UnknownDependencies => "unknown_dependencies",
            Self::LockingRead => "locking_read",
            Self::DirtyTransaction => "dirty_transaction",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for Bypass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
