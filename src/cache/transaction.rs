//! Transaction coordinator.
//!
//! A [`Transaction`] is owned by the caller's connection context and carries a
//! stack of pending invalidation batches, one per savepoint level. Nothing
//! here touches shared state; the orchestrator applies the merged batch to the
//! index once the database commit succeeded.

use std::fmt;

use tracing::{debug, error};
use uuid::Uuid;

use super::deps::{TableDependencies, TableSet};
use super::error::CacheError;
use super::registry::Stamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committing,
    Applied,
    RollingBack,
    Discarded,
}

impl TxState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::Applied => "applied",
            Self::RollingBack => "rolling_back",
            Self::Discarded => "discarded",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Batch {
    tables: TableSet,
    /// A statement with unknown targets ran; the whole alias is dirty.
    everything: bool,
}

impl Batch {
    fn merge(&mut self, other: Batch) {
        self.tables.extend(other.tables);
        self.everything |= other.everything;
    }
}

/// Invalidations to apply after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingInvalidation {
    pub database: String,
    pub tables: TableSet,
    pub everything: bool,
}

impl PendingInvalidation {
    pub fn is_empty(&self) -> bool {
        !self.everything && self.tables.is_empty()
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: Uuid,
    database: String,
    begin_stamp: Stamp,
    batches: Vec<Batch>,
    state: TxState,
}

impl Transaction {
    pub(crate) fn open(database: impl Into<String>, begin_stamp: Stamp) -> Self {
        let transaction = Self {
            id: Uuid::new_v4(),
            database: database.into(),
            begin_stamp,
            batches: vec![Batch::default()],
            state: TxState::Open,
        };
        debug!(tx_id = %transaction.id, database = %transaction.database, "Transaction opened");
        transaction
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Invalidation clock reading taken when the transaction began.
    pub fn begin_stamp(&self) -> Stamp {
        self.begin_stamp
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Number of savepoints currently open.
    pub fn depth(&self) -> usize {
        self.batches.len().saturating_sub(1)
    }

    /// Tables written so far at every savepoint level.
    pub fn pending_tables(&self) -> TableSet {
        self.batches
            .iter()
            .flat_map(|batch| batch.tables.iter().cloned())
            .collect()
    }

    /// True once a statement with unknown targets has run.
    pub fn touches_everything(&self) -> bool {
        self.batches.iter().any(|batch| batch.everything)
    }

    /// Whether a read over `tables` may observe this transaction's own writes.
    pub fn is_dirty_for(&self, tables: &TableSet) -> bool {
        if self.touches_everything() && tables.iter().any(|table| table.database == self.database) {
            return true;
        }
        self.batches
            .iter()
            .any(|batch| tables.iter().any(|table| batch.tables.contains(table)))
    }

    fn ensure(&self, expected: TxState, op: &'static str) -> Result<(), CacheError> {
        if self.state == expected {
            return Ok(());
        }
        error!(
            tx_id = %self.id,
            op,
            state = %self.state,
            expected = %expected,
            "Transaction state violation"
        );
        Err(CacheError::transaction_state(format!(
            "{op} requires a {expected} transaction, found {}",
            self.state
        )))
    }

    /// Add a write's targets to the innermost batch.
    pub(crate) fn record(&mut self, targets: &TableDependencies) -> Result<(), CacheError> {
        self.ensure(TxState::Open, "record")?;
        let Some(batch) = self.batches.last_mut() else {
            return Err(CacheError::transaction_state("transaction has no open batch"));
        };
        match targets {
            TableDependencies::Known(tables) => batch.tables.extend(tables.iter().cloned()),
            TableDependencies::Unknown => batch.everything = true,
        }
        Ok(())
    }

    /// Enter a savepoint. Returns the new depth.
    pub fn savepoint(&mut self) -> Result<usize, CacheError> {
        self.ensure(TxState::Open, "savepoint")?;
        self.batches.push(Batch::default());
        Ok(self.depth())
    }

    /// Leave the innermost savepoint, keeping its writes in the parent batch.
    pub fn release_savepoint(&mut self) -> Result<(), CacheError> {
        let inner = self.pop_savepoint("release_savepoint")?;
        if let Some(parent) = self.batches.last_mut() {
            parent.merge(inner);
        }
        Ok(())
    }

    /// Undo the innermost savepoint; only its own writes are forgotten.
    pub fn rollback_to_savepoint(&mut self) -> Result<(), CacheError> {
        let inner = self.pop_savepoint("rollback_to_savepoint")?;
        debug!(
            tx_id = %self.id,
            discarded_tables = inner.tables.len(),
            depth = self.depth(),
            "Savepoint rolled back"
        );
        Ok(())
    }

    fn pop_savepoint(&mut self, op: &'static str) -> Result<Batch, CacheError> {
        self.ensure(TxState::Open, op)?;
        if self.depth() == 0 {
            error!(tx_id = %self.id, op, "No savepoint to leave");
            return Err(CacheError::transaction_state(format!(
                "{op} called without an open savepoint"
            )));
        }
        self.batches
            .pop()
            .ok_or_else(|| CacheError::transaction_state("transaction has no open batch"))
    }

    /// `Open → Committing`, handing out the merged batch.
    pub(crate) fn start_commit(&mut self) -> Result<PendingInvalidation, CacheError> {
        self.ensure(TxState::Open, "commit")?;
        self.state = TxState::Committing;
        let mut merged = Batch::default();
        for batch in self.batches.drain(..) {
            merged.merge(batch);
        }
        Ok(PendingInvalidation {
            database: self.database.clone(),
            tables: merged.tables,
            everything: merged.everything,
        })
    }

    /// `Committing → Applied`.
    pub(crate) fn finish_commit(&mut self) {
        self.state = TxState::Applied;
    }

    /// `Open | Committing → RollingBack`, discarding every batch.
    pub(crate) fn start_rollback(&mut self) -> Result<(), CacheError> {
        if !matches!(self.state, TxState::Open | TxState::Committing) {
            self.ensure(TxState::Open, "rollback")?;
        }
        self.state = TxState::RollingBack;
        self.batches.clear();
        Ok(())
    }

    /// `RollingBack → Discarded`.
    pub(crate) fn finish_rollback(&mut self) {
        self.state = TxState::Discarded;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            debug!(
                tx_id = %self.id,
                pending_tables = self.pending_tables().len(),
                "Open transaction dropped; discarding pending invalidations"
            );
        }
    }
}
