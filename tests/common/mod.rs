//! In-memory stand-in for a database connection plus the shim glue the tests
//! share. Every statement it runs is counted so tests can assert how many
//! queries actually reached the "database".

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use ormcache::cache::{
    CacheConfig, CacheError, CompiledQuery, DEFAULT_DATABASE, QueryCache, QueryDescriptor,
    ResultShape, SqlValue, Transaction, WriteStatement,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: i64,
    pub name: String,
    pub public: bool,
}

impl Row {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            public: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

type Tables = BTreeMap<String, Vec<Row>>;

#[derive(Default)]
pub struct FakeDb {
    committed: Mutex<Tables>,
    /// Writes of the open transaction, visible only inside it.
    staged: Mutex<Option<Tables>>,
    queries: AtomicUsize,
    fail_next_commit: Mutex<bool>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Run `f` and assert it issued exactly `expected` statements.
    #[track_caller]
    pub fn assert_num_queries<R>(&self, expected: usize, f: impl FnOnce() -> R) -> R {
        let before = self.queries();
        let result = f();
        assert_eq!(self.queries() - before, expected, "unexpected query count");
        result
    }

    fn visible(&self) -> Tables {
        let mut tables = self.committed.lock().expect("committed tables").clone();
        if let Some(staged) = self.staged.lock().expect("staged tables").as_ref() {
            for (table, rows) in staged {
                tables.entry(table.clone()).or_default().extend(rows.iter().cloned());
            }
        }
        tables
    }

    pub fn select_all(&self, table: &str) -> Vec<Row> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.visible().remove(table).unwrap_or_default()
    }

    pub fn count(&self, table: &str) -> usize {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.visible().get(table).map_or(0, Vec::len)
    }

    pub fn insert(&self, table: &str, row: Row) -> Result<u64, DbError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.visible().get(table).is_some_and(|rows| rows.iter().any(|r| r.id == row.id)) {
            return Err(DbError::Integrity(format!("duplicate key {} in {table}", row.id)));
        }
        let mut staged = self.staged.lock().expect("staged tables");
        match staged.as_mut() {
            Some(staged) => staged.entry(table.to_string()).or_default().push(row),
            None => self
                .committed
                .lock()
                .expect("committed tables")
                .entry(table.to_string())
                .or_default()
                .push(row),
        }
        Ok(1)
    }

    pub fn begin(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
        *self.staged.lock().expect("staged tables") = Some(Tables::new());
    }

    pub fn commit(&self) -> Result<(), DbError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let staged = self.staged.lock().expect("staged tables").take();
        let mut fail = self.fail_next_commit.lock().expect("commit switch");
        if *fail {
            *fail = false;
            return Err(DbError::Commit("serialization failure".into()));
        }
        let mut committed = self.committed.lock().expect("committed tables");
        for (table, rows) in staged.unwrap_or_default() {
            committed.entry(table).or_default().extend(rows);
        }
        Ok(())
    }

    pub fn rollback(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.staged.lock().expect("staged tables").take();
    }

    pub fn fail_next_commit(&self) {
        *self.fail_next_commit.lock().expect("commit switch") = true;
    }
}

pub fn cache() -> QueryCache {
    QueryCache::in_memory(&CacheConfig::default())
}

pub fn all_query(table: &str) -> CompiledQuery {
    all_query_on(DEFAULT_DATABASE, table)
}

pub fn all_query_on(database: &str, table: &str) -> CompiledQuery {
    let descriptor = QueryDescriptor::new(
        database,
        &format!("SELECT id, name, public FROM {table}"),
        Vec::new(),
        ResultShape::Rows,
    );
    CompiledQuery::new(descriptor).from_table(table)
}

pub fn count_query(table: &str) -> CompiledQuery {
    let descriptor = QueryDescriptor::new(
        DEFAULT_DATABASE,
        &format!("SELECT COUNT(*) FROM {table}"),
        Vec::new(),
        ResultShape::Count,
    );
    CompiledQuery::new(descriptor).from_table(table)
}

pub fn filtered_query(table: &str, sql: &str, params: Vec<SqlValue>) -> CompiledQuery {
    let descriptor = QueryDescriptor::new(DEFAULT_DATABASE, sql, params, ResultShape::Rows);
    CompiledQuery::new(descriptor).from_table(table)
}

pub fn read_all(cache: &QueryCache, db: &FakeDb, query: &CompiledQuery, table: &str) -> Vec<Row> {
    cache
        .read(query, || Ok::<_, DbError>(db.select_all(table)))
        .expect("read")
}

pub fn read_count(cache: &QueryCache, db: &FakeDb, table: &str) -> usize {
    cache
        .read(&count_query(table), || Ok::<_, DbError>(db.count(table)))
        .expect("count")
}

pub fn read_count_in(cache: &QueryCache, tx: &Transaction, db: &FakeDb, table: &str) -> usize {
    cache
        .read_in(tx, &count_query(table), || Ok::<_, DbError>(db.count(table)))
        .expect("count")
}

pub fn insert(
    cache: &QueryCache,
    db: &FakeDb,
    tx: Option<&mut Transaction>,
    table: &str,
    row: Row,
) -> Result<u64, DbError> {
    let statement = WriteStatement::insert(DEFAULT_DATABASE, table);
    cache.write(&statement, tx, || db.insert(table, row))
}
