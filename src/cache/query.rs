//! Compiled query and write statement model.
//!
//! These are the values the ORM integration shim hands to the cache. The core
//! never parses dialect SQL: table provenance arrives as a closed set of
//! [`Clause`] variants that the dependency extractor matches over.

use time::{Date, OffsetDateTime};

/// Database alias used when the shim does not name one.
pub const DEFAULT_DATABASE: &str = "default";

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(Date),
    Timestamp(OffsetDateTime),
    /// Expanded `IN (...)` list, order preserved.
    List(Vec<SqlValue>),
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Date> for SqlValue {
    fn from(value: Date) -> Self {
        Self::Date(value)
    }
}

impl From<OffsetDateTime> for SqlValue {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// What the caller expects to decode from the result.
///
/// Column lists are order-sensitive: `["a", "b"]` and `["b", "a"]` are
/// different shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultShape {
    /// Fully hydrated rows.
    Rows,
    /// Partially loaded objects (`only` / `defer`).
    Fields(Vec<String>),
    /// Rows as column → value maps.
    Values(Vec<String>),
    /// Rows as tuples, or bare values when `flat`.
    ValuesList { columns: Vec<String>, flat: bool },
    /// Named aggregate results.
    Aggregate(Vec<String>),
    Count,
    Exists,
}

/// Immutable identity of a read query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    database: String,
    sql: String,
    params: Vec<SqlValue>,
    shape: ResultShape,
}

impl QueryDescriptor {
    /// Build a descriptor. The SQL text is kept verbatim.
    pub fn new(
        database: impl Into<String>,
        sql: &str,
        params: Vec<SqlValue>,
        shape: ResultShape,
    ) -> Self {
        Self {
            database: database.into(),
            sql: sql.to_string(),
            params,
            shape,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn shape(&self) -> &ResultShape {
        &self.shape
    }
}

/// How a declaratively referenced table participates in the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRole {
    From,
    Join,
    /// Relation aggregated over (`annotate(n=Count("rel"))`).
    Aggregate,
}

/// Query structure produced by the ORM's declarative operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Declarative {
    /// Table read directly by the statement.
    Table { name: String, role: TableRole },
    /// Nested query whose tables contribute to the outer result.
    Subquery(Vec<Clause>),
    /// Relation reachable only through a foreign key the statement never
    /// touches directly.
    Transitive { name: String },
}

/// Caller-supplied SQL the ORM passes through unparsed.
#[derive(Debug, Clone, PartialEq)]
pub enum FreeText {
    /// `extra(select={alias: sql})`
    Select { alias: String, sql: String },
    /// `extra(where=[sql])`
    Where(String),
    /// `extra(order_by=[term])`
    OrderBy(String),
    /// A whole statement with no declarative structure.
    Statement(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Declarative(Declarative),
    /// `extra(tables=[...])`: named, so trackable.
    ExtraTables(Vec<String>),
    FreeText(FreeText),
}

/// A read as compiled by the ORM: identity plus table provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub descriptor: QueryDescriptor,
    pub clauses: Vec<Clause>,
    /// `SELECT ... FOR UPDATE` and friends.
    pub row_lock: bool,
}

impl CompiledQuery {
    pub fn new(descriptor: QueryDescriptor) -> Self {
        Self {
            descriptor,
            clauses: Vec::new(),
            row_lock: false,
        }
    }

    /// Raw SQL executed verbatim (manager `raw()` or a cursor).
    pub fn raw(database: impl Into<String>, sql: &str, params: Vec<SqlValue>) -> Self {
        let descriptor = QueryDescriptor::new(database, sql, params, ResultShape::Rows);
        Self::new(descriptor).clause(Clause::FreeText(FreeText::Statement(sql.to_string())))
    }

    pub fn clause(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn from_table(self, name: impl Into<String>) -> Self {
        self.table(name, TableRole::From)
    }

    pub fn join(self, name: impl Into<String>) -> Self {
        self.table(name, TableRole::Join)
    }

    pub fn table(self, name: impl Into<String>, role: TableRole) -> Self {
        self.clause(Clause::Declarative(Declarative::Table {
            name: name.into(),
            role,
        }))
    }

    pub fn subquery(self, clauses: Vec<Clause>) -> Self {
        self.clause(Clause::Declarative(Declarative::Subquery(clauses)))
    }

    pub fn extra_tables<I, S>(self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clause(Clause::ExtraTables(
            tables.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn extra_select(self, alias: impl Into<String>, sql: impl Into<String>) -> Self {
        self.clause(Clause::FreeText(FreeText::Select {
            alias: alias.into(),
            sql: sql.into(),
        }))
    }

    pub fn extra_where(self, sql: impl Into<String>) -> Self {
        self.clause(Clause::FreeText(FreeText::Where(sql.into())))
    }

    pub fn extra_order_by(self, term: impl Into<String>) -> Self {
        self.clause(Clause::FreeText(FreeText::OrderBy(term.into())))
    }

    pub fn for_update(mut self) -> Self {
        self.row_lock = true;
        self
    }
}

/// Shorthand for a declarative table clause inside a subquery.
pub fn table_clause(name: impl Into<String>, role: TableRole) -> Clause {
    Clause::Declarative(Declarative::Table {
        name: name.into(),
        role,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    /// Statement text only; targets unknown.
    Raw,
}

impl WriteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Raw => "raw",
        }
    }
}

/// A write notification from the shim.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteStatement {
    pub database: String,
    pub kind: WriteKind,
    /// Target tables, including cascades and many-to-many link tables.
    pub tables: Vec<String>,
}

impl WriteStatement {
    pub fn new(database: impl Into<String>, kind: WriteKind, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            kind,
            tables: vec![table.into()],
        }
    }

    pub fn insert(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(database, WriteKind::Insert, table)
    }

    pub fn update(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(database, WriteKind::Update, table)
    }

    pub fn delete(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(database, WriteKind::Delete, table)
    }

    pub fn raw(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            kind: WriteKind::Raw,
            tables: Vec::new(),
        }
    }

    /// Add a table touched as a side effect (cascade, link table).
    pub fn also(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_is_kept_verbatim() {
        let sql = "SELECT *\n   FROM items\tWHERE id = %s ";
        let descriptor = QueryDescriptor::new(DEFAULT_DATABASE, sql, vec![1.into()], ResultShape::Rows);
        assert_eq!(descriptor.sql(), sql);
    }

    #[test]
    fn whitespace_inside_comments_and_literals_matters() {
        let pairs = [
            ("SELECT id -- pk\n, name FROM items", "SELECT id -- pk , name FROM items"),
            ("SELECT E'a\\' AND   x'", "SELECT E'a\\' AND x'"),
            ("SELECT $$a   b$$", "SELECT $$a b$$"),
        ];
        for (left, right) in pairs {
            let left = QueryDescriptor::new(DEFAULT_DATABASE, left, Vec::new(), ResultShape::Rows);
            let right = QueryDescriptor::new(DEFAULT_DATABASE, right, Vec::new(), ResultShape::Rows);
            assert_ne!(left, right);
        }
    }

    #[test]
    fn descriptor_equality_is_order_sensitive() {
        let a = QueryDescriptor::new(
            DEFAULT_DATABASE,
            "SELECT 1",
            vec![1.into(), 2.into()],
            ResultShape::Values(vec!["a".into(), "b".into()]),
        );
        let params_swapped = QueryDescriptor::new(
            DEFAULT_DATABASE,
            "SELECT 1",
            vec![2.into(), 1.into()],
            ResultShape::Values(vec!["a".into(), "b".into()]),
        );
        let columns_swapped = QueryDescriptor::new(
            DEFAULT_DATABASE,
            "SELECT 1",
            vec![1.into(), 2.into()],
            ResultShape::Values(vec!["b".into(), "a".into()]),
        );
        assert_ne!(a, params_swapped);
        assert_ne!(a, columns_swapped);
    }

    #[test]
    fn raw_query_carries_statement_clause() {
        let query = CompiledQuery::raw(DEFAULT_DATABASE, "SELECT * FROM items;", Vec::new());
        assert!(matches!(
            query.clauses.as_slice(),
            [Clause::FreeText(FreeText::Statement(_))]
        ));
    }

    #[test]
    fn write_statement_collects_side_effect_tables() {
        let write = WriteStatement::delete(DEFAULT_DATABASE, "auth_user").also("items");
        assert_eq!(write.kind, WriteKind::Delete);
        assert_eq!(write.tables, vec!["auth_user".to_string(), "items".to_string()]);
    }

    #[test]
    fn optional_values_map_to_null() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".into()));
    }
}
