//! Dependency extractor.
//!
//! Decides which physical tables a compiled query reads from. The boundary is
//! syntactic provenance: when every contributing table is named by the
//! declarative layer the result is trackable, otherwise it is
//! [`TableDependencies::Unknown`] and must never be stored.

use std::collections::BTreeSet;
use std::fmt;

use super::query::{Clause, CompiledQuery, Declarative, FreeText, WriteKind, WriteStatement};

/// A physical table scoped to its database alias.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRef {
    pub database: String,
    pub name: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, name: &str) -> Self {
        Self {
            database: database.into(),
            name: normalize_identifier(name),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

/// Ordered so that multi-table locking always happens in the same order.
pub type TableSet = BTreeSet<TableRef>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableDependencies {
    Known(TableSet),
    Unknown,
}

impl TableDependencies {
    pub fn tables(&self) -> Option<&TableSet> {
        match self {
            Self::Known(tables) => Some(tables),
            Self::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

/// Strip SQL identifier quoting: `"t"`, `` `t` `` and `[t]` all become `t`.
pub fn normalize_identifier(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = [('"', '"'), ('`', '`'), ('[', ']')]
        .iter()
        .find_map(|(open, close)| {
            trimmed
                .strip_prefix(*open)
                .and_then(|rest| rest.strip_suffix(*close))
        })
        .unwrap_or(trimmed);
    unquoted.to_string()
}

/// Table dependencies of a read.
pub fn extract(query: &CompiledQuery) -> TableDependencies {
    let database = query.descriptor.database();
    let mut tables = TableSet::new();
    let mut order_terms = Vec::new();

    if collect(&query.clauses, database, &mut tables, &mut order_terms).is_none() {
        return TableDependencies::Unknown;
    }
    if tables.is_empty() {
        return TableDependencies::Unknown;
    }
    if !order_terms
        .iter()
        .all(|term| order_term_is_local(term, &tables))
    {
        return TableDependencies::Unknown;
    }
    TableDependencies::Known(tables)
}

/// Walk clauses depth-first. `None` means an untrackable clause was found.
fn collect<'q>(
    clauses: &'q [Clause],
    database: &str,
    tables: &mut TableSet,
    order_terms: &mut Vec<&'q str>,
) -> Option<()> {
    for clause in clauses {
        match clause {
            Clause::Declarative(Declarative::Table { name, .. }) => {
                tables.insert(TableRef::new(database, name));
            }
            Clause::Declarative(Declarative::Subquery(inner)) => {
                collect(inner, database, tables, order_terms)?;
            }
            Clause::Declarative(Declarative::Transitive { .. }) => return None,
            Clause::ExtraTables(extra) => {
                tables.extend(extra.iter().map(|name| TableRef::new(database, name)));
            }
            Clause::FreeText(FreeText::OrderBy(term)) => order_terms.push(term),
            Clause::FreeText(
                FreeText::Select { .. } | FreeText::Where(_) | FreeText::Statement(_),
            ) => return None,
        }
    }
    Some(())
}

/// An extra ordering term is local when it is `[-+]?[table.]column` (or `?`)
/// and its qualifier, if any, is already a dependency.
fn order_term_is_local(term: &str, tables: &TableSet) -> bool {
    let term = term.trim();
    if term == "?" {
        return true;
    }
    let term = term.strip_prefix(['-', '+']).unwrap_or(term);

    let (qualifier, column) = match term.rsplit_once('.') {
        Some((qualifier, column)) => (Some(qualifier), column),
        None => (None, term),
    };
    if !is_plain_identifier(column) {
        return false;
    }
    match qualifier {
        None => true,
        Some(qualifier) => {
            if !is_plain_identifier(qualifier) {
                return false;
            }
            let qualifier = normalize_identifier(qualifier);
            tables.iter().any(|table| table.name == qualifier)
        }
    }
}

fn is_plain_identifier(raw: &str) -> bool {
    let name = normalize_identifier(raw);
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '$')
}

/// Tables a write statement changes. Raw statements have unknown targets.
pub fn extract_write(write: &WriteStatement) -> TableDependencies {
    if write.kind == WriteKind::Raw || write.tables.is_empty() {
        return TableDependencies::Unknown;
    }
    TableDependencies::Known(
        write
            .tables
            .iter()
            .map(|name| TableRef::new(write.database.as_str(), name))
            .collect(),
    )
}
