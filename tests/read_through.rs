mod common;

use std::sync::Arc;

use common::{
    DbError, FakeDb, Row, all_query, all_query_on, cache, filtered_query, insert, read_all,
    read_count,
};
use ormcache::cache::{
    Clause, CompiledQuery, DEFAULT_DATABASE, Declarative, QueryDescriptor, ResultShape, SqlValue,
    TableRole, WriteStatement, table_clause,
};

#[test]
fn create_read_read_create_read() {
    let cache = cache();
    let db = FakeDb::new();
    let query = all_query("items");

    insert(&cache, &db, None, "items", Row::new(1, "R1")).expect("insert R1");

    let first = db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
    assert_eq!(first, vec![Row::new(1, "R1")]);

    let second = db.assert_num_queries(0, || read_all(&cache, &db, &query, "items"));
    assert_eq!(second, first);

    insert(&cache, &db, None, "items", Row::new(2, "R2")).expect("insert R2");

    let third = db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
    assert_eq!(third, vec![Row::new(1, "R1"), Row::new(2, "R2")]);
}

#[test]
fn extra_where_is_never_cached() {
    let cache = cache();
    let db = FakeDb::new();
    insert(&cache, &db, None, "items", Row::new(1, "R1")).expect("insert");
    let query = all_query("items").extra_where("name LIKE 'R%'");

    for _ in 0..3 {
        db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
    }
    assert_eq!(cache.index().key_count(), 0);
}

#[test]
fn extra_select_is_never_cached() {
    let cache = cache();
    let db = FakeDb::new();
    let query = all_query("items")
        .extra_select("owner_name", "SELECT username FROM auth_user WHERE id = items.owner_id");

    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
}

#[test]
fn raw_sql_is_never_cached() {
    let cache = cache();
    let db = FakeDb::new();
    let query = CompiledQuery::raw(DEFAULT_DATABASE, "SELECT * FROM items;", Vec::new());

    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
}

#[test]
fn extra_tables_are_tracked_with_or_without_quotes() {
    let cache = cache();
    let db = FakeDb::new();
    let sql = "SELECT items.* FROM items, auth_user";
    let plain = filtered_query("items", sql, Vec::new()).extra_tables(["auth_user"]);
    let quoted = filtered_query("items", sql, Vec::new()).extra_tables(["\"auth_user\""]);

    db.assert_num_queries(1, || read_all(&cache, &db, &plain, "items"));
    // Same SQL skeleton, same key: quoting the table name changes nothing.
    db.assert_num_queries(0, || read_all(&cache, &db, &quoted, "items"));

    insert(&cache, &db, None, "auth_user", Row::new(1, "admin")).expect("insert user");
    db.assert_num_queries(1, || read_all(&cache, &db, &quoted, "items"));
}

#[test]
fn extra_order_by_on_own_table_is_cached() {
    let cache = cache();
    let db = FakeDb::new();
    let query = all_query("items").extra_order_by("-items.name");

    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
    db.assert_num_queries(0, || read_all(&cache, &db, &query, "items"));
}

#[test]
fn partial_field_reads_are_cached_independently() {
    let cache = cache();
    let db = FakeDb::new();
    insert(&cache, &db, None, "items", Row::new(1, "R1")).expect("insert");

    fn descriptor(columns: &[&str]) -> QueryDescriptor {
        QueryDescriptor::new(
            DEFAULT_DATABASE,
            "SELECT id, name, public FROM items",
            Vec::new(),
            ResultShape::Fields(columns.iter().map(|c| c.to_string()).collect()),
        )
    }
    let only_name = CompiledQuery::new(descriptor(&["id", "name"])).from_table("items");
    let deferred = CompiledQuery::new(descriptor(&["id", "public"])).from_table("items");

    db.assert_num_queries(1, || read_all(&cache, &db, &only_name, "items"));
    // Touching the missing column costs exactly one more fetch.
    db.assert_num_queries(1, || read_all(&cache, &db, &deferred, "items"));
    db.assert_num_queries(0, || read_all(&cache, &db, &only_name, "items"));
    db.assert_num_queries(0, || read_all(&cache, &db, &deferred, "items"));
}

#[test]
fn count_and_exists_are_cached_and_invalidated() {
    let cache = cache();
    let db = FakeDb::new();

    assert_eq!(db.assert_num_queries(1, || read_count(&cache, &db, "items")), 0);
    assert_eq!(db.assert_num_queries(0, || read_count(&cache, &db, "items")), 0);

    let exists_query = CompiledQuery::new(QueryDescriptor::new(
        DEFAULT_DATABASE,
        "SELECT 1 FROM items LIMIT 1",
        Vec::new(),
        ResultShape::Exists,
    ))
    .from_table("items");
    let exists = || {
        cache
            .read(&exists_query, || Ok::<_, DbError>(db.count("items") > 0))
            .expect("exists")
    };
    assert!(!db.assert_num_queries(1, exists));

    insert(&cache, &db, None, "items", Row::new(1, "R1")).expect("insert");
    assert_eq!(db.assert_num_queries(1, || read_count(&cache, &db, "items")), 1);
    assert!(db.assert_num_queries(1, exists));
}

#[test]
fn parameters_select_distinct_entries() {
    let cache = cache();
    let db = FakeDb::new();
    let sql = "SELECT id, name, public FROM items WHERE id = %s";
    let first = filtered_query("items", sql, vec![SqlValue::Int(1)]);
    let second = filtered_query("items", sql, vec![SqlValue::Int(2)]);

    db.assert_num_queries(1, || read_all(&cache, &db, &first, "items"));
    db.assert_num_queries(1, || read_all(&cache, &db, &second, "items"));
    db.assert_num_queries(0, || read_all(&cache, &db, &first, "items"));
    assert_eq!(cache.index().key_count(), 2);
}

#[test]
fn subquery_tables_are_dependencies() {
    let cache = cache();
    let db = FakeDb::new();
    let query = filtered_query(
        "items",
        "SELECT * FROM items WHERE owner_id IN (SELECT id FROM auth_user WHERE is_staff)",
        Vec::new(),
    )
    .subquery(vec![table_clause("auth_user", TableRole::From)]);

    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
    db.assert_num_queries(0, || read_all(&cache, &db, &query, "items"));

    insert(&cache, &db, None, "auth_user", Row::new(1, "staff")).expect("insert user");
    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
}

#[test]
fn transitive_relation_is_never_cached() {
    let cache = cache();
    let db = FakeDb::new();
    let query = all_query("items").clause(Clause::Declarative(Declarative::Transitive {
        name: "auth_group".into(),
    }));

    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
}

#[test]
fn select_for_update_is_never_cached() {
    let cache = cache();
    let db = FakeDb::new();
    let query = all_query("items").for_update();

    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
}

#[test]
fn database_aliases_are_isolated() {
    let cache = cache();
    let db = FakeDb::new();
    let default = all_query("items");
    let replica = all_query_on("replica", "items");

    db.assert_num_queries(1, || read_all(&cache, &db, &default, "items"));
    db.assert_num_queries(1, || read_all(&cache, &db, &replica, "items"));

    cache
        .notify_write(&WriteStatement::update("replica", "items"), None)
        .expect("notify");
    db.assert_num_queries(0, || read_all(&cache, &db, &default, "items"));
    db.assert_num_queries(1, || read_all(&cache, &db, &replica, "items"));
}

#[test]
fn get_or_create_failure_still_invalidates() {
    let cache = cache();
    let db = FakeDb::new();
    insert(&cache, &db, None, "items", Row::new(1, "R1")).expect("insert");
    let query = all_query("items");
    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));

    let duplicate = insert(&cache, &db, None, "items", Row::new(1, "again"));
    assert!(matches!(duplicate, Err(DbError::Integrity(_))));
    db.assert_num_queries(1, || read_all(&cache, &db, &query, "items"));
}

#[test]
fn concurrent_readers_share_one_entry() {
    let cache = Arc::new(cache());
    let db = Arc::new(FakeDb::new());
    insert(&cache, &db, None, "items", Row::new(1, "R1")).expect("insert");
    read_all(&cache, &db, &all_query("items"), "items");

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let db = Arc::clone(&db);
            scope.spawn(move || {
                for _ in 0..50 {
                    let rows = read_all(&cache, &db, &all_query("items"), "items");
                    assert_eq!(rows, vec![Row::new(1, "R1")]);
                }
            });
        }
    });

    // Only the warm-up read and the insert reached the database.
    assert_eq!(db.queries(), 2);
}
