mod common;

use common::{create, repo, MIGRATIONS};
use crumb_core::db::{latest_version, open_db, open_db_in_memory, DbError};
use rusqlite::Connection;
use serde_json::json;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory(MIGRATIONS).unwrap();

    assert_eq!(schema_version(&conn), latest_version(MIGRATIONS));
    for table in ["author", "profile", "publisher", "book", "chapter", "stock_line", "user"] {
        assert_table_exists(&conn, table);
    }
}

#[test]
fn connections_enforce_foreign_keys() {
    let conn = open_db_in_memory(MIGRATIONS).unwrap();
    let enabled: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(enabled, 1);

    let err = conn
        .execute(
            "INSERT INTO book (title, genre, author_id) VALUES ('Orphan', 'novel', 99)",
            [],
        )
        .unwrap_err();
    assert!(err.to_string().contains("FOREIGN KEY"));
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crumb.db");

    let conn_first = open_db(&path, MIGRATIONS).unwrap();
    create(&conn_first, "author", json!({"name": "Ann"}));
    drop(conn_first);

    let conn_second = open_db(&path, MIGRATIONS).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version(MIGRATIONS));
    let (authors, total) = repo(&conn_second, "author").list(&[], &[], 0, None).unwrap();
    assert_eq!(total, 1);
    assert_eq!(authors[0].get("name"), Some(&json!("Ann")));
}

#[test]
fn later_migrations_apply_on_an_older_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upgrade.db");

    drop(open_db(&path, &MIGRATIONS[..1]).unwrap());
    let conn = Connection::open(&path).unwrap();
    assert_eq!(schema_version(&conn), 1);
    drop(conn);

    let conn = open_db(&path, MIGRATIONS).unwrap();
    assert_eq!(schema_version(&conn), 2);
    assert_table_exists(&conn, "stock_line");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path, MIGRATIONS).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version(MIGRATIONS));
        }
        other => panic!("unexpected error: {other}"),
    }
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
