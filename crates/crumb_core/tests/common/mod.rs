#![allow(dead_code)]

use crumb_core::db::{open_db_in_memory, Migration};
use crumb_core::errors::{FieldError, RepoError, RepoResult};
use crumb_core::orm::{Data, Filter, Record};
use crumb_core::repo::{Repository, RepositoryHooks};
use crumb_core::schema::{FieldDef, ModelDef, Registry, RelationDef, ScalarType, Validator};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use serde_json::Value;

pub const MIGRATIONS: &[Migration] = &[
    Migration::new(
        1,
        r#"
CREATE TABLE author (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE profile (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bio TEXT NOT NULL,
    author_id INTEGER NOT NULL UNIQUE REFERENCES author(id) ON DELETE CASCADE
);
CREATE TABLE publisher (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE book (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    genre TEXT NOT NULL,
    price REAL,
    author_id INTEGER NOT NULL REFERENCES author(id) ON DELETE CASCADE,
    publisher_id INTEGER REFERENCES publisher(id) ON DELETE SET NULL
);
CREATE TABLE chapter (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    pages INTEGER NOT NULL,
    book_id INTEGER NOT NULL REFERENCES book(id) ON DELETE CASCADE
);
"#,
    ),
    Migration::new(
        2,
        r#"
CREATE TABLE stock_line (
    id TEXT PRIMARY KEY,
    ordering INTEGER NOT NULL,
    owner_id INTEGER NOT NULL REFERENCES book(id) ON DELETE CASCADE,
    warehouse TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    supplier_id INTEGER REFERENCES publisher(id)
);
CREATE UNIQUE INDEX stock_line_owner_ordering ON stock_line(owner_id, ordering);
CREATE TABLE "user" (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    active INTEGER NOT NULL
);
CREATE TABLE archive (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL
);
"#,
    ),
];

/// Rejects chapter titles reserved for failure injection.
struct ChapterHooks;

impl RepositoryHooks for ChapterHooks {
    fn validate_field(
        &self,
        _repo: &Repository<'_>,
        field: &str,
        value: &Value,
        _data: &Data,
    ) -> Option<Result<(), FieldError>> {
        (field == "title" && value.as_str() == Some("boom")).then(|| {
            Err(FieldError::validation_failed(
                "reserved_title",
                "this title is reserved",
            ))
        })
    }
}

/// Hashes the write-only password and hides deactivated users.
struct UserHooks;

impl RepositoryHooks for UserHooks {
    fn validate_field(
        &self,
        _repo: &Repository<'_>,
        field: &str,
        value: &Value,
        _data: &Data,
    ) -> Option<Result<(), FieldError>> {
        let text = value.as_str()?;
        (field == "password" && text.chars().count() < 8).then(|| {
            Err(FieldError::validation_failed(
                "weak_password",
                "password needs at least 8 characters",
            ))
        })
    }

    fn before_insert(&self, row: &mut Data, extra: &Data) -> RepoResult<()> {
        let password = extra
            .get("password")
            .and_then(Value::as_str)
            .ok_or_else(|| RepoError::Rejected("password is required".to_string()))?;
        row.insert("password_hash".to_string(), Value::from(hash(password)));
        Ok(())
    }

    fn before_update(&self, _instance: &Record, row: &mut Data, extra: &Data) -> RepoResult<()> {
        if let Some(password) = extra.get("password").and_then(Value::as_str) {
            row.insert("password_hash".to_string(), Value::from(hash(password)));
        }
        Ok(())
    }

    fn can_delete(&self, instance: &Record) -> RepoResult<()> {
        if instance.get("username").and_then(Value::as_str) == Some("root") {
            return Err(RepoError::Rejected("root cannot be deleted".to_string()));
        }
        Ok(())
    }

    fn default_filters(&self) -> Vec<Filter> {
        vec![Filter::equal("active", true)]
    }
}

pub fn hash(password: &str) -> String {
    format!("hashed:{}", password.chars().rev().collect::<String>())
}

fn build_registry() -> Registry {
    let id = || FieldDef::new("id", ScalarType::Int).generated();
    Registry::new([
        ModelDef::new("author", id())
            .field(FieldDef::new("name", ScalarType::Str).unique().case_insensitive())
            .field(
                FieldDef::new("email", ScalarType::Str)
                    .nullable()
                    .validator(Validator::Pattern(
                        Regex::new(r"^[^@\s]+@[^@\s]+$").expect("valid email pattern"),
                    )),
            )
            .field(FieldDef::new("created_at", ScalarType::DateTime).auto_now_add())
            .field(FieldDef::new("updated_at", ScalarType::DateTime).auto_now()),
        ModelDef::new("profile", id())
            .field(FieldDef::new("bio", ScalarType::Text))
            .relation(RelationDef::one_to_one("author", "author").related_name("profile")),
        ModelDef::new("publisher", id()).field(FieldDef::new("name", ScalarType::Str).unique()),
        ModelDef::new("book", id())
            .field(FieldDef::new("title", ScalarType::Str).validator(Validator::MinLength(2)))
            .field(
                FieldDef::new(
                    "genre",
                    ScalarType::Enum(vec!["novel".to_string(), "essay".to_string()]),
                )
                .default_value("novel"),
            )
            .field(
                FieldDef::new("price", ScalarType::Float)
                    .nullable()
                    .validator(Validator::MinValue(0.0)),
            )
            .relation(RelationDef::foreign_key("author", "author").related_name("books"))
            .relation(
                RelationDef::foreign_key("publisher", "publisher")
                    .nullable()
                    .related_name("catalog"),
            )
            .calculated("chapter_count", ScalarType::Int),
        ModelDef::new("chapter", id())
            .field(FieldDef::new("title", ScalarType::Str))
            .field(
                FieldDef::new("pages", ScalarType::Int)
                    .default_value(1)
                    .validator(Validator::MinValue(1.0)),
            )
            .relation(RelationDef::foreign_key("book", "book").related_name("chapters"))
            .hooks(ChapterHooks),
        ModelDef::values_list("stock_line", "book", "stock")
            .field(FieldDef::new("warehouse", ScalarType::Str))
            .field(FieldDef::new("quantity", ScalarType::Int).validator(Validator::MinValue(0.0)))
            .relation(RelationDef::foreign_key("supplier", "publisher").nullable())
            .extra_allowed("note", ScalarType::Str),
        ModelDef::new("user", FieldDef::new("id", ScalarType::Uuid).generated())
            .field(FieldDef::new("username", ScalarType::Str).unique().case_insensitive())
            .field(FieldDef::new("password_hash", ScalarType::Str))
            .field(FieldDef::new("active", ScalarType::Bool).default_value(true))
            .hidden("password_hash")
            .extra_allowed("password", ScalarType::Str)
            .hooks(UserHooks),
        ModelDef::new("archive", id())
            .field(FieldDef::new("label", ScalarType::Str))
            .read_only(),
    ])
    .expect("test registry is valid")
}

pub static REGISTRY: Lazy<Registry> = Lazy::new(build_registry);

pub fn open() -> Connection {
    open_db_in_memory(MIGRATIONS).unwrap()
}

pub fn data(value: Value) -> Data {
    value.as_object().cloned().expect("payload must be an object")
}

pub fn repo<'r>(conn: &'r Connection, model: &str) -> Repository<'r> {
    REGISTRY.repository(conn, model).unwrap()
}

pub fn create(conn: &Connection, model: &str, payload: Value) -> Record {
    repo(conn, model).create(&data(payload)).unwrap()
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
        row.get(0)
    })
    .unwrap()
}
