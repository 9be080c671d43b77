mod common;

use common::{count_rows, create, data, hash, open, repo, REGISTRY};
use crumb_core::errors::{ConfigError, RepoError};
use crumb_core::orm::Filter;
use serde_json::{json, Value};

fn names(records: &[crumb_core::orm::Record]) -> Vec<&str> {
    records
        .iter()
        .filter_map(|record| record.get("name").and_then(Value::as_str))
        .collect()
}

#[test]
fn create_binds_and_returns_the_stored_row() {
    let conn = open();
    let mut authors = repo(&conn, "author");

    let created = authors.create(&data(json!({"name": "Ann"}))).unwrap();

    assert_eq!(created.model, "author");
    assert_eq!(created.pk, json!(1));
    assert_eq!(created.get("name"), Some(&json!("Ann")));
    assert_eq!(created.get("email"), Some(&Value::Null));
    let created_at = created.get("created_at").and_then(Value::as_str).unwrap();
    assert!(created_at.ends_with('Z'));
    assert_eq!(authors.instance(), Some(&created));
}

#[test]
fn defaults_fill_omitted_columns() {
    let conn = open();
    let author = create(&conn, "author", json!({"name": "Ann"}));
    let book = create(&conn, "book", json!({"title": "Dune", "author_id": author.pk}));

    assert_eq!(book.get("genre"), Some(&json!("novel")));
    assert_eq!(book.get("price"), Some(&Value::Null));
    assert_eq!(book.get("publisher_id"), Some(&Value::Null));
}

#[test]
fn invalid_create_writes_nothing() {
    let conn = open();
    let mut books = repo(&conn, "book");

    let err = books.create(&data(json!({"title": "Dune"}))).unwrap_err();

    assert!(matches!(err, RepoError::Invalid(_)));
    assert!(books.instance().is_none());
    assert_eq!(count_rows(&conn, "book"), 0);
}

#[test]
fn create_on_a_bound_repository_is_refused() {
    let conn = open();
    let mut authors = repo(&conn, "author");
    authors.create(&data(json!({"name": "Ann"}))).unwrap();

    let err = authors.create(&data(json!({"name": "Bob"}))).unwrap_err();
    assert!(matches!(err, RepoError::Config(ConfigError::InstanceNotExpected { .. })));
}

#[test]
fn edit_applies_supplied_fields_and_refreshes_timestamps() {
    let conn = open();
    let author = create(&conn, "author", json!({"name": "Ann"}));
    conn.execute(
        "UPDATE author SET updated_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
        [1],
    )
    .unwrap();

    let mut editing = repo(&conn, "author").load(author.pk.clone()).unwrap();
    let edited = editing
        .edit(&data(json!({"email": "ann@example.org"})))
        .unwrap();

    assert_eq!(edited.get("name"), Some(&json!("Ann")));
    assert_eq!(edited.get("email"), Some(&json!("ann@example.org")));
    assert_eq!(edited.get("created_at"), author.get("created_at"));
    assert_ne!(
        edited.get("updated_at"),
        Some(&json!("2000-01-01T00:00:00.000Z"))
    );
    assert_eq!(editing.instance(), Some(&edited));
}

#[test]
fn edit_without_instance_is_refused() {
    let conn = open();
    let err = repo(&conn, "author")
        .edit(&data(json!({"name": "Ann"})))
        .unwrap_err();
    assert!(matches!(
        err,
        RepoError::Config(ConfigError::InstanceRequired { method: "edit", .. })
    ));
}

#[test]
fn get_one_by_key_and_by_field() {
    let conn = open();
    let ann = create(&conn, "author", json!({"name": "Ann"}));
    let authors = repo(&conn, "author");

    assert_eq!(authors.get_one(&ann.pk).unwrap(), ann);
    assert_eq!(authors.get_one_by("name", &json!("aNN")).unwrap(), ann);

    let err = authors.get_one(&json!(99)).unwrap_err();
    assert!(matches!(err, RepoError::NotFound { ref key, .. } if key == "99"));
    let err = authors.get_one(&json!("one")).unwrap_err();
    assert!(matches!(err, RepoError::NotFound { .. }));
    let err = authors.get_one_by("name", &json!("Zed")).unwrap_err();
    assert!(matches!(err, RepoError::NotFound { ref key, .. } if key == "name=Zed"));
    let err = authors.get_one_by("nickname", &json!("Ann")).unwrap_err();
    assert!(matches!(err, RepoError::Config(ConfigError::UnknownField { .. })));
}

#[test]
fn get_many_skips_missing_keys() {
    let conn = open();
    let ann = create(&conn, "author", json!({"name": "Ann"}));
    let bob = create(&conn, "author", json!({"name": "Bob"}));

    let found = repo(&conn, "author")
        .get_many(&[bob.pk.clone(), json!(42), ann.pk.clone(), json!("x")])
        .unwrap();
    assert_eq!(names(&found), vec!["Ann", "Bob"]);
}

#[test]
fn list_filters_sorts_and_pages_with_total() {
    let conn = open();
    for name in ["Cleo", "ann", "Bob", "Abe"] {
        create(&conn, "author", json!({"name": name}));
    }
    let authors = repo(&conn, "author");

    let (page, total) = authors
        .list(&[], &["-name".to_string()], 1, Some(2))
        .unwrap();
    assert_eq!(total, 4);
    // sorting is binary; lowercase sorts after uppercase
    assert_eq!(names(&page), vec!["Cleo", "Bob"]);

    let (found, total) = authors
        .list(&[Filter::starts_with("name", "A")], &["name".to_string()], 0, None)
        .unwrap();
    assert_eq!(total, 2);
    assert_eq!(names(&found), vec!["Abe", "ann"]);

    let (found, _) = authors
        .list(&[Filter::one_of("id", [1, 3])], &[], 0, None)
        .unwrap();
    assert_eq!(names(&found), vec!["Cleo", "Bob"]);

    let (found, total) = authors
        .list(&[Filter::one_of("id", Vec::<i64>::new())], &[], 0, None)
        .unwrap();
    assert!(found.is_empty());
    assert_eq!(total, 0);
}

#[test]
fn list_rejects_unknown_sort_and_filter_fields() {
    let conn = open();
    let authors = repo(&conn, "author");

    let err = authors.list(&[], &["age".to_string()], 0, None).unwrap_err();
    assert!(matches!(err, RepoError::Config(ConfigError::InvalidSort { .. })));

    let err = authors
        .list(&[Filter::equal("age", 3)], &[], 0, None)
        .unwrap_err();
    assert!(matches!(err, RepoError::Config(ConfigError::InvalidFilter { .. })));
}

#[test]
fn default_filters_hide_rows_from_every_read() {
    let conn = open();
    let ann = create(&conn, "user", json!({"username": "ann", "password": "correct horse"}));
    create(&conn, "user", json!({"username": "bob", "password": "battery staple"}));
    conn.execute(
        "UPDATE \"user\" SET active = 0 WHERE username = 'bob'",
        [],
    )
    .unwrap();

    let users = repo(&conn, "user");
    let (visible, total) = users.list(&[], &[], 0, None).unwrap();
    assert_eq!(total, 1);
    assert_eq!(visible[0].pk, ann.pk);
    assert!(matches!(
        users.get_one_by("username", &json!("bob")).unwrap_err(),
        RepoError::NotFound { .. }
    ));
}

#[test]
fn insert_hook_derives_hidden_columns_from_extra_input() {
    let conn = open();
    let mut users = repo(&conn, "user");
    let created = users
        .create(&data(json!({"username": "ann", "password": "correct horse"})))
        .unwrap();

    assert!(uuid::Uuid::parse_str(created.pk.as_str().unwrap()).is_ok());
    assert_eq!(created.get("active"), Some(&json!(true)));
    assert_eq!(
        created.get("password_hash"),
        Some(&json!(hash("correct horse")))
    );
    assert!(created.get("password").is_none());

    let edited = users
        .edit(&data(json!({"password": "new secret value"})))
        .unwrap();
    assert_eq!(
        edited.get("password_hash"),
        Some(&json!(hash("new secret value")))
    );
}

#[test]
fn hook_rejection_rolls_back_the_create() {
    let conn = open();
    let mut users = repo(&conn, "user");
    let err = users.create(&data(json!({"username": "ann"}))).unwrap_err();

    assert!(matches!(err, RepoError::Rejected(_)));
    assert_eq!(count_rows(&conn, "user"), 0);
}

#[test]
fn delete_removes_the_bound_row() {
    let conn = open();
    let ann = create(&conn, "author", json!({"name": "Ann"}));

    let mut authors = repo(&conn, "author").with_instance(ann);
    authors.delete().unwrap();

    assert!(authors.instance().is_none());
    assert_eq!(count_rows(&conn, "author"), 0);
    assert!(matches!(
        authors.delete().unwrap_err(),
        RepoError::Config(ConfigError::InstanceRequired { method: "delete", .. })
    ));
}

#[test]
fn delete_hook_keeps_protected_rows() {
    let conn = open();
    let root = create(&conn, "user", json!({"username": "root", "password": "toor toor"}));
    let ann = create(&conn, "user", json!({"username": "ann", "password": "correct horse"}));

    let mut protected = repo(&conn, "user").with_instance(root.clone());
    assert!(matches!(protected.delete().unwrap_err(), RepoError::Rejected(_)));
    assert_eq!(protected.instance(), Some(&root));

    let err = repo(&conn, "user")
        .delete_many(&[ann.pk.clone(), root.pk.clone()])
        .unwrap_err();
    assert!(matches!(err, RepoError::Rejected(_)));
    assert_eq!(count_rows(&conn, "user"), 2);

    assert_eq!(repo(&conn, "user").delete_many(&[ann.pk]).unwrap(), 1);
    assert_eq!(count_rows(&conn, "user"), 1);
}

#[test]
fn read_only_models_refuse_writes() {
    let conn = open();
    conn.execute("INSERT INTO archive (label) VALUES ('old')", []).unwrap();
    let mut archive = repo(&conn, "archive");

    let (rows, total) = archive.list(&[], &[], 0, None).unwrap();
    assert_eq!(total, 1);

    let err = archive.create(&data(json!({"label": "new"}))).unwrap_err();
    assert!(matches!(
        err,
        RepoError::Config(ConfigError::ReadOnly { method: "create", .. })
    ));

    let mut loaded = archive.with_instance(rows[0].clone());
    assert!(matches!(
        loaded.delete().unwrap_err(),
        RepoError::Config(ConfigError::ReadOnly { method: "delete", .. })
    ));
    assert_eq!(count_rows(&conn, "archive"), 1);
}

#[test]
fn values_lists_do_not_open_as_plain_repositories() {
    let conn = open();
    let err = REGISTRY.repository(&conn, "stock_line").unwrap_err();
    assert!(matches!(err, ConfigError::InvalidModel { .. }));

    let err = REGISTRY.repository(&conn, "ghost").unwrap_err();
    assert!(matches!(err, ConfigError::UnknownModel(_)));
}

#[test]
fn second_create_with_same_unique_value_fails() {
    let conn = open();
    create(&conn, "publisher", json!({"name": "Chilton"}));

    let err = repo(&conn, "publisher")
        .create(&data(json!({"name": "Chilton"})))
        .unwrap_err();
    let errors = err.object_errors().unwrap();
    assert_eq!(errors.field("name").unwrap().key(), "not_unique");
    assert_eq!(count_rows(&conn, "publisher"), 1);
}

#[test]
fn re_editing_with_stored_values_changes_nothing() {
    let conn = open();
    let author = create(&conn, "author", json!({"name": "Ann"}));
    let book = create(
        &conn,
        "book",
        json!({"title": "Dune", "price": 9.5, "author_id": author.pk}),
    );

    let same = data(json!({
        "title": "Dune",
        "genre": "novel",
        "price": 9.5,
        "author_id": author.pk,
        "publisher_id": null,
    }));
    let edited = repo(&conn, "book").with_instance(book.clone()).edit(&same).unwrap();
    assert_eq!(edited, book);
}

#[test]
fn created_scalars_round_trip_through_get_one() {
    let conn = open();
    let author = create(&conn, "author", json!({"name": "Ann"}));
    let book = create(
        &conn,
        "book",
        json!({"title": "Essays", "genre": "essay", "price": 12.25, "author_id": author.pk}),
    );

    let loaded = repo(&conn, "book").get_one(&book.pk).unwrap();
    assert_eq!(loaded.get("title"), Some(&json!("Essays")));
    assert_eq!(loaded.get("genre"), Some(&json!("essay")));
    assert_eq!(loaded.get("price"), Some(&json!(12.25)));
    assert_eq!(loaded.get("author_id"), Some(&author.pk));
}
