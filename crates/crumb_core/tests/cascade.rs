mod common;

use common::{count_rows, create, data, open, repo, REGISTRY};
use crumb_core::errors::RepoError;
use crumb_core::orm::{Data, Filter, Record};
use crumb_core::repo::WriteContext;
use rusqlite::Connection;
use serde_json::{json, Value};

fn titles(conn: &Connection, model: &str, filters: &[Filter]) -> Vec<String> {
    let (records, _) = repo(conn, model)
        .list(filters, &["title".to_string()], 0, None)
        .unwrap();
    records
        .iter()
        .filter_map(|record| record.get("title").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn stock_rows(conn: &Connection, book: &Record) -> Vec<(String, i64, String)> {
    REGISTRY
        .values_list(conn, "stock_line")
        .unwrap()
        .owned_by(book.pk.clone())
        .records()
        .unwrap()
        .into_iter()
        .map(|record| {
            (
                record.key(),
                record.get("ordering").and_then(Value::as_i64).unwrap(),
                record
                    .get("warehouse")
                    .and_then(Value::as_str)
                    .unwrap()
                    .to_string(),
            )
        })
        .collect()
}

#[test]
fn nested_forward_object_is_created_first() {
    let conn = open();
    let book = create(
        &conn,
        "book",
        json!({"title": "Dune", "author": {"name": "Frank"}}),
    );

    let author = repo(&conn, "author").get_one_by("name", &json!("Frank")).unwrap();
    assert_eq!(book.get("author_id"), Some(&author.pk));
}

#[test]
fn reverse_relations_are_created_after_the_owner() {
    let conn = open();
    let author = create(
        &conn,
        "author",
        json!({
            "name": "Ann",
            "profile": {"bio": "Writes about sand."},
            "books": [
                {"title": "Dune", "chapters": [{"title": "Arrakis"}, {"title": "Muad'Dib", "pages": 30}]},
                {"title": "Emperor"},
            ],
        }),
    );

    assert_eq!(count_rows(&conn, "profile"), 1);
    let profile = repo(&conn, "author")
        .with_instance(author.clone())
        .current_related("profile")
        .unwrap()
        .unwrap();
    assert_eq!(profile.get("author_id"), Some(&author.pk));

    assert_eq!(
        titles(&conn, "book", &[Filter::equal("author_id", author.pk.clone())]),
        vec!["Dune", "Emperor"]
    );
    assert_eq!(titles(&conn, "chapter", &[]), vec!["Arrakis", "Muad'Dib"]);
    let (chapters, _) = repo(&conn, "chapter").list(&[], &[], 0, None).unwrap();
    assert_eq!(chapters[0].get("pages"), Some(&json!(1)));
    assert_eq!(chapters[1].get("pages"), Some(&json!(30)));
}

#[test]
fn failure_deep_in_the_cascade_rolls_back_everything() {
    let conn = open();
    let payload = data(json!({
        "name": "Ann",
        "books": [{"title": "Dune"}, {"title": null}],
    }));

    let err = repo(&conn, "author")
        .create_with(&payload, Data::new(), WriteContext::root().validate(false))
        .unwrap_err();

    assert!(matches!(err, RepoError::Db(_)));
    assert_eq!(count_rows(&conn, "author"), 0);
    assert_eq!(count_rows(&conn, "book"), 0);
}

#[test]
fn nested_validation_failure_blocks_the_whole_write() {
    let conn = open();
    let err = repo(&conn, "author")
        .create(&data(json!({
            "name": "Ann",
            "books": [{"title": "Dune", "chapters": [{"title": "boom"}]}],
        })))
        .unwrap_err();

    let errors = err.object_errors().unwrap();
    let books = errors.get("books").unwrap().as_list().unwrap();
    let chapters = books
        .get(0)
        .unwrap()
        .get("chapters")
        .unwrap()
        .as_list()
        .unwrap();
    assert_eq!(
        chapters.get(0).unwrap().field("title").unwrap().key(),
        "reserved_title"
    );
    assert_eq!(count_rows(&conn, "author"), 0);
}

#[test]
fn edit_reconciles_reverse_many_children() {
    let conn = open();
    let author = create(
        &conn,
        "author",
        json!({
            "name": "Ann",
            "books": [{"title": "Arrakis"}, {"title": "Dune"}, {"title": "Emperor"}],
        }),
    );
    let other = create(
        &conn,
        "author",
        json!({"name": "Bob", "books": [{"title": "Emma"}]}),
    );
    let dune = repo(&conn, "book")
        .get_one_by("title", &json!("Dune"))
        .unwrap();

    repo(&conn, "author")
        .with_instance(author.clone())
        .edit(&data(json!({
            "books": [
                {"pk": dune.pk, "title": "Dune Messiah"},
                {"title": "Children"},
            ],
        })))
        .unwrap();

    assert_eq!(
        titles(&conn, "book", &[Filter::equal("author_id", author.pk)]),
        vec!["Children", "Dune Messiah"]
    );
    assert_eq!(
        titles(&conn, "book", &[Filter::equal("author_id", other.pk)]),
        vec!["Emma"]
    );
    let messiah = repo(&conn, "book")
        .get_one_by("title", &json!("Dune Messiah"))
        .unwrap();
    assert_eq!(messiah.pk, dune.pk);
    let children = repo(&conn, "book")
        .get_one_by("title", &json!("Children"))
        .unwrap();
    assert_eq!(children.pk, json!(5));
}

#[test]
fn unvalidated_edit_refuses_child_keys_of_the_wrong_type() {
    let conn = open();
    let author = create(
        &conn,
        "author",
        json!({"name": "Ann", "books": [{"title": "Dune"}]}),
    );
    let dune = repo(&conn, "book").get_one_by("title", &json!("Dune")).unwrap();

    let err = repo(&conn, "author")
        .with_instance(author)
        .edit_with(
            &data(json!({"books": [{"pk": dune.key(), "title": "Renamed"}]})),
            Data::new(),
            WriteContext::root().validate(false),
        )
        .unwrap_err();

    assert!(matches!(err, RepoError::InvalidData(_)));
    assert_eq!(titles(&conn, "book", &[]), vec!["Dune"]);
}

#[test]
fn empty_child_list_removes_every_child() {
    let conn = open();
    let author = create(
        &conn,
        "author",
        json!({"name": "Ann", "books": [{"title": "Dune", "chapters": [{"title": "One"}]}]}),
    );

    repo(&conn, "author")
        .with_instance(author)
        .edit(&data(json!({"books": []})))
        .unwrap();

    assert_eq!(count_rows(&conn, "book"), 0);
    assert_eq!(count_rows(&conn, "chapter"), 0);
}

#[test]
fn edit_updates_linked_rows_in_place() {
    let conn = open();
    let book = create(
        &conn,
        "book",
        json!({"title": "Dune", "author": {"name": "Frank"}}),
    );
    let author_id = book.get("author_id").cloned().unwrap();

    let edited = repo(&conn, "book")
        .with_instance(book)
        .edit(&data(json!({"author": {"email": "frank@example.org"}})))
        .unwrap();

    assert_eq!(edited.get("author_id"), Some(&author_id));
    assert_eq!(count_rows(&conn, "author"), 1);
    let author = repo(&conn, "author").get_one(&author_id).unwrap();
    assert_eq!(author.get("email"), Some(&json!("frank@example.org")));
}

#[test]
fn edit_creates_missing_reverse_single_then_updates_it() {
    let conn = open();
    let author = create(&conn, "author", json!({"name": "Ann"}));
    let mut authors = repo(&conn, "author").with_instance(author);

    authors.edit(&data(json!({"profile": {"bio": "First"}}))).unwrap();
    authors.edit(&data(json!({"profile": {"bio": "Second"}}))).unwrap();

    assert_eq!(count_rows(&conn, "profile"), 1);
    let profile = authors.current_related("profile").unwrap().unwrap();
    assert_eq!(profile.get("bio"), Some(&json!("Second")));
}

#[test]
fn values_list_rows_follow_their_owner() {
    let conn = open();
    let author = create(&conn, "author", json!({"name": "Ann"}));
    let book = create(
        &conn,
        "book",
        json!({
            "title": "Dune",
            "author_id": author.pk,
            "stock": {
                "head": ["warehouse", "quantity"],
                "values": [["north", 3], ["south", 0]],
            },
        }),
    );

    let owner = book.key();
    assert_eq!(
        stock_rows(&conn, &book),
        vec![
            (format!("{owner};1"), 1, "north".to_string()),
            (format!("{owner};2"), 2, "south".to_string()),
        ]
    );

    let book = repo(&conn, "book")
        .with_instance(book)
        .edit(&data(json!({
            "stock": {"head": ["quantity", "warehouse"], "values": [[9, "east"]]},
        })))
        .unwrap();
    assert_eq!(
        stock_rows(&conn, &book),
        vec![(format!("{owner};1"), 1, "east".to_string())]
    );
}

#[test]
fn outer_transaction_owns_commit_and_rollback() {
    let conn = open();
    conn.execute_batch("BEGIN IMMEDIATE").unwrap();
    create(
        &conn,
        "author",
        json!({"name": "Ann", "books": [{"title": "Dune"}]}),
    );
    assert!(!conn.is_autocommit());
    conn.execute_batch("ROLLBACK").unwrap();

    assert_eq!(count_rows(&conn, "author"), 0);
    assert_eq!(count_rows(&conn, "book"), 0);
}

#[test]
fn nested_context_skips_validation_and_transaction() {
    let conn = open();
    let author = create(&conn, "author", json!({"name": "Ann"}));
    let defaults = Data::from_iter([("author_id".to_string(), author.pk.clone())]);

    // `x` would fail the title length check
    let book = repo(&conn, "book")
        .create_with(&data(json!({"title": "x"})), defaults, WriteContext::nested())
        .unwrap();

    assert_eq!(book.get("title"), Some(&json!("x")));
    assert!(conn.is_autocommit());
}
