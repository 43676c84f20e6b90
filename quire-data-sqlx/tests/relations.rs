mod common;

use quire_data::{predicate, DataError, JoinOptions, QueryError, Record, Value};
use quire_data_sqlx::{CreateOptions, Instance, RevisionOptions};

fn names(rows: &[Instance]) -> Vec<String> {
    let mut names: Vec<String> = rows
        .iter()
        .filter_map(|r| r.get_value("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_many_to_many_loads_in_one_statement() {
    let dal = common::connect().await;
    let books = dal.model(common::books().unwrap()).unwrap();
    let authors = dal.model(common::authors().unwrap()).unwrap();
    let user = common::user();

    let mut people = Vec::new();
    for name in ["ann", "bob", "cy"] {
        people.push(
            authors
                .create(Record::new().with("name", name), CreateOptions::default())
                .await
                .unwrap(),
        );
    }
    let first = books
        .create(Record::new().with("title", "first"), CreateOptions::by(user))
        .await
        .unwrap();
    let second = books
        .create(Record::new().with("title", "second"), CreateOptions::by(user))
        .await
        .unwrap();

    let mut tx = dal.begin().await.unwrap();
    books.attach_in(&mut tx, "coauthors", &first, &people[0]).await.unwrap();
    books.attach_in(&mut tx, "coauthors", &first, &people[1]).await.unwrap();
    books.attach_in(&mut tx, "coauthors", &second, &people[2]).await.unwrap();
    tx.commit().await.unwrap();

    let before = dal.statement_count();
    let loaded = books
        .query()
        .get_join("coauthors")
        .order_by("title", true)
        .run()
        .await
        .unwrap();
    assert_eq!(dal.statement_count(), before + 2);

    assert_eq!(loaded.len(), 2);
    let first_authors = loaded[0].related("coauthors").unwrap().as_many();
    let second_authors = loaded[1].related("coauthors").unwrap().as_many();
    assert_eq!(names(first_authors), vec!["ann", "bob"]);
    assert_eq!(names(second_authors), vec!["cy"]);
}

#[tokio::test]
async fn test_one_and_many_across_cyclic_manifests() {
    let dal = common::connect().await;
    let authors = dal.model(common::authors().unwrap()).unwrap();
    let books = dal.model(common::books().unwrap()).unwrap();
    let user = common::user();

    let ann = authors
        .create(Record::new().with("name", "ann"), CreateOptions::default())
        .await
        .unwrap();
    let ann_id = ann.id().unwrap();
    for title in ["a", "b"] {
        books
            .create(
                Record::new().with("title", title).with("authorId", ann_id),
                CreateOptions::by(user),
            )
            .await
            .unwrap();
    }
    books
        .create(Record::new().with("title", "orphan"), CreateOptions::by(user))
        .await
        .unwrap();

    let with_author = books
        .query()
        .get_join("author")
        .order_by("title", true)
        .run()
        .await
        .unwrap();
    let owners: Vec<Option<String>> = with_author
        .iter()
        .map(|b| {
            b.related("author")
                .and_then(|r| r.as_one())
                .and_then(|a| a.get_value("name"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect();
    assert_eq!(owners, vec![Some("ann".into()), Some("ann".into()), None]);

    let ann = authors
        .filter_where(predicate! { "id" => ann_id })
        .get_join_with("books", JoinOptions::new().order_by("title", false))
        .first()
        .await
        .unwrap()
        .unwrap();
    let titles: Vec<_> = ann
        .related("books")
        .unwrap()
        .as_many()
        .iter()
        .filter_map(|b| b.get_value("title").and_then(Value::as_str))
        .collect();
    assert_eq!(titles, vec!["b", "a"]);
}

#[tokio::test]
async fn test_joined_rows_follow_visibility() {
    let dal = common::connect().await;
    let authors = dal.model(common::authors().unwrap()).unwrap();
    let books = dal.model(common::books().unwrap()).unwrap();
    let user = common::user();

    let ann = authors
        .create(Record::new().with("name", "ann"), CreateOptions::default())
        .await
        .unwrap();
    let ann_id = ann.id().unwrap();
    let book = books
        .create(
            Record::new().with("title", "draft").with("authorId", ann_id),
            CreateOptions::by(user),
        )
        .await
        .unwrap();
    book.new_revision(user, RevisionOptions::new().set("title", "final"))
        .await
        .unwrap();

    let current = authors
        .filter_where(predicate! { "id" => ann_id })
        .get_join("books")
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.related("books").unwrap().as_many().len(), 1);

    let all = authors
        .filter_where(predicate! { "id" => ann_id })
        .get_join_with("books", JoinOptions::new().include_stale(true))
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(all.related("books").unwrap().as_many().len(), 2);
}

#[tokio::test]
async fn test_empty_results_skip_relation_statements() {
    let dal = common::connect().await;
    let books = dal.model(common::books().unwrap()).unwrap();
    let before = dal.statement_count();
    let rows = books.query().get_join("coauthors").run().await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(dal.statement_count(), before + 1);
}

#[tokio::test]
async fn test_unknown_relation_is_reported() {
    let dal = common::connect().await;
    let books = dal.model(common::books().unwrap()).unwrap();
    books
        .create(Record::new().with("title", "t"), CreateOptions::by(common::user()))
        .await
        .unwrap();
    let err = books.query().get_join("reviews").run().await.unwrap_err();
    assert!(matches!(err, DataError::Query(QueryError::UnknownRelation { .. })));
}
