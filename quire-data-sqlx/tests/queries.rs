mod common;

use chrono::{TimeZone, Utc};
use quire_data::{ops, predicate, DataError, Pageable, QueryError, Record, Value};
use quire_data_sqlx::{CreateOptions, Dal, Model};

async fn seed(dal: &Dal) -> Model {
    let things = dal.model(common::things().unwrap()).unwrap();
    let user = common::user();
    let rows = [
        ("alpha", 5, vec!["red", "blue"]),
        ("beta", 10, vec!["green"]),
        ("gamma", 15, vec!["blue"]),
        ("delta", 20, vec![]),
    ];
    for (label, score, tags) in rows {
        things
            .create(
                Record::new()
                    .with("label", label)
                    .with("score", score)
                    .with("tags", tags),
                CreateOptions::by(user),
            )
            .await
            .unwrap();
    }
    things
}

fn labels(rows: &[quire_data_sqlx::Instance]) -> Vec<String> {
    rows.iter()
        .map(|r| r.get_value("label").and_then(Value::as_str).unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_between_is_inclusive() {
    let dal = common::connect().await;
    let things = seed(&dal).await;
    let rows = things
        .filter_where(predicate! { "score" => ops::between(10, 15) })
        .order_by("score", true)
        .run()
        .await
        .unwrap();
    assert_eq!(labels(&rows), vec!["beta", "gamma"]);
}

#[tokio::test]
async fn test_empty_in_sends_no_statement() {
    let dal = common::connect().await;
    let things = seed(&dal).await;
    let before = dal.statement_count();

    let rows = things
        .filter_where(predicate! { "label" => ops::is_in(Vec::<String>::new()) })
        .run()
        .await
        .unwrap();
    assert!(rows.is_empty());
    let count = things
        .query()
        .where_in("score", Vec::<i64>::new())
        .count()
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert_eq!(dal.statement_count(), before);
}

#[tokio::test]
async fn test_array_membership_operators() {
    let dal = common::connect().await;
    let things = seed(&dal).await;

    let any = things
        .filter_where(predicate! { "tags" => ops::contains_any(["red", "green"]) })
        .order_by("label", true)
        .run()
        .await
        .unwrap();
    assert_eq!(labels(&any), vec!["alpha", "beta"]);

    let all = things
        .filter_where(predicate! { "tags" => ops::contains_all(["red", "blue"]) })
        .run()
        .await
        .unwrap();
    assert_eq!(labels(&all), vec!["alpha"]);

    let blue = things
        .filter_where(predicate! { "tags" => ops::contains_any(["blue"]) })
        .count()
        .await
        .unwrap();
    assert_eq!(blue, 2);
}

#[tokio::test]
async fn test_or_groups_are_bracketed() {
    let dal = common::connect().await;
    let things = seed(&dal).await;

    // score > 12 AND (label = alpha OR label = gamma)
    let rows = things
        .filter_where(predicate! { "score" => ops::gt(12) })
        .or(predicate! { "label" => "alpha" }.field("label", "gamma"))
        .run()
        .await
        .unwrap();
    assert_eq!(labels(&rows), vec!["gamma"]);
}

#[tokio::test]
async fn test_negation_and_comparisons() {
    let dal = common::connect().await;
    let things = seed(&dal).await;

    let rows = things
        .filter_where(predicate! {
            "score" => ops::not(ops::gte(15)),
            "label" => ops::neq("alpha"),
        })
        .run()
        .await
        .unwrap();
    assert_eq!(labels(&rows), vec!["beta"]);
}

#[tokio::test]
async fn test_invalid_operator_is_rejected() {
    let dal = common::connect().await;
    let things = seed(&dal).await;

    let err = things
        .filter_where(predicate! { "label" => ops::contains_any(["a"]) })
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Query(QueryError::InvalidOperator { .. })));

    let err = things
        .filter_where(predicate! { "nope" => 1 })
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Query(QueryError::UnknownField { .. })));
}

#[tokio::test]
async fn test_paginate() {
    let dal = common::connect().await;
    let things = seed(&dal).await;

    let page = things
        .query()
        .paginate(&Pageable::new(1, 3).sorted("score,desc"))
        .await
        .unwrap();
    assert_eq!(page.total_elements, 4);
    assert_eq!(page.total_pages, 2);
    assert_eq!(labels(&page.content), vec!["alpha"]);

    let first = things
        .query()
        .order_by("score", true)
        .paginate(&Pageable::new(0, 2))
        .await
        .unwrap();
    assert_eq!(labels(&first.content), vec!["alpha", "beta"]);
}

#[tokio::test]
async fn test_increment_and_decrement() {
    let dal = common::connect().await;
    let things = seed(&dal).await;

    let changed = things
        .filter_where(predicate! { "label" => "alpha" })
        .increment("score", 3)
        .await
        .unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].1, Value::Int(8));

    let changed = things
        .filter_where(predicate! { "score" => ops::gte(15) })
        .decrement("score", 5)
        .await
        .unwrap();
    let mut values: Vec<_> = changed.iter().filter_map(|(_, v)| v.as_i64()).collect();
    values.sort();
    assert_eq!(values, vec![10, 15]);

    let err = things
        .query()
        .increment("label", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Query(QueryError::InvalidOperator { .. })));
}

#[tokio::test]
async fn test_awaiting_a_query_runs_it() {
    let dal = common::connect().await;
    let things = seed(&dal).await;
    let rows = things.filter_where(predicate! { "label" => "beta" }).await.unwrap();
    assert_eq!(labels(&rows), vec!["beta"]);
}

#[tokio::test]
async fn test_dates_compare_chronologically() {
    let dal = common::connect().await;
    let notes = dal.model(common::notes().unwrap()).unwrap();
    for (title, day) in [("early", 1), ("middle", 15), ("late", 28)] {
        notes
            .create(
                Record::new()
                    .with("title", title)
                    .with("createdOn", Utc.with_ymd_and_hms(2024, 2, day, 12, 0, 0).unwrap()),
                CreateOptions::default(),
            )
            .await
            .unwrap();
    }
    let since = Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap();
    let rows = notes
        .filter_where(predicate! { "createdOn" => ops::gt(since) })
        .order_by("createdOn", true)
        .run()
        .await
        .unwrap();
    let titles: Vec<_> = rows
        .iter()
        .filter_map(|r| r.get_value("title").and_then(Value::as_str))
        .collect();
    assert_eq!(titles, vec!["middle", "late"]);
}

#[tokio::test]
async fn test_plain_bulk_delete() {
    let dal = common::connect().await;
    let notes = dal.model(common::notes().unwrap()).unwrap();
    for title in ["a", "b", "c"] {
        notes
            .create(Record::new().with("title", title), CreateOptions::default())
            .await
            .unwrap();
    }
    let removed = notes
        .filter_where(predicate! { "title" => ops::is_in(["a", "b"]) })
        .delete()
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(notes.query().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_reads_inside_a_transaction_use_its_connection() {
    // A single pooled connection: any read that acquired its own would
    // wait for the transaction and time out.
    let config = quire_data_sqlx::DalConfig {
        acquire_timeout_ms: 100,
        ..quire_data_sqlx::DalConfig::in_memory()
    };
    let dal = common::connect_with(config).await;
    let notes = dal.model(common::notes().unwrap()).unwrap();

    let mut tx = dal.begin().await.unwrap();
    let note = notes
        .create_in(
            &mut tx,
            Record::new().with("title", "pinned").with("views", 3),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    let id = note.id().unwrap();

    assert_eq!(notes.query().count_in(&mut tx).await.unwrap(), 1);
    let loaded = notes.get_in(&mut tx, id).await.unwrap();
    assert_eq!(loaded.get_value("title"), Some(&Value::Text("pinned".into())));

    let changed = notes
        .filter_where(predicate! { "id" => id })
        .decrement_in(&mut tx, "views", 1)
        .await
        .unwrap();
    assert_eq!(changed, vec![(id, Value::Int(2))]);

    let page = notes
        .query()
        .paginate_in(&mut tx, &Pageable::new(0, 10))
        .await
        .unwrap();
    assert_eq!(page.total_elements, 1);
    assert_eq!(page.content.len(), 1);
    tx.commit().await.unwrap();

    assert_eq!(notes.query().count().await.unwrap(), 1);
}
