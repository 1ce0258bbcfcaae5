mod common;

use common::{Recorder, TestResult};
use sqlocal::prelude::*;

fn rejected(result: Result<SubscriptionHandle, SqlocalError>) -> SqlocalError {
    match result {
        Ok(_) => panic!("subscription should be rejected"),
        Err(err) => err,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unsafe_queries_are_rejected_without_running() -> TestResult {
    let db = ClientBuilder::memory().build().await?;
    db.sql("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)").await?;
    let seen = Recorder::default();

    for sql in [
        "INSERT INTO todos (title) VALUES ('x')",
        "SELECT 1",
        "INSERT INTO todos (title) SELECT title FROM todos",
    ] {
        let err = rejected(
            db.reactive_query(sql)
                .subscribe(seen.on_data(), seen.on_error()),
        );
        assert!(
            matches!(err, SqlocalError::ReactiveContractError(_)),
            "{sql}: {err:?}"
        );
    }

    let err = rejected(
        db.reactive_query("SELEC title FROM todos")
            .subscribe(seen.on_data(), seen.on_error()),
    );
    assert!(matches!(err, SqlocalError::ParseError(_)), "{err:?}");

    assert_eq!(common::count(&db, "todos").await?, 0, "nothing was executed");
    assert_eq!(seen.deliveries(), 0);
    assert!(seen.errors().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn non_reactive_client_refuses_subscriptions() -> TestResult {
    let db = ClientBuilder::memory().reactive(false).build().await?;
    db.sql("CREATE TABLE todos (id INTEGER PRIMARY KEY)").await?;
    let seen = Recorder::default();
    let err = rejected(
        db.reactive_query("SELECT * FROM todos")
            .subscribe(seen.on_data(), seen.on_error()),
    );
    assert!(matches!(err, SqlocalError::ReactiveContractError(_)));
    Ok(())
}

/// A failing run reaches `on_error` and the subscription recovers on the next change.
#[tokio::test(flavor = "multi_thread")]
async fn failed_run_keeps_subscription() -> TestResult {
    let db = ClientBuilder::memory().build().await?;
    let seen = Recorder::default();
    let _live = db
        .reactive_query("SELECT * FROM late")
        .subscribe(seen.on_data(), seen.on_error())?;
    common::eventually("missing table error", || seen.errors().len() == 1).await?;

    db.sql("CREATE TABLE late (id INTEGER)").await?;
    db.sql("INSERT INTO late VALUES (1)").await?;
    common::eventually("recovered result", || seen.latest_len() == Some(1)).await?;
    Ok(())
}
