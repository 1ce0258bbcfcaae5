mod common;

use std::sync::Arc;

use common::{Reasons, Recorder, TestResult, count, eventually};
use sqlocal::prelude::*;
use tempfile::tempdir;

/// Deleting the shared file reaches the peer as a replacement.
#[tokio::test(flavor = "multi_thread")]
async fn delete_is_seen_by_peer_as_replacement() -> TestResult {
    let dir = tempdir()?;
    let path = dir.path().join("shared.sqlite3");
    let host = Host::new();

    let mine = Reasons::default();
    let theirs = Reasons::default();
    let a = ClientBuilder::file(&path)
        .host(Arc::clone(&host))
        .on_connect(mine.callback())
        .build()
        .await?;
    let b = ClientBuilder::file(&path)
        .host(Arc::clone(&host))
        .on_connect(theirs.callback())
        .build()
        .await?;

    a.sql("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)").await?;
    a.sql("INSERT INTO todos (title) VALUES ('keep?')").await?;
    let seen = Recorder::default();
    let _live = b
        .reactive_query("SELECT * FROM todos")
        .subscribe(seen.on_data(), seen.on_error())?;
    eventually("initial result", || seen.latest_len() == Some(1)).await?;

    a.delete_database_file().await?;
    assert_eq!(mine.seen(), vec![ConnectReason::Initial, ConnectReason::Delete]);
    eventually("peer replacement", || {
        theirs.seen() == vec![ConnectReason::Initial, ConnectReason::Replaced]
    })
    .await?;
    eventually("table gone", || !seen.errors().is_empty()).await?;

    a.sql("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)").await?;
    a.sql("INSERT INTO todos (title) VALUES ('fresh'), ('start')").await?;
    eventually("recreated rows", || seen.latest_len() == Some(2)).await?;
    Ok(())
}

/// Overwriting a file database replaces the peer's view of it.
#[tokio::test(flavor = "multi_thread")]
async fn overwrite_reaches_peer() -> TestResult {
    let dir = tempdir()?;
    let path = dir.path().join("overwritten.sqlite3");
    let host = Host::new();

    let template = ClientBuilder::memory().build().await?;
    template.sql("CREATE TABLE items (id INTEGER)").await?;
    template.sql("INSERT INTO items VALUES (1), (2), (3)").await?;
    let image = template.get_database_file().await?;

    let a = ClientBuilder::file(&path).host(Arc::clone(&host)).build().await?;
    let b = ClientBuilder::file(&path).host(Arc::clone(&host)).build().await?;
    a.overwrite_database_file(image.bytes).await?;
    assert_eq!(count(&b, "items").await?, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn destroyed_client_refuses_work() -> TestResult {
    let db = ClientBuilder::memory().build().await?;
    db.destroy().await?;
    db.destroy().await?;
    let err = db.sql("SELECT 1").await.err().ok_or("destroyed client ran SQL")?;
    assert!(matches!(err, SqlocalError::ConnectionError(_)), "{err:?}");
    Ok(())
}
