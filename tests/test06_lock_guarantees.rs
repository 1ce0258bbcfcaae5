mod common;

use std::sync::Arc;

use common::{TestResult, count};
use sqlocal::prelude::*;
use tempfile::tempdir;

#[tokio::test(flavor = "multi_thread")]
async fn default_host_coordinates_writes() -> TestResult {
    let db = ClientBuilder::memory().build().await?;
    assert_eq!(db.lock_guarantees(), LockGuarantees::Coordinated);
    Ok(())
}

/// Without a lock facility writes still work; only cross-context serialization is lost.
#[tokio::test(flavor = "multi_thread")]
async fn host_without_locks_degrades() -> TestResult {
    let dir = tempdir()?;
    let path = dir.path().join("degraded.sqlite3");
    let host = Host::without_locks();
    let a = ClientBuilder::file(&path).host(Arc::clone(&host)).build().await?;
    let b = ClientBuilder::file(&path).host(Arc::clone(&host)).build().await?;
    assert_eq!(a.lock_guarantees(), LockGuarantees::Degraded);
    assert_eq!(b.lock_guarantees(), LockGuarantees::Degraded);

    a.sql("CREATE TABLE counters (id INTEGER PRIMARY KEY)").await?;
    let (first, second) = tokio::join!(
        a.sql("INSERT INTO counters DEFAULT VALUES"),
        b.sql("INSERT INTO counters DEFAULT VALUES"),
    );
    first?;
    second?;
    assert_eq!(count(&a, "counters").await?, 2);
    Ok(())
}

/// Clients on distinct hosts share nothing but the file itself.
#[tokio::test(flavor = "multi_thread")]
async fn separate_hosts_do_not_share_identity_channels() -> TestResult {
    let dir = tempdir()?;
    let path = dir.path().join("isolated.sqlite3");
    let a = ClientBuilder::file(&path).build().await?;
    let b = ClientBuilder::file(&path).build().await?;
    assert_eq!(a.identity(), b.identity());
    assert_ne!(a.instance_key(), b.instance_key());

    a.sql("CREATE TABLE t (id INTEGER)").await?;
    a.sql("INSERT INTO t VALUES (1)").await?;
    assert_eq!(count(&b, "t").await?, 1);
    Ok(())
}
