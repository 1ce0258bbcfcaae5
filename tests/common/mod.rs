#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlocal::prelude::*;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Collects everything a subscription delivers.
#[derive(Clone, Default)]
pub struct Recorder {
    results: Arc<Mutex<Vec<ResultSet>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn on_data(&self) -> impl Fn(&ResultSet) + Send + Sync + 'static {
        let results = Arc::clone(&self.results);
        move |result| results.lock().unwrap().push(result.clone())
    }

    pub fn on_error(&self) -> impl Fn(&SqlocalError) + Send + Sync + 'static {
        let errors = Arc::clone(&self.errors);
        move |err| errors.lock().unwrap().push(err.to_string())
    }

    pub fn results(&self) -> Vec<ResultSet> {
        self.results.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn deliveries(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn latest_len(&self) -> Option<usize> {
        self.results.lock().unwrap().last().map(ResultSet::len)
    }
}

/// Records every `on_connect` reason.
#[derive(Clone, Default)]
pub struct Reasons(Arc<Mutex<Vec<ConnectReason>>>);

impl Reasons {
    pub fn callback(&self) -> impl Fn(ConnectReason) + Send + Sync + 'static {
        let reasons = Arc::clone(&self.0);
        move |reason| reasons.lock().unwrap().push(reason)
    }

    pub fn seen(&self) -> Vec<ConnectReason> {
        self.0.lock().unwrap().clone()
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) -> TestResult {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            return Err(format!("timed out waiting for {what}").into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

pub fn texts(result: &ResultSet, column: &str) -> Vec<String> {
    result
        .results
        .iter()
        .filter_map(|row| row.get(column).and_then(RowValues::as_text).map(str::to_owned))
        .collect()
}

pub async fn count(db: &SqlClient, table: &str) -> Result<i64, SqlocalError> {
    let result = db.sql(format!("SELECT COUNT(*) AS cnt FROM {table}")).await?;
    result
        .scalar()
        .and_then(RowValues::as_int)
        .copied()
        .ok_or_else(|| SqlocalError::DriverMessage("missing count".into()))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
