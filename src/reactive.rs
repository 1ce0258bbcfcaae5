//! Live queries that re-run when the tables they read change.
//!
//! A subscription is admitted only if [`analyze`](crate::analysis::analyze) finds at least
//! one read table and no overlap between read and mutated tables. Effects that arrive while
//! a re-run is in flight collapse into a single trailing re-run, and a result equal to the
//! one subscribers already have is not delivered again.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::SqlocalError;
use crate::results::ResultSet;
use crate::statement::Statement;

mod registry;
mod subscription;

pub(crate) use registry::ReactiveRegistry;

pub type DataCallback = Arc<dyn Fn(&ResultSet) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&SqlocalError) + Send + Sync>;

/// Runs the statements behind subscriptions.
#[async_trait]
pub(crate) trait QueryExecutor: Send + Sync {
    async fn run_query(&self, statement: &Statement) -> Result<ResultSet, SqlocalError>;
}

/// A statement that can be subscribed to. Created by `SqlClient::reactive_query`.
pub struct ReactiveQuery {
    registry: Arc<ReactiveRegistry>,
    statement: Statement,
}

impl ReactiveQuery {
    pub(crate) fn new(registry: Arc<ReactiveRegistry>, statement: Statement) -> Self {
        Self {
            registry,
            statement,
        }
    }

    #[must_use]
    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// Start receiving results. Must be called inside a tokio runtime.
    ///
    /// `on_data` gets the initial result and every later result that differs from the
    /// previous one; `on_error` gets every failed run. Failures do not end the subscription.
    ///
    /// # Errors
    /// Returns [`SqlocalError::ParseError`] for invalid SQL and
    /// [`SqlocalError::ReactiveContractError`] when the query is not reactive-safe or the
    /// client was built with reactivity off. Nothing is executed in either case.
    pub fn subscribe<D, E>(&self, on_data: D, on_error: E) -> Result<SubscriptionHandle, SqlocalError>
    where
        D: Fn(&ResultSet) + Send + Sync + 'static,
        E: Fn(&SqlocalError) + Send + Sync + 'static,
    {
        self.registry
            .subscribe(&self.statement, Arc::new(on_data), Arc::new(on_error))
    }
}

/// Keeps a subscriber attached. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    registry: Weak<ReactiveRegistry>,
    fingerprint: String,
    id: u64,
    active: bool,
}

impl SubscriptionHandle {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.fingerprint, self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
