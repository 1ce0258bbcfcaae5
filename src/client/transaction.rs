use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::Response;
use crate::error::{SqlocalError, protocol_error};
use crate::lock::LockToken;
use crate::processor::{InputMessage, QueryKey};
use crate::results::ResultSet;
use crate::statement::{SqlArg, Statement};

use super::ClientInner;

/// An open transaction.
///
/// Statements run through it share one engine transaction. The identity's write lock is
/// held until [`commit`](Transaction::commit) or [`rollback`](Transaction::rollback); a
/// transaction dropped without either is rolled back in the background.
pub struct Transaction {
    client: Arc<ClientInner>,
    id: QueryKey,
    lock: Option<LockToken>,
    finished: bool,
}

impl Transaction {
    pub(super) fn new(client: Arc<ClientInner>, id: QueryKey, lock: Option<LockToken>) -> Self {
        debug!(transaction = %id, "transaction started");
        Self {
            client,
            id,
            lock,
            finished: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> QueryKey {
        self.id
    }

    /// Statement-only view of this transaction, for work that must not commit it.
    #[must_use]
    pub fn scope(&self) -> TransactionScope {
        TransactionScope {
            client: Arc::clone(&self.client),
            id: self.id,
        }
    }

    /// # Errors
    /// Returns the driver error. After a failed statement the transaction can only roll
    /// back: later statements fail and `commit` rolls back and returns the failure.
    pub async fn sql(&self, statement: impl Into<Statement>) -> Result<ResultSet, SqlocalError> {
        run_in(&self.client, self.id, statement.into()).await
    }

    /// # Errors
    /// As [`Transaction::sql`], plus [`SqlocalError::InvalidStatement`] for mixed arguments.
    pub async fn query(&self, sql: &str, args: Vec<SqlArg>) -> Result<ResultSet, SqlocalError> {
        run_in(&self.client, self.id, Statement::from_args(sql, args)?).await
    }

    /// Commit and publish the tables changed inside the transaction as one effect.
    ///
    /// # Errors
    /// Returns the driver error; the engine has rolled back in that case. A transaction
    /// with a failed statement is rolled back and reports that failure.
    pub async fn commit(mut self) -> Result<(), SqlocalError> {
        self.finished = true;
        let tables = self
            .client
            .channel
            .request(InputMessage::TransactionCommit {
                key: QueryKey::new(),
                transaction: self.id,
            })
            .await
            .and_then(Response::into_unit)?;
        debug!(transaction = %self.id, tables = tables.len(), "transaction committed");
        self.client
            .effects
            .publish(&self.client.registry, tables, false);
        Ok(())
    }

    /// # Errors
    /// Returns a connection error if the processor is gone.
    pub async fn rollback(mut self) -> Result<(), SqlocalError> {
        self.finished = true;
        self.client
            .channel
            .request(InputMessage::TransactionRollback {
                key: QueryKey::new(),
                transaction: self.id,
            })
            .await
            .and_then(Response::into_unit)
            .map(|_| ())
    }
}

/// Cloneable handle for running statements inside an open transaction.
///
/// Handed to the closure of [`SqlClient::transaction`](crate::SqlClient::transaction);
/// committing and rolling back stay with the owner.
#[derive(Clone)]
pub struct TransactionScope {
    client: Arc<ClientInner>,
    id: QueryKey,
}

impl TransactionScope {
    #[must_use]
    pub fn id(&self) -> QueryKey {
        self.id
    }

    /// # Errors
    /// As [`Transaction::sql`].
    pub async fn sql(&self, statement: impl Into<Statement>) -> Result<ResultSet, SqlocalError> {
        run_in(&self.client, self.id, statement.into()).await
    }

    /// # Errors
    /// As [`Transaction::query`].
    pub async fn query(&self, sql: &str, args: Vec<SqlArg>) -> Result<ResultSet, SqlocalError> {
        run_in(&self.client, self.id, Statement::from_args(sql, args)?).await
    }
}

async fn run_in(
    client: &ClientInner,
    transaction: QueryKey,
    statement: Statement,
) -> Result<ResultSet, SqlocalError> {
    client.ensure_alive()?;
    let (mut results, _) = client
        .channel
        .request(InputMessage::Query {
            key: QueryKey::new(),
            statement,
            transaction: Some(transaction),
        })
        .await?
        .into_data()?;
    results
        .pop()
        .ok_or_else(|| protocol_error("query produced no result set"))
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let client = Arc::clone(&self.client);
        let lock = self.lock.take();
        let transaction = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let rolled_back = client
                    .channel
                    .request(InputMessage::TransactionRollback {
                        key: QueryKey::new(),
                        transaction,
                    })
                    .await;
                if let Err(err) = rolled_back {
                    warn!(%transaction, error = %err, "rollback of dropped transaction failed");
                }
                drop(lock);
            });
        } else {
            warn!(%transaction, "transaction dropped outside a runtime; it stays open");
        }
    }
}
