//! Caller-facing client.
//!
//! A [`SqlClient`] owns one processor thread and the coordination state around it. Clones
//! share that state; independent clients built on the same [`Host`] share a database
//! identity's lock and effect channels with each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::analyze;
use crate::channel::{Channel, Response};
use crate::driver::{
    DatabaseExport, DriverCapabilities, DriverConfig, ScalarFn, SqliteDriver, StorageTarget,
};
use crate::effects::{EffectBus, EffectRecord};
use crate::error::{SqlocalError, connection_error, protocol_error};
use crate::host::Host;
use crate::identity::{DatabaseIdentity, InstanceKey};
use crate::lock::{Access, LockGuarantees, MutationCoordinator};
use crate::processor::{
    DatabaseInfo, FunctionKind, InputMessage, ProcessorConfig, ProcessorHandle, QueryKey,
};
use crate::reactive::{QueryExecutor, ReactiveQuery, ReactiveRegistry};
use crate::results::ResultSet;
use crate::statement::{SqlArg, Statement};
use crate::types::RowValues;

mod config;
mod transaction;

pub use config::{ClientBuilder, ClientConfig, ConnectCallback, ConnectReason};
pub use transaction::{Transaction, TransactionScope};

/// Handle to a shared database.
///
/// ```rust,no_run
/// use sqlocal::prelude::*;
///
/// # async fn demo() -> Result<(), SqlocalError> {
/// let db = SqlClient::builder(StorageTarget::File { path: "app.sqlite3".into() })
///     .build()
///     .await?;
/// db.sql("CREATE TABLE IF NOT EXISTS todos (id INTEGER PRIMARY KEY, title TEXT)").await?;
/// db.query("INSERT INTO todos (title) VALUES (?)", vec!["milk".into()]).await?;
///
/// let todos = db.reactive_query("SELECT * FROM todos");
/// let _live = todos.subscribe(
///     |rows| println!("{} todos", rows.len()),
///     |err| eprintln!("query failed: {err}"),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqlClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    instance: InstanceKey,
    identity: DatabaseIdentity,
    config: ClientConfig,
    capabilities: DriverCapabilities,
    channel: Arc<Channel>,
    coordinator: MutationCoordinator,
    registry: Arc<ReactiveRegistry>,
    effects: EffectBus,
    on_connect: Option<ConnectCallback>,
    background: CancellationToken,
    destroyed: AtomicBool,
}

impl SqlClient {
    #[must_use]
    pub fn builder(storage: crate::driver::StorageTarget) -> ClientBuilder {
        ClientBuilder::new(storage)
    }

    async fn connect(builder: ClientBuilder) -> Result<Self, SqlocalError> {
        let ClientBuilder {
            config,
            host,
            on_connect,
        } = builder;
        let capabilities = config.storage.capabilities();
        if config.read_only && !capabilities.supports_read_only {
            return Err(SqlocalError::ConfigError(format!(
                "{:?} storage does not support read_only",
                config.storage.storage_type()
            )));
        }

        let host = host.unwrap_or_else(Host::new);
        let instance = InstanceKey::new();
        let identity = DatabaseIdentity::from_target(&config.storage);
        let (processor, output) = ProcessorHandle::spawn(
            SqliteDriver::new(config.storage.clone()),
            &instance.to_string(),
        )?;
        let channel = Arc::new(Channel::new(processor, output));
        let coordinator = MutationCoordinator::new(
            identity.clone(),
            instance,
            Arc::clone(&host),
            Arc::clone(&channel),
            capabilities.exclusive_resource,
        );
        let effects = host.effects(&identity);
        let reactive = config.reactive;

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let executor: Weak<dyn QueryExecutor> = weak.clone();
            ClientInner {
                instance,
                identity,
                capabilities,
                channel,
                coordinator,
                registry: Arc::new(ReactiveRegistry::new(
                    instance,
                    reactive,
                    effects.clone(),
                    executor,
                )),
                effects: EffectBus::new(instance, effects, reactive),
                on_connect,
                background: CancellationToken::new(),
                destroyed: AtomicBool::new(false),
                config,
            }
        });

        inner.coordinator.connect().await?;
        inner
            .channel
            .request(InputMessage::Config {
                key: QueryKey::new(),
                config: inner.processor_config(),
            })
            .await
            .and_then(Response::into_unit)
            .map_err(|err| explain_busy_open(err, &inner.config.storage))?;

        tokio::spawn(follow_replacements(
            Arc::downgrade(&inner),
            inner.effects.subscribe(),
            instance,
            inner.background.clone(),
        ));
        info!(identity = %inner.identity, %instance, "client connected");
        inner.fire_on_connect(ConnectReason::Initial);
        Ok(Self { inner })
    }

    #[must_use]
    pub fn instance_key(&self) -> InstanceKey {
        self.inner.instance
    }

    #[must_use]
    pub fn identity(&self) -> &DatabaseIdentity {
        &self.inner.identity
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn lock_guarantees(&self) -> LockGuarantees {
        self.inner.coordinator.guarantees()
    }

    /// Run one statement. Mutations take the identity's lock and publish their effect.
    ///
    /// # Errors
    /// Returns the driver error for the statement, or a connection error once destroyed.
    pub async fn sql(&self, statement: impl Into<Statement>) -> Result<ResultSet, SqlocalError> {
        self.inner.execute(statement.into()).await
    }

    /// Run SQL with positional values or a single map of named values.
    ///
    /// # Errors
    /// Returns [`SqlocalError::InvalidStatement`] for mixed argument shapes, otherwise as
    /// [`SqlClient::sql`].
    pub async fn query(&self, sql: &str, args: Vec<SqlArg>) -> Result<ResultSet, SqlocalError> {
        self.inner.execute(Statement::from_args(sql, args)?).await
    }

    /// Run statements as one all-or-nothing unit.
    ///
    /// # Errors
    /// Returns the first member failure; nothing from the batch is kept.
    pub async fn batch(&self, statements: Vec<Statement>) -> Result<Vec<ResultSet>, SqlocalError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let mut permit = inner.coordinator.enter(Access::Mutate).await?;
        let pending = inner.channel.send(InputMessage::Batch {
            key: QueryKey::new(),
            statements,
        })?;
        permit.release_order();
        let (results, mutated_tables) = pending.recv().await?.into_data()?;
        inner.effects.publish(&inner.registry, mutated_tables, false);
        Ok(results)
    }

    /// Open a transaction. It holds the write lock and keeps every other request to this
    /// client's processor waiting until it commits or rolls back.
    ///
    /// # Errors
    /// Returns the driver error if the transaction cannot be started.
    pub async fn begin_transaction(&self) -> Result<Transaction, SqlocalError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let mut permit = inner.coordinator.enter(Access::Mutate).await?;
        let key = QueryKey::new();
        let pending = inner.channel.send(InputMessage::TransactionBegin { key })?;
        permit.release_order();
        pending.recv().await?.into_unit()?;
        let lock = permit.take_lock();
        Ok(Transaction::new(Arc::clone(inner), key, lock))
    }

    /// Run `work` inside a transaction: commit when it returns `Ok`, roll back on `Err`.
    ///
    /// ```rust,no_run
    /// # async fn demo(db: sqlocal::SqlClient) -> Result<(), sqlocal::SqlocalError> {
    /// db.transaction(|tx| async move {
    ///     tx.sql("INSERT INTO groceries (name) VALUES ('apples')").await?;
    ///     tx.sql("INSERT INTO groceries (name) VALUES ('pears')").await?;
    ///     Ok(())
    /// })
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// Returns the error from `work` after rolling back, or the commit failure.
    pub async fn transaction<F, Fut, T>(&self, work: F) -> Result<T, SqlocalError>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, SqlocalError>>,
    {
        let transaction = self.begin_transaction().await?;
        match work(transaction.scope()).await {
            Ok(value) => {
                transaction.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = transaction.rollback().await {
                    warn!(error = %rollback, "rollback after failed transaction work failed");
                }
                Err(err)
            }
        }
    }

    /// Register a SQL function whose calls are forwarded to `handler`. SQL sees NULL.
    ///
    /// # Errors
    /// Returns [`SqlocalError::DriverMessage`] if the name is already registered.
    pub async fn create_callback_function(
        &self,
        name: &str,
        handler: impl Fn(Vec<RowValues>) + Send + Sync + 'static,
    ) -> Result<(), SqlocalError> {
        self.inner
            .register_function(name, FunctionKind::Callback)
            .await?;
        self.inner.channel.register_handler(name, Arc::new(handler));
        Ok(())
    }

    /// Register a scalar SQL function evaluated on the processor thread.
    ///
    /// # Errors
    /// Returns [`SqlocalError::DriverMessage`] if the name is already registered.
    pub async fn create_scalar_function(
        &self,
        name: &str,
        func: impl Fn(&[RowValues]) -> Result<RowValues, String> + Send + Sync + 'static,
    ) -> Result<(), SqlocalError> {
        let func: ScalarFn = Arc::new(func);
        self.inner
            .register_function(name, FunctionKind::Scalar(func))
            .await
    }

    /// # Errors
    /// Returns the driver error if the size cannot be read.
    pub async fn get_database_info(&self) -> Result<DatabaseInfo, SqlocalError> {
        self.inner
            .simple_request(|key| InputMessage::GetInfo { key })
            .await?
            .into_info()
    }

    /// # Errors
    /// Returns the driver or I/O error raised while copying the database.
    pub async fn get_database_file(&self) -> Result<DatabaseExport, SqlocalError> {
        self.inner
            .simple_request(|key| InputMessage::Export { key })
            .await?
            .into_buffer()
    }

    /// Replace the database with `bytes`, an image produced by
    /// [`SqlClient::get_database_file`] or any SQLite database file.
    ///
    /// # Errors
    /// Returns [`SqlocalError::DriverMessage`] if `bytes` are not a SQLite database.
    pub async fn overwrite_database_file(&self, bytes: Vec<u8>) -> Result<(), SqlocalError> {
        self.inner
            .replace_database(InputMessage::Import {
                key: QueryKey::new(),
                bytes,
            }, ConnectReason::Overwrite)
            .await
    }

    /// Remove every table, view and trigger.
    ///
    /// # Errors
    /// Returns the driver error raised while clearing.
    pub async fn delete_database_file(&self) -> Result<(), SqlocalError> {
        self.inner
            .replace_database(
                InputMessage::Delete {
                    key: QueryKey::new(),
                },
                ConnectReason::Delete,
            )
            .await
    }

    /// Close and reopen the database handle.
    ///
    /// # Errors
    /// Returns the driver error if the handle cannot be reopened.
    pub async fn reinitialize(&self) -> Result<(), SqlocalError> {
        self.inner
            .replace_database(
                InputMessage::Reinit {
                    key: QueryKey::new(),
                },
                ConnectReason::Reinitialize,
            )
            .await
    }

    #[must_use]
    pub fn reactive_query(&self, statement: impl Into<Statement>) -> ReactiveQuery {
        ReactiveQuery::new(Arc::clone(&self.inner.registry), statement.into())
    }

    /// Close the database, drop every subscription and release held locks.
    ///
    /// # Errors
    /// Returns a connection error if the processor was already gone.
    pub async fn destroy(&self) -> Result<(), SqlocalError> {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.background.cancel();
        inner.registry.shutdown();
        let result = inner
            .channel
            .request(InputMessage::Destroy {
                key: QueryKey::new(),
            })
            .await
            .and_then(Response::into_unit);
        inner.coordinator.shutdown().await;
        info!(identity = %inner.identity, instance = %inner.instance, "client destroyed");
        result.map(|_| ())
    }
}

impl ClientInner {
    fn ensure_alive(&self) -> Result<(), SqlocalError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(connection_error("client destroyed"))
        } else {
            Ok(())
        }
    }

    fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            driver: DriverConfig {
                storage: self.config.storage.clone(),
                read_only: self.config.read_only,
            },
            verbose: self.config.verbose,
            effect_source: self.config.effect_source,
            on_init: self.config.on_init.clone(),
        }
    }

    fn fire_on_connect(&self, reason: ConnectReason) {
        debug!(%reason, identity = %self.identity, "connected");
        if let Some(on_connect) = &self.on_connect {
            on_connect(reason);
        }
    }

    async fn execute(&self, statement: Statement) -> Result<ResultSet, SqlocalError> {
        self.ensure_alive()?;
        let access = if is_read_only(&statement) {
            Access::Read
        } else {
            Access::Mutate
        };
        let mut permit = self.coordinator.enter(access).await?;
        let pending = self.channel.send(InputMessage::Query {
            key: QueryKey::new(),
            statement,
            transaction: None,
        })?;
        permit.release_order();
        let (mut results, mutated_tables) = pending.recv().await?.into_data()?;
        self.effects.publish(&self.registry, mutated_tables, false);
        drop(permit);
        results
            .pop()
            .ok_or_else(|| protocol_error("query produced no result set"))
    }

    /// Requests that neither mutate nor need the write lock.
    async fn simple_request(
        &self,
        build: impl FnOnce(QueryKey) -> InputMessage,
    ) -> Result<Response, SqlocalError> {
        self.ensure_alive()?;
        let mut permit = self.coordinator.enter(Access::Read).await?;
        let pending = self.channel.send(build(QueryKey::new()))?;
        permit.release_order();
        pending.recv().await
    }

    async fn register_function(&self, name: &str, kind: FunctionKind) -> Result<(), SqlocalError> {
        self.simple_request(|key| InputMessage::FunctionRegister {
            key,
            name: name.to_owned(),
            kind,
        })
        .await?
        .into_unit()
        .map(|_| ())
    }

    /// Run a disruptive operation with this client's calls held back until it finishes.
    async fn replace_database(
        &self,
        message: InputMessage,
        reason: ConnectReason,
    ) -> Result<(), SqlocalError> {
        self.ensure_alive()?;
        let permit = self.coordinator.enter(Access::Disruptive).await?;
        let kind = message.kind();
        let tables = self.channel.request(message).await?.into_unit()?;
        info!(identity = %self.identity, operation = kind, "database replaced");
        self.effects.publish(&self.registry, tables, true);
        drop(permit);
        self.fire_on_connect(reason);
        Ok(())
    }

    /// A peer replaced the database: reopen the handle if it may be stale, then re-run
    /// every subscription.
    async fn reopen_after_replacement(&self) {
        if self.capabilities.persisted {
            if !self.capabilities.exclusive_resource {
                // Exclusive handles reopen on their next lock acquisition.
                let reopened = match self.coordinator.enter(Access::Read).await {
                    Ok(_permit) => self
                        .channel
                        .request(InputMessage::Reinit {
                            key: QueryKey::new(),
                        })
                        .await
                        .and_then(Response::into_unit),
                    Err(err) => Err(err),
                };
                if let Err(err) = reopened {
                    warn!(error = %err, "reopening after remote replacement failed");
                }
            }
            self.fire_on_connect(ConnectReason::Replaced);
        }
        self.registry.rerun_all();
    }
}

#[async_trait]
impl QueryExecutor for ClientInner {
    async fn run_query(&self, statement: &Statement) -> Result<ResultSet, SqlocalError> {
        self.execute(statement.clone()).await
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.background.cancel();
        self.registry.shutdown();
    }
}

/// A plain file handle cannot open a path an `exclusive_file` client keeps locked; the
/// exclusive hand-off only runs between exclusive clients.
fn explain_busy_open(err: SqlocalError, storage: &StorageTarget) -> SqlocalError {
    match storage {
        StorageTarget::File { path } if err.is_busy() => SqlocalError::LockError(format!(
            "{} is held by an exclusive_file client; plain and exclusive clients cannot share a path ({err})",
            path.display()
        )),
        _ => err,
    }
}

/// Statements the analyzer cannot prove read-only are treated as mutations.
fn is_read_only(statement: &Statement) -> bool {
    analyze(statement.sql()).is_ok_and(|effects| effects.is_read_only())
}

async fn follow_replacements(
    client: Weak<ClientInner>,
    mut effects: broadcast::Receiver<EffectRecord>,
    origin: InstanceKey,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = effects.recv() => received,
        };
        let Some(client) = client.upgrade() else {
            break;
        };
        match received {
            Ok(record) if record.origin != origin && record.database_replaced => {
                client.reopen_after_replacement().await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "replacement listener lagged; re-running subscriptions");
                client.registry.rerun_all();
            }
            Err(RecvError::Closed) => break,
        }
    }
}
