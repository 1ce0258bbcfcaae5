use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::analysis::analyze;
use crate::driver::{ScalarFn, StorageDriver};
use crate::effects::EffectSource;
use crate::error::{SqlocalError, connection_error, protocol_error};
use crate::statement::Statement;
use crate::types::RowValues;

use super::messages::{
    DatabaseInfo, FunctionKind, InputMessage, OutputMessage, ProcessorConfig, QueryKey,
};

/// Keys remembered for duplicate detection.
const KEY_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No live handle. `awaiting_init` separates "hold requests until a handle is ready"
    /// from "the handle failed; reject requests".
    Uninitialized { awaiting_init: bool },
    Ready,
    InTransaction(QueryKey),
    Destroyed,
}

pub(super) fn run_processor<D: StorageDriver>(
    driver: D,
    receiver: &Receiver<InputMessage>,
    output: UnboundedSender<OutputMessage>,
) {
    let mut processor = Processor::new(driver, output);
    while let Ok(message) = receiver.recv() {
        let key = message.key();
        let handled = panic::catch_unwind(AssertUnwindSafe(|| processor.handle(message)));
        if handled.is_err() {
            // Handle state is unknown after a panic; the channel fails every other waiter.
            error!(%key, "processor panicked while handling a request; shutting down");
            processor.reply_error(key, connection_error("processor panicked"));
            break;
        }
        if processor.is_destroyed() {
            break;
        }
    }
    processor.shutdown();
}

/// Single-threaded owner of one database handle.
pub(crate) struct Processor<D: StorageDriver> {
    driver: D,
    output: UnboundedSender<OutputMessage>,
    config: Option<ProcessorConfig>,
    state: State,
    queue: VecDeque<InputMessage>,
    recent_keys: RecentKeys,
    functions: BTreeMap<String, FunctionKind>,
    tx_tables: BTreeSet<String>,
    /// First member failure of the open transaction; commit turns into rollback.
    tx_failure: Option<String>,
}

impl<D: StorageDriver> Processor<D> {
    pub(crate) fn new(driver: D, output: UnboundedSender<OutputMessage>) -> Self {
        Self {
            driver,
            output,
            config: None,
            state: State::Uninitialized {
                awaiting_init: true,
            },
            queue: VecDeque::new(),
            recent_keys: RecentKeys::default(),
            functions: BTreeMap::new(),
            tx_tables: BTreeSet::new(),
            tx_failure: None,
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state == State::Destroyed
    }

    pub(crate) fn handle(&mut self, message: InputMessage) {
        let key = message.key();
        if !self.recent_keys.insert(key) {
            self.reply_error(
                key,
                protocol_error(format!("duplicate correlation key {key}")),
            );
            return;
        }
        debug!(%key, kind = message.kind(), "processor received message");

        if self.owns(&message) || matches!(message, InputMessage::Destroy { .. }) {
            self.dispatch(message);
            self.drain_queue();
            return;
        }

        let state = self.state;
        match state {
            State::Destroyed => {
                self.reply_error(key, protocol_error("processor destroyed"));
            }
            State::Uninitialized {
                awaiting_init: false,
            } if !is_init(&message) => {
                self.reply_error(key, protocol_error("database handle not initialized"));
            }
            _ if !self.queue.is_empty() || !self.accepts(&message) => {
                debug!(%key, queued = self.queue.len() + 1, "processor queued message");
                self.queue.push_back(message);
            }
            _ => {
                self.dispatch(message);
                self.drain_queue();
            }
        }
    }

    /// Messages belonging to the open transaction bypass the queue.
    fn owns(&self, message: &InputMessage) -> bool {
        match (self.state, message.transaction()) {
            (State::InTransaction(active), Some(tx)) => active == tx,
            _ => false,
        }
    }

    fn accepts(&self, message: &InputMessage) -> bool {
        match self.state {
            State::Ready => true,
            State::Uninitialized { .. } => is_init(message),
            State::InTransaction(_) => self.owns(message),
            State::Destroyed => false,
        }
    }

    fn drain_queue(&mut self) {
        while let Some(message) = self.queue.pop_front() {
            let state = self.state;
            match state {
                State::Uninitialized {
                    awaiting_init: false,
                } => {
                    let key = message.key();
                    self.reply_error(key, protocol_error("database handle not initialized"));
                }
                State::Destroyed => {
                    let key = message.key();
                    self.reply_error(key, protocol_error("processor destroyed"));
                }
                _ if self.accepts(&message) => self.dispatch(message),
                _ => {
                    self.queue.push_front(message);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, message: InputMessage) {
        match message {
            InputMessage::Config { key, config } => {
                self.config = Some(config);
                let result = self.initialize();
                self.reply_unit(key, result.map(|()| BTreeSet::new()));
            }
            InputMessage::Reinit { key } => {
                let result = self.initialize();
                self.reply_unit(key, result.map(|()| BTreeSet::new()));
            }
            InputMessage::Suspend { key } => {
                self.driver.destroy();
                self.state = State::Uninitialized {
                    awaiting_init: true,
                };
                info!("processor suspended; requests held until reinit");
                self.reply_unit(key, Ok(BTreeSet::new()));
            }
            InputMessage::Query {
                key,
                statement,
                transaction,
            } => {
                if transaction.is_some() && !self.owns_tx(transaction) {
                    self.reply_error(key, protocol_error("no active transaction for query"));
                    return;
                }
                if transaction.is_some()
                    && let Some(failure) = &self.tx_failure
                {
                    let err = aborted_transaction(failure);
                    self.reply_error(key, err);
                    return;
                }
                self.log_statement(statement.sql());
                match self.driver.exec(&statement) {
                    Ok(result) => {
                        let changed = self.collect_changes(std::slice::from_ref(&statement));
                        let mutated_tables = if transaction.is_some() {
                            self.tx_tables.extend(changed);
                            BTreeSet::new()
                        } else {
                            changed
                        };
                        self.send(OutputMessage::Data {
                            key,
                            results: vec![result],
                            mutated_tables,
                        });
                    }
                    Err(err) => {
                        if transaction.is_some() && self.tx_failure.is_none() {
                            debug!(error = %err, "transaction member failed; commit will roll back");
                            self.tx_failure = Some(err.to_string());
                        }
                        self.fail(key, err);
                    }
                }
            }
            InputMessage::Batch { key, statements } => {
                for statement in &statements {
                    self.log_statement(statement.sql());
                }
                match self.driver.exec_batch(&statements) {
                    Ok(results) => {
                        let mutated_tables = self.collect_changes(&statements);
                        self.send(OutputMessage::Data {
                            key,
                            results,
                            mutated_tables,
                        });
                    }
                    Err(err) => self.fail(key, err),
                }
            }
            InputMessage::TransactionBegin { key } => {
                match self.driver.exec(&Statement::new("BEGIN IMMEDIATE")) {
                    Ok(_) => {
                        self.tx_tables.clear();
                        self.tx_failure = None;
                        self.state = State::InTransaction(key);
                        debug!(transaction = %key, "transaction opened");
                        self.reply_unit(key, Ok(BTreeSet::new()));
                    }
                    Err(err) => self.fail(key, err),
                }
            }
            InputMessage::TransactionCommit { key, transaction } => {
                if !self.owns_tx(Some(transaction)) {
                    self.reply_error(key, protocol_error("no active transaction to commit"));
                    return;
                }
                if let Some(failure) = self.tx_failure.take() {
                    let rolled_back = self.driver.exec(&Statement::new("ROLLBACK"));
                    self.end_transaction();
                    debug!(%transaction, "commit of failed transaction rolled back");
                    match rolled_back {
                        Ok(_) => self.reply_error(key, aborted_transaction(&failure)),
                        Err(err) => self.fail(key, err),
                    }
                    return;
                }
                match self.driver.exec(&Statement::new("COMMIT")) {
                    Ok(_) => {
                        let mut tables = std::mem::take(&mut self.tx_tables);
                        tables.extend(self.driver.take_changed_tables());
                        self.state = State::Ready;
                        debug!(%transaction, "transaction committed");
                        self.reply_unit(key, Ok(tables));
                    }
                    Err(err) => {
                        let _ = self.driver.exec(&Statement::new("ROLLBACK"));
                        self.end_transaction();
                        self.fail(key, err);
                    }
                }
            }
            InputMessage::TransactionRollback { key, transaction } => {
                if !self.owns_tx(Some(transaction)) {
                    self.reply_error(key, protocol_error("no active transaction to roll back"));
                    return;
                }
                let result = self.driver.exec(&Statement::new("ROLLBACK"));
                self.end_transaction();
                debug!(%transaction, "transaction rolled back");
                match result {
                    Ok(_) => self.reply_unit(key, Ok(BTreeSet::new())),
                    Err(err) => self.fail(key, err),
                }
            }
            InputMessage::FunctionRegister { key, name, kind } => {
                let result = if self.functions.contains_key(&name) {
                    Err(SqlocalError::DriverMessage(format!(
                        "a function named {name} is already registered"
                    )))
                } else {
                    self.register_function(&name, &kind)
                        .map(|()| {
                            self.functions.insert(name, kind);
                            BTreeSet::new()
                        })
                };
                self.reply_unit(key, result);
            }
            InputMessage::GetInfo { key } => match self.database_info() {
                Ok(info) => self.send(OutputMessage::Info { key, info }),
                Err(err) => self.fail(key, err),
            },
            InputMessage::Import { key, bytes } => {
                let result = self.driver.import(&bytes).and_then(|tables| {
                    self.run_on_init()?;
                    Ok(tables)
                });
                self.driver.take_changed_tables();
                match result {
                    Ok(tables) => self.reply_unit(key, Ok(tables)),
                    Err(err) => self.fail(key, err),
                }
            }
            InputMessage::Export { key } => match self.driver.export() {
                Ok(export) => self.send(OutputMessage::Buffer { key, export }),
                Err(err) => self.fail(key, err),
            },
            InputMessage::Delete { key } => {
                let result = self.driver.clear().and_then(|tables| {
                    self.run_on_init()?;
                    Ok(tables)
                });
                self.driver.take_changed_tables();
                match result {
                    Ok(tables) => self.reply_unit(key, Ok(tables)),
                    Err(err) => self.fail(key, err),
                }
            }
            InputMessage::Destroy { key } => {
                self.driver.destroy();
                self.state = State::Destroyed;
                info!("processor destroyed");
                self.reply_unit(key, Ok(BTreeSet::new()));
                for message in std::mem::take(&mut self.queue) {
                    self.reply_error(message.key(), protocol_error("processor destroyed"));
                }
            }
        }
    }

    fn owns_tx(&self, transaction: Option<QueryKey>) -> bool {
        matches!((self.state, transaction), (State::InTransaction(active), Some(tx)) if active == tx)
    }

    fn end_transaction(&mut self) {
        self.tx_tables.clear();
        self.tx_failure = None;
        self.driver.take_changed_tables();
        if matches!(self.state, State::InTransaction(_)) {
            self.state = State::Ready;
        }
    }

    fn initialize(&mut self) -> Result<(), SqlocalError> {
        let Some(config) = self.config.clone() else {
            self.state = State::Uninitialized {
                awaiting_init: false,
            };
            return Err(protocol_error("processor has no configuration"));
        };

        let result = self.open(&config);
        match &result {
            Ok(()) => {
                self.state = State::Ready;
                info!(storage = ?config.driver.storage, "processor ready");
            }
            Err(err) => {
                warn!(error = %err, "processor initialization failed");
                self.driver.destroy();
                self.state = State::Uninitialized {
                    awaiting_init: false,
                };
            }
        }
        result
    }

    fn open(&mut self, config: &ProcessorConfig) -> Result<(), SqlocalError> {
        self.driver.init(&config.driver)?;
        let functions: Vec<(String, FunctionKind)> = self
            .functions
            .iter()
            .map(|(name, kind)| (name.clone(), kind.clone()))
            .collect();
        for (name, kind) in &functions {
            self.register_function(name, kind)?;
        }
        self.run_on_init()?;
        self.driver.take_changed_tables();
        Ok(())
    }

    /// Setup statements run on every fresh handle and after the contents were replaced.
    fn run_on_init(&mut self) -> Result<(), SqlocalError> {
        let on_init = self
            .config
            .as_ref()
            .map(|config| config.on_init.clone())
            .unwrap_or_default();
        for sql in &on_init {
            self.log_statement(sql);
            self.driver.exec(&Statement::new(sql.as_str()))?;
        }
        Ok(())
    }

    fn register_function(&mut self, name: &str, kind: &FunctionKind) -> Result<(), SqlocalError> {
        let func: ScalarFn = match kind {
            FunctionKind::Scalar(func) => Arc::clone(func),
            FunctionKind::Callback => {
                let output = self.output.clone();
                let name = name.to_owned();
                Arc::new(move |args: &[RowValues]| {
                    let _ = output.send(OutputMessage::Callback {
                        name: name.clone(),
                        args: args.to_vec(),
                    });
                    Ok(RowValues::Null)
                })
            }
        };
        self.driver.create_function(name, func)
    }

    fn database_info(&mut self) -> Result<DatabaseInfo, SqlocalError> {
        let storage_type = self
            .config
            .as_ref()
            .map(|config| config.driver.storage.storage_type())
            .ok_or_else(|| protocol_error("processor has no configuration"))?;
        Ok(DatabaseInfo {
            database_path: self.driver.database_path(),
            database_size_bytes: self.driver.database_size_bytes()?,
            storage_type,
            persisted: self.driver.is_database_persisted(),
        })
    }

    /// Tables changed by the statements that just succeeded.
    fn collect_changes(&mut self, statements: &[Statement]) -> BTreeSet<String> {
        let mut tables = self.driver.take_changed_tables();
        let static_effects = self
            .config
            .as_ref()
            .is_some_and(|config| config.effect_source == EffectSource::EngineAndStatic);
        if static_effects {
            for statement in statements {
                if let Ok(effects) = analyze(statement.sql()) {
                    tables.extend(effects.mutated_tables);
                }
            }
        }
        tables
    }

    fn log_statement(&self, sql: &str) {
        if self.config.as_ref().is_some_and(|config| config.verbose) {
            info!(sql, "executing statement");
        }
    }

    /// Report a driver failure, dropping back to uninitialized if the handle is gone.
    fn fail(&mut self, key: QueryKey, err: SqlocalError) {
        self.driver.take_changed_tables();
        if err.is_fatal() {
            warn!(error = %err, "database handle unusable; processor uninitialized");
            self.driver.destroy();
            self.tx_tables.clear();
            self.tx_failure = None;
            self.state = State::Uninitialized {
                awaiting_init: false,
            };
            self.reply_error(key, err);
            for message in std::mem::take(&mut self.queue) {
                self.reply_error(
                    message.key(),
                    protocol_error("database handle not initialized"),
                );
            }
        } else {
            self.reply_error(key, err);
        }
    }

    fn reply_unit(&self, key: QueryKey, result: Result<BTreeSet<String>, SqlocalError>) {
        match result {
            Ok(mutated_tables) => self.send(OutputMessage::Success {
                key,
                mutated_tables,
            }),
            Err(error) => self.reply_error(key, error),
        }
    }

    fn reply_error(&self, key: QueryKey, error: SqlocalError) {
        self.send(OutputMessage::Error { key, error });
    }

    fn send(&self, message: OutputMessage) {
        if self.output.send(message).is_err() {
            debug!("processor output closed");
        }
    }

    fn shutdown(&mut self) {
        self.driver.destroy();
    }
}

fn aborted_transaction(failure: &str) -> SqlocalError {
    SqlocalError::DriverMessage(format!(
        "transaction rolled back after a failed statement: {failure}"
    ))
}

fn is_init(message: &InputMessage) -> bool {
    matches!(
        message,
        InputMessage::Config { .. } | InputMessage::Reinit { .. } | InputMessage::Destroy { .. }
    )
}

#[derive(Default)]
struct RecentKeys {
    order: VecDeque<QueryKey>,
    seen: HashSet<QueryKey>,
}

impl RecentKeys {
    /// Returns `false` when `key` was already used.
    fn insert(&mut self, key: QueryKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > KEY_WINDOW
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverConfig, SqliteDriver, StorageTarget};
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    fn config() -> ProcessorConfig {
        ProcessorConfig {
            driver: DriverConfig {
                storage: StorageTarget::Memory,
                read_only: false,
            },
            verbose: false,
            effect_source: EffectSource::Engine,
            on_init: vec!["CREATE TABLE groceries (id INTEGER PRIMARY KEY, name TEXT)".into()],
        }
    }

    fn processor() -> (Processor<SqliteDriver>, UnboundedReceiver<OutputMessage>) {
        let (tx, rx) = unbounded_channel();
        let processor = Processor::new(SqliteDriver::new(StorageTarget::Memory), tx);
        (processor, rx)
    }

    fn ready() -> (Processor<SqliteDriver>, UnboundedReceiver<OutputMessage>) {
        let (mut processor, mut rx) = processor();
        processor.handle(InputMessage::Config {
            key: QueryKey::new(),
            config: config(),
        });
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Success { .. })));
        (processor, rx)
    }

    fn query(sql: &str) -> InputMessage {
        InputMessage::Query {
            key: QueryKey::new(),
            statement: Statement::new(sql),
            transaction: None,
        }
    }

    #[test]
    fn requests_before_config_are_held_then_flushed() {
        let (mut processor, mut rx) = processor();
        processor.handle(query("INSERT INTO groceries (name) VALUES ('milk')"));
        assert!(rx.try_recv().is_err());

        processor.handle(InputMessage::Config {
            key: QueryKey::new(),
            config: config(),
        });
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Success { .. })));
        match rx.try_recv() {
            Ok(OutputMessage::Data { mutated_tables, .. }) => {
                assert_eq!(mutated_tables, BTreeSet::from(["groceries".to_owned()]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reused_keys_are_rejected() {
        let (mut processor, mut rx) = ready();
        let key = QueryKey::new();
        for _ in 0..2 {
            processor.handle(InputMessage::Query {
                key,
                statement: Statement::new("SELECT 1"),
                transaction: None,
            });
        }
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Data { .. })));
        match rx.try_recv() {
            Ok(OutputMessage::Error {
                key: reported,
                error: SqlocalError::ProtocolError(_),
            }) => assert_eq!(reported, key),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn outside_requests_wait_for_the_transaction() {
        let (mut processor, mut rx) = ready();
        let tx = QueryKey::new();
        processor.handle(InputMessage::TransactionBegin { key: tx });
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Success { .. })));

        processor.handle(query("UPDATE groceries SET name = 'x'"));
        assert!(rx.try_recv().is_err());

        for name in ["apples", "bread", "cheese"] {
            processor.handle(InputMessage::Query {
                key: QueryKey::new(),
                statement: Statement::positional(
                    "INSERT INTO groceries (name) VALUES (?)",
                    vec![RowValues::Text(name.into())],
                ),
                transaction: Some(tx),
            });
            match rx.try_recv() {
                Ok(OutputMessage::Data { mutated_tables, .. }) => assert!(mutated_tables.is_empty()),
                other => panic!("unexpected {other:?}"),
            }
        }

        processor.handle(InputMessage::TransactionCommit {
            key: QueryKey::new(),
            transaction: tx,
        });
        match rx.try_recv() {
            Ok(OutputMessage::Success { mutated_tables, .. }) => {
                assert_eq!(mutated_tables, BTreeSet::from(["groceries".to_owned()]));
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv() {
            Ok(OutputMessage::Data { results, .. }) => assert_eq!(results[0].rows_affected, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failed_member_turns_commit_into_rollback() {
        let (mut processor, mut rx) = ready();
        processor.handle(query("CREATE TABLE pantry (name TEXT NOT NULL)"));
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Data { .. })));
        let tx = QueryKey::new();
        processor.handle(InputMessage::TransactionBegin { key: tx });
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Success { .. })));

        for sql in [
            "INSERT INTO pantry (name) VALUES ('apples')",
            "INSERT INTO pantry (name) VALUES (NULL)",
            "INSERT INTO pantry (name) VALUES ('pears')",
        ] {
            processor.handle(InputMessage::Query {
                key: QueryKey::new(),
                statement: Statement::new(sql),
                transaction: Some(tx),
            });
        }
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Data { .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(OutputMessage::Error {
                error: SqlocalError::DriverError(_),
                ..
            })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(OutputMessage::Error {
                error: SqlocalError::DriverMessage(_),
                ..
            })
        ));

        processor.handle(InputMessage::TransactionCommit {
            key: QueryKey::new(),
            transaction: tx,
        });
        match rx.try_recv() {
            Ok(OutputMessage::Error {
                error: SqlocalError::DriverMessage(message),
                ..
            }) => assert!(message.contains("rolled back")),
            other => panic!("unexpected {other:?}"),
        }

        processor.handle(query("SELECT count(*) FROM pantry"));
        match rx.try_recv() {
            Ok(OutputMessage::Data { results, .. }) => {
                assert_eq!(results[0].scalar(), Some(&RowValues::Int(0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rollback_discards_changes_and_effects() {
        let (mut processor, mut rx) = ready();
        let tx = QueryKey::new();
        processor.handle(InputMessage::TransactionBegin { key: tx });
        processor.handle(InputMessage::Query {
            key: QueryKey::new(),
            statement: Statement::new("INSERT INTO groceries (name) VALUES ('milk')"),
            transaction: Some(tx),
        });
        processor.handle(InputMessage::TransactionRollback {
            key: QueryKey::new(),
            transaction: tx,
        });
        processor.handle(query("SELECT count(*) FROM groceries"));

        let mut last = None;
        while let Ok(message) = rx.try_recv() {
            if let OutputMessage::Success { mutated_tables, .. } = &message {
                assert!(mutated_tables.is_empty());
            }
            last = Some(message);
        }
        match last {
            Some(OutputMessage::Data { results, .. }) => {
                assert_eq!(results[0].scalar(), Some(&RowValues::Int(0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn static_effects_cover_truncate_optimization() {
        let (mut processor, mut rx) = processor();
        let mut static_config = config();
        static_config.effect_source = EffectSource::EngineAndStatic;
        processor.handle(InputMessage::Config {
            key: QueryKey::new(),
            config: static_config,
        });
        let _ = rx.try_recv();
        processor.handle(query("INSERT INTO groceries (name) VALUES ('milk')"));
        let _ = rx.try_recv();
        processor.handle(query("DELETE FROM groceries"));
        match rx.try_recv() {
            Ok(OutputMessage::Data { mutated_tables, .. }) => {
                assert_eq!(mutated_tables, BTreeSet::from(["groceries".to_owned()]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn callback_functions_emit_messages_and_survive_reinit() {
        let (mut processor, mut rx) = ready();
        processor.handle(InputMessage::FunctionRegister {
            key: QueryKey::new(),
            name: "notify".into(),
            kind: FunctionKind::Callback,
        });
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Success { .. })));

        processor.handle(InputMessage::Reinit {
            key: QueryKey::new(),
        });
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Success { .. })));

        processor.handle(query("SELECT notify('hello', 2)"));
        match rx.try_recv() {
            Ok(OutputMessage::Callback { name, args }) => {
                assert_eq!(name, "notify");
                assert_eq!(args, vec![RowValues::Text("hello".into()), RowValues::Int(2)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv() {
            Ok(OutputMessage::Data { results, .. }) => {
                assert_eq!(results[0].scalar(), Some(&RowValues::Null));
            }
            other => panic!("unexpected {other:?}"),
        }

        processor.handle(InputMessage::FunctionRegister {
            key: QueryKey::new(),
            name: "notify".into(),
            kind: FunctionKind::Callback,
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(OutputMessage::Error {
                error: SqlocalError::DriverMessage(_),
                ..
            })
        ));
    }

    #[test]
    fn suspended_processor_holds_requests_until_reinit() {
        let (mut processor, mut rx) = ready();
        processor.handle(InputMessage::Suspend {
            key: QueryKey::new(),
        });
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Success { .. })));
        processor.handle(query("SELECT 1"));
        assert!(rx.try_recv().is_err());
        processor.handle(InputMessage::Reinit {
            key: QueryKey::new(),
        });
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Success { .. })));
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Data { .. })));
    }

    #[test]
    fn destroy_fails_everything_afterwards() {
        let (mut processor, mut rx) = ready();
        processor.handle(InputMessage::Destroy {
            key: QueryKey::new(),
        });
        assert!(processor.is_destroyed());
        assert!(matches!(rx.try_recv(), Ok(OutputMessage::Success { .. })));
        processor.handle(query("SELECT 1"));
        assert!(matches!(
            rx.try_recv(),
            Ok(OutputMessage::Error {
                error: SqlocalError::ProtocolError(_),
                ..
            })
        ));
    }
}
