use std::collections::BTreeSet;
use std::fmt;

use uuid::Uuid;

use crate::driver::{DatabaseExport, DriverConfig, ScalarFn, StorageType};
use crate::effects::EffectSource;
use crate::error::SqlocalError;
use crate::results::ResultSet;
use crate::statement::Statement;
use crate::types::RowValues;

/// Correlation key carried by every request and echoed by its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryKey(Uuid);

impl QueryKey {
    #[must_use]
    pub fn new() -> Self {
        QueryKey(Uuid::new_v4())
    }
}

impl Default for QueryKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything the processor needs to (re)open its handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub driver: DriverConfig,
    pub verbose: bool,
    pub effect_source: EffectSource,
    /// SQL run after every successful initialization.
    pub on_init: Vec<String>,
}

/// How a registered SQL function behaves.
#[derive(Clone)]
pub enum FunctionKind {
    /// Invocations are forwarded to the client as [`OutputMessage::Callback`]; SQL sees NULL.
    Callback,
    /// Evaluated inside the processor.
    Scalar(ScalarFn),
}

impl fmt::Debug for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionKind::Callback => f.write_str("Callback"),
            FunctionKind::Scalar(_) => f.write_str("Scalar(..)"),
        }
    }
}

/// Snapshot returned for [`InputMessage::GetInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub database_path: Option<String>,
    pub database_size_bytes: u64,
    pub storage_type: StorageType,
    pub persisted: bool,
}

/// Requests accepted by the processor.
#[derive(Debug)]
pub enum InputMessage {
    Config {
        key: QueryKey,
        config: ProcessorConfig,
    },
    /// Reopen the handle with the last configuration.
    Reinit {
        key: QueryKey,
    },
    /// Close the handle and hold new requests until the next `Reinit`.
    Suspend {
        key: QueryKey,
    },
    Query {
        key: QueryKey,
        statement: Statement,
        transaction: Option<QueryKey>,
    },
    Batch {
        key: QueryKey,
        statements: Vec<Statement>,
    },
    /// The begin key doubles as the transaction id.
    TransactionBegin {
        key: QueryKey,
    },
    TransactionCommit {
        key: QueryKey,
        transaction: QueryKey,
    },
    TransactionRollback {
        key: QueryKey,
        transaction: QueryKey,
    },
    FunctionRegister {
        key: QueryKey,
        name: String,
        kind: FunctionKind,
    },
    GetInfo {
        key: QueryKey,
    },
    Import {
        key: QueryKey,
        bytes: Vec<u8>,
    },
    Export {
        key: QueryKey,
    },
    Delete {
        key: QueryKey,
    },
    Destroy {
        key: QueryKey,
    },
}

impl InputMessage {
    #[must_use]
    pub fn key(&self) -> QueryKey {
        match self {
            InputMessage::Config { key, .. }
            | InputMessage::Reinit { key }
            | InputMessage::Suspend { key }
            | InputMessage::Query { key, .. }
            | InputMessage::Batch { key, .. }
            | InputMessage::TransactionBegin { key }
            | InputMessage::TransactionCommit { key, .. }
            | InputMessage::TransactionRollback { key, .. }
            | InputMessage::FunctionRegister { key, .. }
            | InputMessage::GetInfo { key }
            | InputMessage::Import { key, .. }
            | InputMessage::Export { key }
            | InputMessage::Delete { key }
            | InputMessage::Destroy { key } => *key,
        }
    }

    /// Transaction this message belongs to, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<QueryKey> {
        match self {
            InputMessage::Query { transaction, .. } => *transaction,
            InputMessage::TransactionCommit { transaction, .. }
            | InputMessage::TransactionRollback { transaction, .. } => Some(*transaction),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            InputMessage::Config { .. } => "config",
            InputMessage::Reinit { .. } => "reinit",
            InputMessage::Suspend { .. } => "suspend",
            InputMessage::Query { .. } => "query",
            InputMessage::Batch { .. } => "batch",
            InputMessage::TransactionBegin { .. } => "transaction-begin",
            InputMessage::TransactionCommit { .. } => "transaction-commit",
            InputMessage::TransactionRollback { .. } => "transaction-rollback",
            InputMessage::FunctionRegister { .. } => "function-register",
            InputMessage::GetInfo { .. } => "get-info",
            InputMessage::Import { .. } => "import",
            InputMessage::Export { .. } => "export",
            InputMessage::Delete { .. } => "delete",
            InputMessage::Destroy { .. } => "destroy",
        }
    }
}

/// Responses and notifications emitted by the processor.
#[derive(Debug)]
pub enum OutputMessage {
    Success {
        key: QueryKey,
        mutated_tables: BTreeSet<String>,
    },
    Error {
        key: QueryKey,
        error: SqlocalError,
    },
    Data {
        key: QueryKey,
        results: Vec<ResultSet>,
        mutated_tables: BTreeSet<String>,
    },
    Buffer {
        key: QueryKey,
        export: DatabaseExport,
    },
    /// Invocation of a callback function. Not correlated to a request.
    Callback {
        name: String,
        args: Vec<RowValues>,
    },
    Info {
        key: QueryKey,
        info: DatabaseInfo,
    },
}

impl OutputMessage {
    #[must_use]
    pub fn key(&self) -> Option<QueryKey> {
        match self {
            OutputMessage::Success { key, .. }
            | OutputMessage::Error { key, .. }
            | OutputMessage::Data { key, .. }
            | OutputMessage::Buffer { key, .. }
            | OutputMessage::Info { key, .. } => Some(*key),
            OutputMessage::Callback { .. } => None,
        }
    }
}
