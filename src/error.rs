use thiserror::Error;

use rusqlite::ErrorCode;

#[derive(Debug, Error)]
pub enum SqlocalError {
    #[error("SQL parse error: {0}")]
    ParseError(#[from] sqlparser::parser::ParserError),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error(transparent)]
    DriverError(#[from] rusqlite::Error),

    #[error("Driver error: {0}")]
    DriverMessage(String),

    #[error("Reactive contract error: {0}")]
    ReactiveContractError(String),

    #[error("Invalid statement: {0}")]
    InvalidStatement(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SqlocalError {
    /// Whether the error leaves the database handle unusable.
    ///
    /// The processor drops back to its uninitialized state when this returns `true` and
    /// fails every request it was holding.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            SqlocalError::DriverError(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
            ),
            SqlocalError::DriverError(rusqlite::Error::InvalidPath(_)) => true,
            _ => false,
        }
    }

    /// Whether the engine refused because another connection holds the file.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SqlocalError::DriverError(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    /// Copy of the error suitable for fan-out to several waiters.
    ///
    /// Engine errors are not `Clone`, so they are flattened to their message.
    #[must_use]
    pub fn duplicate(&self) -> SqlocalError {
        match self {
            SqlocalError::ProtocolError(msg) => SqlocalError::ProtocolError(msg.clone()),
            SqlocalError::LockError(msg) => SqlocalError::LockError(msg.clone()),
            SqlocalError::DriverMessage(msg) => SqlocalError::DriverMessage(msg.clone()),
            SqlocalError::ReactiveContractError(msg) => {
                SqlocalError::ReactiveContractError(msg.clone())
            }
            SqlocalError::InvalidStatement(msg) => SqlocalError::InvalidStatement(msg.clone()),
            SqlocalError::ConfigError(msg) => SqlocalError::ConfigError(msg.clone()),
            SqlocalError::ConnectionError(msg) => SqlocalError::ConnectionError(msg.clone()),
            SqlocalError::DriverError(err) => SqlocalError::DriverMessage(err.to_string()),
            SqlocalError::ParseError(err) => SqlocalError::ParseError(err.clone()),
            SqlocalError::Io(err) => SqlocalError::Io(std::io::Error::new(err.kind(), err.to_string())),
        }
    }
}

pub(crate) fn protocol_error(message: impl Into<String>) -> SqlocalError {
    SqlocalError::ProtocolError(message.into())
}

pub(crate) fn connection_error(message: &str) -> SqlocalError {
    SqlocalError::ConnectionError(message.into())
}
