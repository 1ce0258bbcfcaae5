//! Storage drivers execute canonical statements against one persistence backend.
//!
//! The processor owns exactly one driver and talks to it only through [`StorageDriver`];
//! backend quirks are described by [`DriverCapabilities`] rather than by type checks.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SqlocalError;
use crate::results::ResultSet;
use crate::statement::Statement;
use crate::types::RowValues;

mod query;
mod sqlite;

pub use sqlite::SqliteDriver;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageTarget {
    /// Private in-memory database.
    #[default]
    Memory,
    /// Database file shared with other connections.
    File { path: PathBuf },
    /// Database file held with an exclusive engine lock for as long as the handle is open.
    ExclusiveFile { path: PathBuf },
}

impl StorageTarget {
    #[must_use]
    pub fn capabilities(&self) -> DriverCapabilities {
        match self {
            StorageTarget::Memory => DriverCapabilities {
                exclusive_resource: false,
                supports_read_only: true,
                persisted: false,
            },
            StorageTarget::File { .. } => DriverCapabilities {
                exclusive_resource: false,
                supports_read_only: true,
                persisted: true,
            },
            StorageTarget::ExclusiveFile { .. } => DriverCapabilities {
                exclusive_resource: true,
                supports_read_only: false,
                persisted: true,
            },
        }
    }

    #[must_use]
    pub fn storage_type(&self) -> StorageType {
        match self {
            StorageTarget::Memory => StorageType::Memory,
            StorageTarget::File { .. } => StorageType::File,
            StorageTarget::ExclusiveFile { .. } => StorageType::ExclusiveFile,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Memory,
    File,
    ExclusiveFile,
}

/// Backend capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// The backend needs sole ownership of its storage even for reads, so the lock is taken
    /// at connect time and held until a peer asks for it.
    pub exclusive_resource: bool,
    pub supports_read_only: bool,
    pub persisted: bool,
}

/// Settings applied when a driver (re)initializes its handle.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub storage: StorageTarget,
    pub read_only: bool,
}

/// Exported database image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseExport {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Signature of a user-defined scalar function.
pub type ScalarFn = Arc<dyn Fn(&[RowValues]) -> Result<RowValues, String> + Send + Sync>;

/// Engine-facing collaborator owned by the processor.
pub trait StorageDriver: Send {
    fn capabilities(&self) -> DriverCapabilities;

    /// Open (or reopen) the database handle.
    ///
    /// # Errors
    /// Returns the engine error when the handle cannot be opened or configured.
    fn init(&mut self, config: &DriverConfig) -> Result<(), SqlocalError>;

    fn is_open(&self) -> bool;

    /// Run one statement (or a parameterless script) and return its rows.
    ///
    /// # Errors
    /// Returns the engine error for the statement.
    fn exec(&mut self, statement: &Statement) -> Result<ResultSet, SqlocalError>;

    /// Run statements as one all-or-nothing unit.
    ///
    /// # Errors
    /// Returns the first member failure after rolling back the whole batch.
    fn exec_batch(&mut self, statements: &[Statement]) -> Result<Vec<ResultSet>, SqlocalError>;

    /// Register a scalar function on the open handle.
    ///
    /// # Errors
    /// Returns the engine error when registration fails.
    fn create_function(&mut self, name: &str, func: ScalarFn) -> Result<(), SqlocalError>;

    /// Replace the database contents; returns the tables present before and after.
    ///
    /// # Errors
    /// Returns an error for bytes that are not a database image or on I/O failure.
    fn import(&mut self, bytes: &[u8]) -> Result<BTreeSet<String>, SqlocalError>;

    /// # Errors
    /// Returns the engine or I/O error raised while copying the database.
    fn export(&mut self) -> Result<DatabaseExport, SqlocalError>;

    /// Delete all data and reopen an empty database; returns the tables that existed.
    ///
    /// # Errors
    /// Returns the engine or I/O error raised while removing the storage.
    fn clear(&mut self) -> Result<BTreeSet<String>, SqlocalError>;

    /// Close the handle. Safe to call repeatedly.
    fn destroy(&mut self);

    fn is_database_persisted(&self) -> bool;

    /// # Errors
    /// Returns the engine error when the size cannot be read.
    fn database_size_bytes(&mut self) -> Result<u64, SqlocalError>;

    fn database_path(&self) -> Option<String>;

    /// Tables the engine reported as changed since the last call.
    fn take_changed_tables(&mut self) -> BTreeSet<String>;
}
