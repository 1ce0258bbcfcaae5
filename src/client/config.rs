use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::driver::StorageTarget;
use crate::effects::EffectSource;
use crate::error::SqlocalError;
use crate::host::Host;

use super::SqlClient;

/// Why a client (re)connected to its database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    Initial,
    Overwrite,
    Delete,
    Reinitialize,
    /// Another context replaced the database and this client reopened its handle.
    Replaced,
}

impl fmt::Display for ConnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ConnectReason::Initial => "initial",
            ConnectReason::Overwrite => "overwrite",
            ConnectReason::Delete => "delete",
            ConnectReason::Reinitialize => "reinitialize",
            ConnectReason::Replaced => "replaced",
        };
        f.write_str(reason)
    }
}

pub type ConnectCallback = Arc<dyn Fn(ConnectReason) + Send + Sync>;

/// Options for a [`SqlClient`].
///
/// ```rust
/// use sqlocal::prelude::*;
///
/// let config: ClientConfig = serde_json::from_str(
///     r#"{ "storage": { "kind": "file", "path": "app.sqlite3" }, "verbose": true }"#,
/// ).unwrap();
/// assert!(config.reactive);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub storage: StorageTarget,
    pub read_only: bool,
    /// Log every executed statement at `info` level.
    pub verbose: bool,
    /// Publish effects and allow reactive queries.
    pub reactive: bool,
    pub effect_source: EffectSource,
    /// SQL run by the processor after every (re)initialization.
    pub on_init: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            storage: StorageTarget::Memory,
            read_only: false,
            verbose: false,
            reactive: true,
            effect_source: EffectSource::Engine,
            on_init: Vec::new(),
        }
    }
}

/// Fluent builder for [`SqlClient`].
#[derive(Clone)]
pub struct ClientBuilder {
    pub(super) config: ClientConfig,
    pub(super) host: Option<Arc<Host>>,
    pub(super) on_connect: Option<ConnectCallback>,
}

impl ClientBuilder {
    #[must_use]
    pub fn new(storage: StorageTarget) -> Self {
        Self::from_config(ClientConfig {
            storage,
            ..ClientConfig::default()
        })
    }

    #[must_use]
    pub fn memory() -> Self {
        Self::new(StorageTarget::Memory)
    }

    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(StorageTarget::File { path: path.into() })
    }

    /// File opened in SQLite's exclusive locking mode. Only other `exclusive_file` clients on
    /// the same host can take it over; a plain [`file`](Self::file) client on the same path
    /// fails to build with [`SqlocalError::LockError`](crate::SqlocalError::LockError) while
    /// the file is held.
    #[must_use]
    pub fn exclusive_file(path: impl Into<PathBuf>) -> Self {
        Self::new(StorageTarget::ExclusiveFile { path: path.into() })
    }

    #[must_use]
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            host: None,
            on_connect: None,
        }
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    #[must_use]
    pub fn reactive(mut self, reactive: bool) -> Self {
        self.config.reactive = reactive;
        self
    }

    #[must_use]
    pub fn effect_source(mut self, effect_source: EffectSource) -> Self {
        self.config.effect_source = effect_source;
        self
    }

    #[must_use]
    pub fn on_init(mut self, sql: impl Into<String>) -> Self {
        self.config.on_init.push(sql.into());
        self
    }

    #[must_use]
    pub fn on_connect(mut self, callback: impl Fn(ConnectReason) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    /// Share locks and broadcasts with every other client built on `host`.
    ///
    /// Without a host the client gets a private one and coordinates with nobody.
    #[must_use]
    pub fn host(mut self, host: Arc<Host>) -> Self {
        self.host = Some(host);
        self
    }

    #[must_use]
    pub fn finish(self) -> ClientConfig {
        self.config
    }

    /// Start the processor and connect.
    ///
    /// # Errors
    /// Returns [`SqlocalError::ConfigError`] for unsupported option combinations and the
    /// driver error when the database cannot be opened.
    pub async fn build(self) -> Result<SqlClient, SqlocalError> {
        SqlClient::connect(self).await
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("shared_host", &self.host.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .finish()
    }
}
