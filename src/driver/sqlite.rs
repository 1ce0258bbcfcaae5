use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::functions::FunctionFlags;
use rusqlite::hooks::Action;
use rusqlite::{Connection, DatabaseName, OpenFlags};
use tracing::debug;

use crate::error::SqlocalError;
use crate::results::ResultSet;
use crate::statement::Statement;
use crate::types::sqlite_value_to_row_value;

use super::query::run_statement;
use super::{DatabaseExport, DriverCapabilities, DriverConfig, ScalarFn, StorageDriver, StorageTarget};

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MEMORY_EXPORT_NAME: &str = "database.sqlite3";

/// [`StorageDriver`] backed by an embedded SQLite connection.
///
/// Row changes are collected through the engine's update hook, so the tables reported by
/// [`StorageDriver::take_changed_tables`] are the ones SQLite actually touched.
pub struct SqliteDriver {
    target: StorageTarget,
    conn: Option<Connection>,
    changed: Arc<Mutex<BTreeSet<String>>>,
}

impl SqliteDriver {
    #[must_use]
    pub fn new(target: StorageTarget) -> Self {
        Self {
            target,
            conn: None,
            changed: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    fn conn(&mut self) -> Result<&mut Connection, SqlocalError> {
        self.conn
            .as_mut()
            .ok_or_else(|| SqlocalError::ProtocolError("database handle is not open".into()))
    }

    fn open(config: &DriverConfig) -> Result<Connection, SqlocalError> {
        let conn = match &config.storage {
            StorageTarget::Memory => Connection::open_in_memory()?,
            StorageTarget::File { path } | StorageTarget::ExclusiveFile { path } => {
                Connection::open_with_flags(path, OpenFlags::default())?
            }
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;

        match &config.storage {
            StorageTarget::Memory => {}
            StorageTarget::File { .. } => {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            StorageTarget::ExclusiveFile { .. } => {
                // The exclusive mode must be set before WAL so no shared-memory index is used.
                conn.execute_batch("PRAGMA locking_mode = EXCLUSIVE; PRAGMA journal_mode = WAL;")?;
            }
        }
        if config.read_only {
            conn.execute_batch("PRAGMA query_only = ON;")?;
        }
        Ok(conn)
    }

    fn clear_changes(&self) {
        if let Ok(mut changed) = self.changed.lock() {
            changed.clear();
        }
    }
}

impl StorageDriver for SqliteDriver {
    fn capabilities(&self) -> DriverCapabilities {
        self.target.capabilities()
    }

    fn init(&mut self, config: &DriverConfig) -> Result<(), SqlocalError> {
        if config.read_only && !config.storage.capabilities().supports_read_only {
            return Err(SqlocalError::ConfigError(
                "read_only is not supported by exclusive file storage".into(),
            ));
        }
        self.destroy();
        self.target = config.storage.clone();

        let conn = Self::open(config)?;
        let changed = Arc::clone(&self.changed);
        conn.update_hook(Some(
            move |_action: Action, _db: &str, table: &str, _rowid: i64| {
                if let Ok(mut tables) = changed.lock() {
                    tables.insert(table.to_lowercase());
                }
            },
        ));
        self.conn = Some(conn);
        self.clear_changes();
        debug!(target = ?self.target, "sqlite handle opened");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn exec(&mut self, statement: &Statement) -> Result<ResultSet, SqlocalError> {
        let conn = self.conn()?;
        run_statement(conn, statement)
    }

    fn exec_batch(&mut self, statements: &[Statement]) -> Result<Vec<ResultSet>, SqlocalError> {
        let conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut results = Vec::with_capacity(statements.len());
        let mut failure = None;
        for statement in statements {
            match run_statement(&tx, statement) {
                Ok(result) => results.push(result),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        match failure {
            None => {
                tx.commit()?;
                Ok(results)
            }
            Some(err) => {
                // Rollback errors are secondary to the statement failure.
                let _ = tx.rollback();
                self.clear_changes();
                Err(err)
            }
        }
    }

    fn create_function(&mut self, name: &str, func: ScalarFn) -> Result<(), SqlocalError> {
        let conn = self.conn()?;
        let func = AssertUnwindSafe(func);
        conn.create_scalar_function(name, -1, FunctionFlags::SQLITE_UTF8, move |ctx| {
            let func = &*func;
            let args: Vec<_> = (0..ctx.len())
                .map(|idx| sqlite_value_to_row_value(ctx.get_raw(idx)))
                .collect();
            func(&args).map_err(|msg| rusqlite::Error::UserFunctionError(msg.into()))
        })?;
        Ok(())
    }

    fn import(&mut self, bytes: &[u8]) -> Result<BTreeSet<String>, SqlocalError> {
        if bytes.len() < SQLITE_HEADER.len() || &bytes[..SQLITE_HEADER.len()] != SQLITE_HEADER {
            return Err(SqlocalError::DriverMessage(
                "imported bytes are not a SQLite database".into(),
            ));
        }

        let before = table_names(self.conn()?)?;
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("import.sqlite3");
        std::fs::write(&image, bytes)?;

        let conn = self.conn()?;
        conn.restore(DatabaseName::Main, &image, None::<fn(rusqlite::backup::Progress)>)?;
        let after = table_names(conn)?;
        self.clear_changes();
        Ok(before.union(&after).cloned().collect())
    }

    fn export(&mut self) -> Result<DatabaseExport, SqlocalError> {
        let name = match &self.target {
            StorageTarget::Memory => MEMORY_EXPORT_NAME.to_owned(),
            StorageTarget::File { path } | StorageTarget::ExclusiveFile { path } => {
                file_name(path)
            }
        };
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("export.sqlite3");
        self.conn()?.backup(DatabaseName::Main, &image, None)?;
        let bytes = std::fs::read(&image)?;
        Ok(DatabaseExport { name, bytes })
    }

    fn clear(&mut self) -> Result<BTreeSet<String>, SqlocalError> {
        let conn = self.conn()?;
        let tables = table_names(conn)?;

        // Peers may hold open handles on the same file; the file itself stays.
        let objects: Vec<(String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT type, name FROM sqlite_master \
                 WHERE name NOT LIKE 'sqlite_%' AND type IN ('view', 'trigger', 'table') \
                 ORDER BY CASE type WHEN 'table' THEN 1 ELSE 0 END",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, rusqlite::Error>>()?
        };

        let foreign_keys: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let mut script = String::from("PRAGMA foreign_keys = OFF;\n");
        for (kind, name) in &objects {
            let quoted = name.replace('"', "\"\"");
            script.push_str(&format!("DROP {} IF EXISTS \"{quoted}\";\n", kind.to_uppercase()));
        }
        let dropped = conn.execute_batch(&script);
        conn.execute_batch(&format!("PRAGMA foreign_keys = {foreign_keys};"))?;
        dropped?;
        conn.execute_batch("VACUUM;")?;
        self.clear_changes();
        Ok(tables)
    }

    fn destroy(&mut self) {
        if let Some(conn) = self.conn.take()
            && let Err((_, err)) = conn.close()
        {
            debug!(error = %err, "sqlite handle closed with error");
        }
    }

    fn is_database_persisted(&self) -> bool {
        self.target.capabilities().persisted
    }

    fn database_size_bytes(&mut self) -> Result<u64, SqlocalError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(u64::try_from(page_count.saturating_mul(page_size)).unwrap_or_default())
    }

    fn database_path(&self) -> Option<String> {
        match &self.target {
            StorageTarget::Memory => None,
            StorageTarget::File { path } | StorageTarget::ExclusiveFile { path } => {
                Some(path.to_string_lossy().into_owned())
            }
        }
    }

    fn take_changed_tables(&mut self) -> BTreeSet<String> {
        self.changed
            .lock()
            .map(|mut tables| std::mem::take(&mut *tables))
            .unwrap_or_default()
    }
}

impl Drop for SqliteDriver {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn table_names(conn: &Connection) -> Result<BTreeSet<String>, SqlocalError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut tables = BTreeSet::new();
    for name in names {
        tables.insert(name?.to_lowercase());
    }
    Ok(tables)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| MEMORY_EXPORT_NAME.to_owned())
}
