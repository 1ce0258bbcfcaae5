use rusqlite::{Connection, ToSql};

use crate::error::SqlocalError;
use crate::results::ResultSet;
use crate::statement::{Statement, StatementParams};
use crate::types::sqlite_value_to_row_value;

/// Run one statement and collect whatever rows it yields.
///
/// Parameterless multi-statement scripts are run with `execute_batch` and return an empty
/// result set.
pub(super) fn run_statement(
    conn: &Connection,
    statement: &Statement,
) -> Result<ResultSet, SqlocalError> {
    let mut stmt = match conn.prepare(statement.sql()) {
        Ok(stmt) => stmt,
        Err(rusqlite::Error::MultipleStatement) if statement.params().is_empty() => {
            conn.execute_batch(statement.sql())?;
            return Ok(ResultSet::default());
        }
        Err(err) => return Err(err.into()),
    };

    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(std::string::ToString::to_string)
        .collect();
    let column_count = column_names.len();
    let mut result_set = ResultSet::with_columns(column_names);

    let mut rows = match statement.params() {
        StatementParams::Positional(values) => {
            stmt.query(rusqlite::params_from_iter(values.iter()))?
        }
        StatementParams::Named(pairs) => {
            let named: Vec<(&str, &dyn ToSql)> = pairs
                .iter()
                .map(|(token, value)| (token.as_str(), value as &dyn ToSql))
                .collect();
            stmt.query(named.as_slice())?
        }
    };

    while let Some(row) = rows.next()? {
        let mut row_values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            row_values.push(sqlite_value_to_row_value(row.get_ref(idx)?));
        }
        result_set.add_row_values(row_values);
    }
    drop(rows);

    result_set.rows_affected = if stmt.readonly() {
        0
    } else {
        usize::try_from(conn.changes()).unwrap_or(usize::MAX)
    };
    Ok(result_set)
}
