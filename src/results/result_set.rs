use std::collections::HashMap;
use std::sync::Arc;

use super::row::{CustomDbRow, index_columns};
use crate::types::RowValues;

/// A result set from a database statement
///
/// Holds the rows returned by the statement and the number of rows it changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// The rows returned by the statement
    pub results: Vec<CustomDbRow>,
    /// The number of rows changed (for DML statements)
    pub rows_affected: usize,
    column_names: Arc<Vec<String>>,
    column_index_cache: Arc<HashMap<String, usize>>,
}

impl ResultSet {
    /// Create an empty result set for the given columns
    #[must_use]
    pub fn with_columns(column_names: Vec<String>) -> ResultSet {
        let cache = Arc::new(index_columns(&column_names));
        ResultSet {
            results: Vec::new(),
            rows_affected: 0,
            column_names: Arc::new(column_names),
            column_index_cache: cache,
        }
    }

    /// Get the column names for this result set
    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Add a row to the result set
    pub fn add_row_values(&mut self, row_values: Vec<RowValues>) {
        self.results.push(CustomDbRow::with_cache(
            Arc::clone(&self.column_names),
            row_values,
            Arc::clone(&self.column_index_cache),
        ));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// First value of the first row, handy for `COUNT(*)` style statements.
    #[must_use]
    pub fn scalar(&self) -> Option<&RowValues> {
        self.results.first().and_then(|row| row.get_by_index(0))
    }
}
