//! Canonical statements and the call shapes that produce them.
//!
//! Every way of handing SQL to a client ends up as one [`Statement`]:
//! - plain SQL with no parameters (`"SELECT 1"`),
//! - SQL plus positional arguments ([`Statement::from_args`]),
//! - SQL plus a single name/value map ([`Statement::from_args`] / [`Statement::named`]),
//! - template calls built with [`sql!`](crate::sql) where every `{}` slot binds positionally,
//! - queries compiled by a query builder ([`CompiledQuery`]).

use std::collections::BTreeMap;
use std::fmt::Write;

mod scanner;

use scanner::{Placeholder, scan_placeholders, split_template_slots};

use crate::error::SqlocalError;
use crate::types::RowValues;

/// Parameters bound to a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementParams {
    /// Bound in order to `?` / `?NNN` placeholders.
    Positional(Vec<RowValues>),
    /// Bound by placeholder token (prefix included, e.g. `:name`).
    Named(Vec<(String, RowValues)>),
}

impl StatementParams {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            StatementParams::Positional(values) => values.is_empty(),
            StatementParams::Named(pairs) => pairs.is_empty(),
        }
    }
}

impl Default for StatementParams {
    fn default() -> Self {
        StatementParams::Positional(Vec::new())
    }
}

/// A SQL string and its parameters. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: StatementParams,
}

/// One argument of a `(sql, args...)` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Value(RowValues),
    Map(BTreeMap<String, RowValues>),
}

/// SQL and parameters produced by a query builder.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSql {
    pub sql: String,
    pub params: Vec<RowValues>,
}

/// Implemented by query-builder objects that can compile themselves to SQL.
pub trait CompiledQuery {
    fn compile(&self) -> CompiledSql;
}

impl Statement {
    /// Statement without parameters.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Statement {
            sql: sql.into(),
            params: StatementParams::default(),
        }
    }

    #[must_use]
    pub fn positional(sql: impl Into<String>, params: Vec<RowValues>) -> Self {
        Statement {
            sql: sql.into(),
            params: StatementParams::Positional(params),
        }
    }

    /// Bind named parameters.
    ///
    /// Only names that appear as placeholders in the SQL text are kept; extra map keys are
    /// dropped so one map can be reused across statements. Keys may be given with or
    /// without their `:`/`@`/`$` prefix.
    #[must_use]
    pub fn named(sql: impl Into<String>, values: &BTreeMap<String, RowValues>) -> Self {
        let sql = sql.into();
        let mut bound: Vec<(String, RowValues)> = Vec::new();
        for placeholder in scan_placeholders(&sql) {
            let Placeholder::Named { token, name } = placeholder else {
                continue;
            };
            if bound.iter().any(|(existing, _)| *existing == token) {
                continue;
            }
            if let Some(value) = values.get(&name).or_else(|| values.get(&token)) {
                bound.push((token, value.clone()));
            }
        }
        Statement {
            sql,
            params: StatementParams::Named(bound),
        }
    }

    /// Normalize a `(sql, args...)` call.
    ///
    /// A single map argument means named parameters; anything else is positional.
    ///
    /// # Errors
    /// Returns [`SqlocalError::InvalidStatement`] when a map is mixed with other arguments.
    pub fn from_args(sql: impl Into<String>, args: Vec<SqlArg>) -> Result<Self, SqlocalError> {
        let sql = sql.into();
        if let [SqlArg::Map(values)] = args.as_slice() {
            return Ok(Self::named(sql, values));
        }
        let mut positional = Vec::with_capacity(args.len());
        for (idx, arg) in args.into_iter().enumerate() {
            match arg {
                SqlArg::Value(value) => positional.push(value),
                SqlArg::Map(_) => {
                    return Err(SqlocalError::InvalidStatement(format!(
                        "argument {} is a named-parameter map; a map must be the only argument",
                        idx + 1
                    )));
                }
            }
        }
        Ok(Self::positional(sql, positional))
    }

    /// Build a statement from template fragments separated by interpolated values.
    ///
    /// Each value is bound positionally with `?`. Named placeholders (`:x`, `@x`, `$x`) and
    /// numbered placeholders (`?1`) are rejected in the fragments.
    ///
    /// # Errors
    /// Returns [`SqlocalError::InvalidStatement`] for forbidden placeholder syntax or a
    /// fragment/value count mismatch.
    pub fn from_template<S: AsRef<str>>(
        fragments: &[S],
        values: Vec<RowValues>,
    ) -> Result<Self, SqlocalError> {
        if fragments.len() != values.len() + 1 {
            return Err(SqlocalError::InvalidStatement(format!(
                "template has {} fragments for {} values",
                fragments.len(),
                values.len()
            )));
        }
        let joined = fragments
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("?");
        for placeholder in scan_placeholders(&joined) {
            match placeholder {
                Placeholder::Named { token, .. } => {
                    return Err(SqlocalError::InvalidStatement(format!(
                        "named parameter `{token}` is not allowed in a template; interpolate the value instead"
                    )));
                }
                Placeholder::Numbered(token) => {
                    return Err(SqlocalError::InvalidStatement(format!(
                        "numbered parameter `{token}` is not allowed in a template; interpolate the value instead"
                    )));
                }
                Placeholder::Anonymous => {}
            }
        }
        Ok(Self::positional(joined, values))
    }

    /// Split a `{}`-slotted template string and bind `values` to the slots.
    ///
    /// `{}` inside string literals, quoted identifiers and comments is left as text.
    ///
    /// # Errors
    /// Same as [`Statement::from_template`].
    pub fn from_template_str(template: &str, values: Vec<RowValues>) -> Result<Self, SqlocalError> {
        let fragments = split_template_slots(template);
        Self::from_template(&fragments, values)
    }

    #[must_use]
    pub fn from_compiled(query: &dyn CompiledQuery) -> Self {
        let CompiledSql { sql, params } = query.compile();
        Self::positional(sql, params)
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn params(&self) -> &StatementParams {
        &self.params
    }

    /// Key identifying the same SQL text with the same effective parameters.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut key = self.sql.clone();
        key.push('\u{0}');
        let _ = write!(key, "{:?}", self.params);
        key
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

impl From<CompiledSql> for Statement {
    fn from(compiled: CompiledSql) -> Self {
        Statement::positional(compiled.sql, compiled.params)
    }
}

impl From<RowValues> for SqlArg {
    fn from(value: RowValues) -> Self {
        SqlArg::Value(value)
    }
}

impl From<BTreeMap<String, RowValues>> for SqlArg {
    fn from(values: BTreeMap<String, RowValues>) -> Self {
        SqlArg::Map(values)
    }
}

macro_rules! impl_sql_arg_from_value {
    ($($ty:ty),*) => {
        $(impl From<$ty> for SqlArg {
            fn from(value: $ty) -> Self {
                SqlArg::Value(RowValues::from(value))
            }
        })*
    };
}

impl_sql_arg_from_value!(i64, i32, f64, bool, &str, String, Vec<u8>);

/// Template-style statement: every `{}` in the literal binds the next value positionally.
///
/// ```rust
/// use sqlocal::sql;
///
/// let name = "apples";
/// let statement = sql!("SELECT * FROM groceries WHERE name = {} LIMIT {}", name, 5).unwrap();
/// assert_eq!(statement.sql(), "SELECT * FROM groceries WHERE name = ? LIMIT ?");
/// ```
#[macro_export]
macro_rules! sql {
    ($template:literal $(, $value:expr)* $(,)?) => {
        $crate::statement::Statement::from_template_str(
            $template,
            vec![$($crate::types::RowValues::from($value)),*],
        )
    };
}
